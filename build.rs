//! Generates the `meshward.v1.CoordinationService` server and client.
//!
//! Messages are plain `prost` structs defined in `src/rpc.rs`, so the service
//! is described here with the manual builder and no `.proto` compiler is needed.

use tonic_build::manual::{Builder, Method, Service};

const METHODS: &[(&str, &str, &str)] = &[
    ("get_namespace", "GetNamespace", "GetNamespace"),
    ("create_namespace", "CreateNamespace", "CreateNamespace"),
    ("rename_namespace", "RenameNamespace", "RenameNamespace"),
    ("delete_namespace", "DeleteNamespace", "DeleteNamespace"),
    ("list_namespaces", "ListNamespaces", "ListNamespaces"),
    ("create_pre_auth_key", "CreatePreAuthKey", "CreatePreAuthKey"),
    ("list_pre_auth_keys", "ListPreAuthKeys", "ListPreAuthKeys"),
    ("expire_pre_auth_key", "ExpirePreAuthKey", "ExpirePreAuthKey"),
    ("register_machine", "RegisterMachine", "RegisterMachine"),
    ("list_machines", "ListMachines", "ListMachines"),
    ("delete_machine", "DeleteMachine", "DeleteMachine"),
];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let mut service = Service::builder()
        .name("CoordinationService")
        .package("meshward.v1");

    for (name, route, message) in METHODS {
        service = service.method(
            Method::builder()
                .name(name)
                .route_name(route)
                .input_type(format!("crate::rpc::{message}Request"))
                .output_type(format!("crate::rpc::{message}Response"))
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        );
    }

    Builder::new().compile(&[service.build()]);
}
