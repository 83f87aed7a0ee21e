//! JSON gateway for the coordination RPC API.
//!
//! Every `/api/v1` route decodes its path, query or JSON body into the
//! matching RPC request, calls [`CoordinationApi`] in-process, and encodes the
//! response as JSON. RPC failures become an HTTP status plus a
//! `{"code": <grpc code>, "message": ..}` body.
//!
//! | Route | RPC |
//! |-------|-----|
//! | `GET /api/v1/namespace` | `ListNamespaces` |
//! | `GET /api/v1/namespace/{name}` | `GetNamespace` |
//! | `POST /api/v1/namespace` | `CreateNamespace` |
//! | `POST /api/v1/namespace/{old}/rename/{new}` | `RenameNamespace` |
//! | `DELETE /api/v1/namespace/{name}` | `DeleteNamespace` |
//! | `POST /api/v1/preauthkey` | `CreatePreAuthKey` |
//! | `GET /api/v1/preauthkey?namespace=` | `ListPreAuthKeys` |
//! | `POST /api/v1/preauthkey/expire` | `ExpirePreAuthKey` |
//! | `POST /api/v1/machine/register?namespace=&key=` | `RegisterMachine` |
//! | `GET /api/v1/machine?namespace=` | `ListMachines` |
//! | `DELETE /api/v1/machine/{id}` | `DeleteMachine` |

use std::future::Future;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tonic::{Code, Request, Status};

use crate::rpc::{
    CoordinationApi, CoordinationService, CreateNamespaceRequest, CreateNamespaceResponse,
    CreatePreAuthKeyRequest, CreatePreAuthKeyResponse, DeleteMachineRequest,
    DeleteMachineResponse, DeleteNamespaceRequest, DeleteNamespaceResponse,
    ExpirePreAuthKeyRequest, ExpirePreAuthKeyResponse, GetNamespaceRequest, GetNamespaceResponse,
    ListMachinesRequest, ListMachinesResponse, ListNamespacesRequest, ListNamespacesResponse,
    ListPreAuthKeysRequest, ListPreAuthKeysResponse, RegisterMachineRequest,
    RegisterMachineResponse, RenameNamespaceRequest, RenameNamespaceResponse,
};

/// An RPC failure rendered as an HTTP response.
#[derive(Debug)]
pub struct GatewayError(pub Status);

pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.0.code() as i32,
            "message": self.0.message(),
        });
        (http_status(self.0.code()), Json(body)).into_response()
    }
}

type GatewayResult<T> = Result<Json<T>, GatewayError>;

async fn call<T>(
    rpc: impl Future<Output = Result<tonic::Response<T>, Status>>,
) -> GatewayResult<T> {
    rpc.await
        .map(|response| Json(response.into_inner()))
        .map_err(GatewayError)
}

pub fn router(api: CoordinationApi) -> Router {
    Router::new()
        .route("/api/v1/namespace", get(list_namespaces).post(create_namespace))
        .route("/api/v1/namespace/{name}", get(get_namespace).delete(delete_namespace))
        .route("/api/v1/namespace/{old}/rename/{new}", post(rename_namespace))
        .route("/api/v1/preauthkey", get(list_pre_auth_keys).post(create_pre_auth_key))
        .route("/api/v1/preauthkey/expire", post(expire_pre_auth_key))
        .route("/api/v1/machine", get(list_machines))
        .route("/api/v1/machine/register", post(register_machine))
        .route("/api/v1/machine/{id}", axum::routing::delete(delete_machine))
        .with_state(api)
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_namespaces(State(api): State<CoordinationApi>) -> GatewayResult<ListNamespacesResponse> {
    call(api.list_namespaces(Request::new(ListNamespacesRequest {}))).await
}

async fn get_namespace(
    State(api): State<CoordinationApi>,
    Path(name): Path<String>,
) -> GatewayResult<GetNamespaceResponse> {
    call(api.get_namespace(Request::new(GetNamespaceRequest { name }))).await
}

async fn create_namespace(
    State(api): State<CoordinationApi>,
    Json(req): Json<CreateNamespaceRequest>,
) -> GatewayResult<CreateNamespaceResponse> {
    call(api.create_namespace(Request::new(req))).await
}

async fn rename_namespace(
    State(api): State<CoordinationApi>,
    Path((old_name, new_name)): Path<(String, String)>,
) -> GatewayResult<RenameNamespaceResponse> {
    call(api.rename_namespace(Request::new(RenameNamespaceRequest { old_name, new_name }))).await
}

async fn delete_namespace(
    State(api): State<CoordinationApi>,
    Path(name): Path<String>,
) -> GatewayResult<DeleteNamespaceResponse> {
    call(api.delete_namespace(Request::new(DeleteNamespaceRequest { name }))).await
}

async fn create_pre_auth_key(
    State(api): State<CoordinationApi>,
    Json(req): Json<CreatePreAuthKeyRequest>,
) -> GatewayResult<CreatePreAuthKeyResponse> {
    call(api.create_pre_auth_key(Request::new(req))).await
}

async fn list_pre_auth_keys(
    State(api): State<CoordinationApi>,
    Query(req): Query<ListPreAuthKeysRequest>,
) -> GatewayResult<ListPreAuthKeysResponse> {
    call(api.list_pre_auth_keys(Request::new(req))).await
}

async fn expire_pre_auth_key(
    State(api): State<CoordinationApi>,
    Json(req): Json<ExpirePreAuthKeyRequest>,
) -> GatewayResult<ExpirePreAuthKeyResponse> {
    call(api.expire_pre_auth_key(Request::new(req))).await
}

async fn register_machine(
    State(api): State<CoordinationApi>,
    Query(req): Query<RegisterMachineRequest>,
) -> GatewayResult<RegisterMachineResponse> {
    call(api.register_machine(Request::new(req))).await
}

async fn list_machines(
    State(api): State<CoordinationApi>,
    Query(req): Query<ListMachinesRequest>,
) -> GatewayResult<ListMachinesResponse> {
    call(api.list_machines(Request::new(req))).await
}

async fn delete_machine(
    State(api): State<CoordinationApi>,
    Path(machine_id): Path<u64>,
) -> GatewayResult<DeleteMachineResponse> {
    call(api.delete_machine(Request::new(DeleteMachineRequest { machine_id }))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistrationSettings;
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::sync::Arc;

    async fn spawn_gateway() -> String {
        let api = CoordinationApi::new(Arc::new(MemoryStore::new()), RegistrationSettings::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(api)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(http_status(Code::FailedPrecondition), StatusCode::PRECONDITION_FAILED);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(http_status(Code::Unavailable), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_namespace_routes() {
        let base = spawn_gateway().await;
        let client = reqwest::Client::new();

        let created = client
            .post(format!("{base}/api/v1/namespace"))
            .json(&json!({"name": "acme"}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), reqwest::StatusCode::OK);
        let body: Value = created.json().await.unwrap();
        assert_eq!(body["namespace"]["name"], "acme");

        let conflict = client
            .post(format!("{base}/api/v1/namespace"))
            .json(&json!({"name": "acme"}))
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), reqwest::StatusCode::CONFLICT);
        let body: Value = conflict.json().await.unwrap();
        assert_eq!(body["code"], Code::AlreadyExists as i32);
        assert!(body["message"].as_str().unwrap().contains("acme"));

        let renamed = client
            .post(format!("{base}/api/v1/namespace/acme/rename/widgets"))
            .send()
            .await
            .unwrap();
        assert_eq!(renamed.status(), reqwest::StatusCode::OK);

        let listed: Value = client
            .get(format!("{base}/api/v1/namespace"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["namespaces"][0]["name"], "widgets");

        let missing = client
            .get(format!("{base}/api/v1/namespace/acme"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pre_auth_key_routes() {
        let base = spawn_gateway().await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/api/v1/namespace"))
            .json(&json!({"name": "acme"}))
            .send()
            .await
            .unwrap();

        let created: Value = client
            .post(format!("{base}/api/v1/preauthkey"))
            .json(&json!({"namespace": "acme", "reusable": true}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let key = created["pre_auth_key"]["key"].as_str().unwrap().to_string();

        let expired = client
            .post(format!("{base}/api/v1/preauthkey/expire"))
            .json(&json!({"namespace": "acme", "key": key}))
            .send()
            .await
            .unwrap();
        assert_eq!(expired.status(), reqwest::StatusCode::OK);

        let listed: Value = client
            .get(format!("{base}/api/v1/preauthkey?namespace=acme"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["pre_auth_keys"].as_array().unwrap().len(), 1);
        assert!(listed["pre_auth_keys"][0]["expiration"].is_i64());
    }

    #[tokio::test]
    async fn test_register_unknown_machine_is_not_found() {
        let base = spawn_gateway().await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}/api/v1/namespace"))
            .json(&json!({"name": "acme"}))
            .send()
            .await
            .unwrap();

        let key = "ab".repeat(32);
        let response = client
            .post(format!("{base}/api/v1/machine/register?namespace=acme&key={key}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let bad_id = client
            .delete(format!("{base}/api/v1/machine/77"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_id.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
