//! # Coordination RPC
//!
//! The administrative API (`meshward.v1.CoordinationService`) served over
//! gRPC on the shared port, and through [`crate::gateway`] as JSON under
//! `/api/v1`.
//!
//! ## Messages
//!
//! Request and response types are hand-written `prost` messages that also
//! derive `serde`, so the gateway can speak JSON with the same structs.
//! Timestamps are Unix seconds.
//!
//! ## Publishing Changes
//!
//! Mutations that change what nodes see do not touch the topology tracker
//! directly. They leave a marker with [`NodeStore::request_namespace_update`]
//! and the pending-update watcher publishes it on its next tick, exactly as
//! for any other out-of-band writer.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::config::RegistrationSettings;
use crate::identity::MachineKey;
use crate::protocols::NodeStore;
use crate::store::{self, RegisterMethod, StoreError};

include!(concat!(env!("OUT_DIR"), "/meshward.v1.CoordinationService.rs"));

pub use coordination_service_client::CoordinationServiceClient;
pub use coordination_service_server::{CoordinationService, CoordinationServiceServer};

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Namespace {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PreAuthKey {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(string, tag = "3")]
    pub key: String,
    #[prost(bool, tag = "4")]
    pub reusable: bool,
    #[prost(bool, tag = "5")]
    pub ephemeral: bool,
    #[prost(bool, tag = "6")]
    pub used: bool,
    #[prost(int64, optional, tag = "7")]
    pub expiration: Option<i64>,
    #[prost(int64, tag = "8")]
    pub created_at: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Machine {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub machine_key: String,
    #[prost(string, tag = "3")]
    pub node_key: String,
    #[prost(string, tag = "4")]
    pub hostname: String,
    #[prost(string, tag = "5")]
    pub namespace: String,
    #[prost(string, tag = "6")]
    pub ip_address: String,
    #[prost(bool, tag = "7")]
    pub registered: bool,
    #[prost(string, tag = "8")]
    pub register_method: String,
    #[prost(bool, tag = "9")]
    pub ephemeral: bool,
    #[prost(int64, optional, tag = "10")]
    pub last_seen: Option<i64>,
    #[prost(int64, optional, tag = "11")]
    pub expiry: Option<i64>,
}

impl From<&store::Namespace> for Namespace {
    fn from(ns: &store::Namespace) -> Self {
        Self {
            id: ns.id,
            name: ns.name.clone(),
            created_at: ns.created_at.timestamp(),
        }
    }
}

impl From<&store::PreAuthKey> for PreAuthKey {
    fn from(key: &store::PreAuthKey) -> Self {
        Self {
            id: key.id,
            namespace: key.namespace.clone(),
            key: key.key.clone(),
            reusable: key.reusable,
            ephemeral: key.ephemeral,
            used: key.used,
            expiration: key.expiration.map(|at| at.timestamp()),
            created_at: key.created_at.timestamp(),
        }
    }
}

impl From<&store::Machine> for Machine {
    fn from(m: &store::Machine) -> Self {
        let register_method = match m.register_method {
            RegisterMethod::Unspecified => "unspecified",
            RegisterMethod::AuthKey => "authkey",
            RegisterMethod::Cli => "cli",
            RegisterMethod::Oidc => "oidc",
        };
        Self {
            id: m.id,
            machine_key: m.machine_key.to_hex(),
            node_key: m.node_key.clone(),
            hostname: m.hostname.clone(),
            namespace: m.namespace.clone(),
            ip_address: m.ip_address.map(|ip| ip.to_string()).unwrap_or_default(),
            registered: m.registered,
            register_method: register_method.to_string(),
            ephemeral: m.is_ephemeral(),
            last_seen: m.last_seen.map(|at| at.timestamp()),
            expiry: m.expiry.map(|at| at.timestamp()),
        }
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetNamespaceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GetNamespaceResponse {
    #[prost(message, optional, tag = "1")]
    pub namespace: Option<Namespace>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateNamespaceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateNamespaceResponse {
    #[prost(message, optional, tag = "1")]
    pub namespace: Option<Namespace>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameNamespaceRequest {
    #[prost(string, tag = "1")]
    pub old_name: String,
    #[prost(string, tag = "2")]
    pub new_name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameNamespaceResponse {
    #[prost(message, optional, tag = "1")]
    pub namespace: Option<Namespace>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteNamespaceRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct DeleteNamespaceResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ListNamespacesRequest {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListNamespacesResponse {
    #[prost(message, repeated, tag = "1")]
    pub namespaces: Vec<Namespace>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatePreAuthKeyRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(bool, tag = "2")]
    pub reusable: bool,
    #[prost(bool, tag = "3")]
    pub ephemeral: bool,
    #[prost(int64, optional, tag = "4")]
    pub expiration: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatePreAuthKeyResponse {
    #[prost(message, optional, tag = "1")]
    pub pre_auth_key: Option<PreAuthKey>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListPreAuthKeysRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListPreAuthKeysResponse {
    #[prost(message, repeated, tag = "1")]
    pub pre_auth_keys: Vec<PreAuthKey>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirePreAuthKeyRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExpirePreAuthKeyResponse {}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMachineRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
    /// Hex machine key of a pending machine.
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMachineResponse {
    #[prost(message, optional, tag = "1")]
    pub machine: Option<Machine>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListMachinesRequest {
    #[prost(string, tag = "1")]
    pub namespace: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListMachinesResponse {
    #[prost(message, repeated, tag = "1")]
    pub machines: Vec<Machine>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteMachineRequest {
    #[prost(uint64, tag = "1")]
    pub machine_id: u64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct DeleteMachineResponse {}

// ============================================================================
// Service
// ============================================================================

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound(_) => Status::not_found(message),
            StoreError::AlreadyExists(_) => Status::already_exists(message),
            StoreError::InvalidArgument(_) => Status::invalid_argument(message),
            StoreError::NotEmpty(_) => Status::failed_precondition(message),
            StoreError::Unavailable(_) => Status::unavailable(message),
        }
    }
}

/// [`CoordinationService`] backed by a [`NodeStore`].
#[derive(Clone)]
pub struct CoordinationApi {
    store: Arc<dyn NodeStore>,
    registration: RegistrationSettings,
}

impl CoordinationApi {
    pub fn new(store: Arc<dyn NodeStore>, registration: RegistrationSettings) -> Self {
        Self { store, registration }
    }

    pub fn into_service(self) -> CoordinationServiceServer<Self> {
        CoordinationServiceServer::new(self)
    }

    async fn publish(&self, namespace: &str) {
        if let Err(e) = self.store.request_namespace_update(namespace).await {
            warn!(namespace, error = %e, "failed to queue namespace update");
        }
    }
}

impl std::fmt::Debug for CoordinationApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationApi").finish_non_exhaustive()
    }
}

fn timestamp(secs: i64, field: &str) -> Result<DateTime<Utc>, Status> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Status::invalid_argument(format!("{field} out of range")))
}

#[tonic::async_trait]
impl CoordinationService for CoordinationApi {
    async fn get_namespace(
        &self,
        request: Request<GetNamespaceRequest>,
    ) -> Result<Response<GetNamespaceResponse>, Status> {
        let ns = self.store.get_namespace(&request.into_inner().name).await?;
        Ok(Response::new(GetNamespaceResponse {
            namespace: Some((&ns).into()),
        }))
    }

    async fn create_namespace(
        &self,
        request: Request<CreateNamespaceRequest>,
    ) -> Result<Response<CreateNamespaceResponse>, Status> {
        let ns = self.store.create_namespace(&request.into_inner().name).await?;
        info!(namespace = %ns.name, "namespace created");
        Ok(Response::new(CreateNamespaceResponse {
            namespace: Some((&ns).into()),
        }))
    }

    async fn rename_namespace(
        &self,
        request: Request<RenameNamespaceRequest>,
    ) -> Result<Response<RenameNamespaceResponse>, Status> {
        let req = request.into_inner();
        let ns = self.store.rename_namespace(&req.old_name, &req.new_name).await?;
        info!(from = %req.old_name, to = %ns.name, "namespace renamed");
        self.publish(&ns.name).await;
        Ok(Response::new(RenameNamespaceResponse {
            namespace: Some((&ns).into()),
        }))
    }

    async fn delete_namespace(
        &self,
        request: Request<DeleteNamespaceRequest>,
    ) -> Result<Response<DeleteNamespaceResponse>, Status> {
        let name = request.into_inner().name;
        self.store.delete_namespace(&name).await?;
        info!(namespace = %name, "namespace deleted");
        Ok(Response::new(DeleteNamespaceResponse {}))
    }

    async fn list_namespaces(
        &self,
        _request: Request<ListNamespacesRequest>,
    ) -> Result<Response<ListNamespacesResponse>, Status> {
        let namespaces = self.store.list_namespaces().await?;
        Ok(Response::new(ListNamespacesResponse {
            namespaces: namespaces.iter().map(Namespace::from).collect(),
        }))
    }

    async fn create_pre_auth_key(
        &self,
        request: Request<CreatePreAuthKeyRequest>,
    ) -> Result<Response<CreatePreAuthKeyResponse>, Status> {
        let req = request.into_inner();
        let expiration = req
            .expiration
            .map(|secs| timestamp(secs, "expiration"))
            .transpose()?;
        let key = self
            .store
            .create_pre_auth_key(&req.namespace, req.reusable, req.ephemeral, expiration)
            .await?;
        info!(namespace = %req.namespace, reusable = key.reusable, ephemeral = key.ephemeral, "pre-auth key created");
        Ok(Response::new(CreatePreAuthKeyResponse {
            pre_auth_key: Some((&key).into()),
        }))
    }

    async fn list_pre_auth_keys(
        &self,
        request: Request<ListPreAuthKeysRequest>,
    ) -> Result<Response<ListPreAuthKeysResponse>, Status> {
        let keys = self.store.list_pre_auth_keys(&request.into_inner().namespace).await?;
        Ok(Response::new(ListPreAuthKeysResponse {
            pre_auth_keys: keys.iter().map(PreAuthKey::from).collect(),
        }))
    }

    async fn expire_pre_auth_key(
        &self,
        request: Request<ExpirePreAuthKeyRequest>,
    ) -> Result<Response<ExpirePreAuthKeyResponse>, Status> {
        let req = request.into_inner();
        self.store.expire_pre_auth_key(&req.namespace, &req.key).await?;
        Ok(Response::new(ExpirePreAuthKeyResponse {}))
    }

    async fn register_machine(
        &self,
        request: Request<RegisterMachineRequest>,
    ) -> Result<Response<RegisterMachineResponse>, Status> {
        let req = request.into_inner();
        let key: MachineKey = req
            .key
            .parse()
            .map_err(|_| Status::invalid_argument("machine key must be 64 hex characters"))?;
        self.store.get_namespace(&req.namespace).await?;

        let mut machine = self.store.get_machine(&key).await?;
        if machine.registered && machine.namespace == req.namespace && !machine.is_expired(Utc::now()) {
            return Err(Status::failed_precondition(format!(
                "machine {} is already registered in {}",
                key.short(),
                req.namespace
            )));
        }
        let previous = std::mem::replace(&mut machine.namespace, req.namespace.clone());
        machine.registered = true;
        machine.register_method = RegisterMethod::Cli;
        machine.expiry = TimeDelta::from_std(self.registration.default_duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        let machine = self.store.save_machine(machine).await?;

        info!(machine = %machine.hostname, namespace = %machine.namespace, "machine registered");
        if !previous.is_empty() && previous != machine.namespace {
            self.publish(&previous).await;
        }
        self.publish(&machine.namespace).await;
        Ok(Response::new(RegisterMachineResponse {
            machine: Some((&machine).into()),
        }))
    }

    async fn list_machines(
        &self,
        request: Request<ListMachinesRequest>,
    ) -> Result<Response<ListMachinesResponse>, Status> {
        let machines = self
            .store
            .list_machines_in_namespace(&request.into_inner().namespace)
            .await?;
        Ok(Response::new(ListMachinesResponse {
            machines: machines.iter().map(Machine::from).collect(),
        }))
    }

    async fn delete_machine(
        &self,
        request: Request<DeleteMachineRequest>,
    ) -> Result<Response<DeleteMachineResponse>, Status> {
        let id = request.into_inner().machine_id;
        let machine = self.store.get_machine_by_id(id).await?;
        self.store.delete_machine(id, false).await?;
        info!(machine = %machine.hostname, namespace = %machine.namespace, "machine deleted");
        if !machine.namespace.is_empty() {
            self.publish(&machine.namespace).await;
        }
        Ok(Response::new(DeleteMachineResponse {}))
    }
}
