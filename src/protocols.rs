//! Collaborator trait definitions for the coordination engine.
//!
//! The engine consumes storage, identity-provider login and access-policy
//! evaluation through the narrow traits below. Implementations live
//! elsewhere ([`crate::store::MemoryStore`], [`crate::oidc::OidcProvider`])
//! or are supplied by the embedding application.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Storage | [`NodeStore`] | Namespaces, machines, pre-auth keys, pending-update markers |
//! | Login | [`IdentityProvider`] | Browser login URL and authorization-code exchange |
//! | Policy | [`AccessPolicy`] | Which peers a machine may see |
//!
//! Every [`NodeStore`] call is treated as one atomic external operation; the
//! engine never holds a lock across calls.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::identity::MachineKey;
use crate::store::{Machine, Namespace, PreAuthKey, StoreError};

/// Persistent state for namespaces, machines and pre-auth keys.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError>;

    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError>;

    async fn create_namespace(&self, name: &str) -> Result<Namespace, StoreError>;

    /// Rename a namespace, carrying its machines and keys along.
    async fn rename_namespace(&self, old: &str, new: &str) -> Result<Namespace, StoreError>;

    /// Delete an empty namespace. Fails with [`StoreError::NotEmpty`] otherwise.
    async fn delete_namespace(&self, name: &str) -> Result<(), StoreError>;

    /// Live (not soft-deleted) machines of a namespace, including pending ones.
    async fn list_machines_in_namespace(&self, namespace: &str) -> Result<Vec<Machine>, StoreError>;

    async fn get_machine(&self, key: &MachineKey) -> Result<Machine, StoreError>;

    async fn get_machine_by_id(&self, id: u64) -> Result<Machine, StoreError>;

    /// Insert (`id == 0`) or replace a machine record, returning the stored value.
    async fn save_machine(&self, machine: Machine) -> Result<Machine, StoreError>;

    /// Delete a machine. `hard` bypasses soft delete and removes the record outright.
    async fn delete_machine(&self, id: u64, hard: bool) -> Result<(), StoreError>;

    async fn create_pre_auth_key(
        &self,
        namespace: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<PreAuthKey, StoreError>;

    async fn list_pre_auth_keys(&self, namespace: &str) -> Result<Vec<PreAuthKey>, StoreError>;

    async fn get_pre_auth_key(&self, key: &str) -> Result<PreAuthKey, StoreError>;

    /// Consume a pre-auth key for one registration, atomically with the check
    /// that it is unexpired and, unless reusable, unused. A key that fails the
    /// check yields [`StoreError::InvalidArgument`].
    async fn mark_pre_auth_key_used(&self, key: &str) -> Result<PreAuthKey, StoreError>;

    /// Set the key's expiration to now.
    async fn expire_pre_auth_key(&self, namespace: &str, key: &str) -> Result<PreAuthKey, StoreError>;

    /// Leave an out-of-band "topology changed" marker for `namespace`.
    async fn request_namespace_update(&self, namespace: &str) -> Result<(), StoreError>;

    /// Drain every outstanding marker, returning the affected namespaces.
    async fn take_pending_updates(&self) -> Result<Vec<String>, StoreError>;
}

/// Claims extracted from a completed identity-provider login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityClaims {
    pub subject: String,
    pub email: String,
}

/// Browser-based login against an external identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// URL the browser is sent to; `state` comes back on the callback.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorization code for the user's claims.
    async fn exchange(&self, code: &str) -> Result<IdentityClaims>;
}

/// Peer visibility decision. Rule syntax and evaluation are the implementor's concern.
pub trait AccessPolicy: Send + Sync + 'static {
    fn allows(&self, from: &Machine, to: &Machine) -> bool;
}

/// Every machine in a namespace may see every other one.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _from: &Machine, _to: &Machine) -> bool {
        true
    }
}
