//! # Node Store
//!
//! Domain records ([`Namespace`], [`Machine`], [`PreAuthKey`]) and
//! [`MemoryStore`], the in-process [`NodeStore`] backend selected by
//! `store_backend = "memory"`.
//!
//! ## Soft vs Hard Delete
//!
//! Administrative machine deletion is soft: the record keeps its id and
//! gains a `deleted_at` stamp, and is invisible to every read. Ephemeral
//! expiry deletes hard, removing the record outright.
//!
//! ## Addressing
//!
//! Each machine receives one IPv4 address from `100.64.0.0/10` the first time
//! it is saved in the registered state. Addresses are never reused while the
//! owning record exists.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::identity::MachineKey;
use crate::protocols::NodeStore;

/// Longest accepted namespace name (one DNS label).
pub const MAX_NAMESPACE_NAME_LEN: usize = 63;

/// Random bytes in a pre-auth key before hex encoding.
const PRE_AUTH_KEY_BYTES: usize = 24;

/// First address handed out, `100.64.0.1`.
const ADDRESS_BASE: u32 = u32::from_be_bytes([100, 64, 0, 0]);

/// Size of `100.64.0.0/10`.
const ADDRESS_SPACE: u32 = 1 << 22;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} is not empty")]
    NotEmpty(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAuthKey {
    pub id: u64,
    pub key: String,
    pub namespace: String,
    pub reusable: bool,
    pub ephemeral: bool,
    pub used: bool,
    pub expiration: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PreAuthKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|at| at <= now)
    }

    /// Whether the key may admit one more registration at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && (self.reusable || !self.used)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterMethod {
    Unspecified,
    AuthKey,
    Cli,
    Oidc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u64,
    pub machine_key: MachineKey,
    pub node_key: String,
    pub hostname: String,
    /// Empty while the machine is pending registration.
    pub namespace: String,
    pub ip_address: Option<Ipv4Addr>,
    pub registered: bool,
    pub register_method: RegisterMethod,
    pub auth_key: Option<PreAuthKey>,
    pub endpoints: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Machine {
    /// A machine that has contacted the server but is not yet in any namespace.
    pub fn pending(machine_key: MachineKey, node_key: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: 0,
            machine_key,
            node_key: node_key.into(),
            hostname: hostname.into(),
            namespace: String::new(),
            ip_address: None,
            registered: false,
            register_method: RegisterMethod::Unspecified,
            auth_key: None,
            endpoints: Vec::new(),
            last_seen: None,
            expiry: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|at| at <= now)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.auth_key.as_ref().is_some_and(|key| key.ephemeral)
    }

    /// Ephemeral, seen at least once, and silent for longer than `timeout`.
    pub fn is_inactive_ephemeral(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        match self.last_seen {
            Some(last_seen) => {
                self.is_ephemeral()
                    && last_seen
                        .checked_add_signed(timeout)
                        .is_some_and(|deadline| now > deadline)
            }
            None => false,
        }
    }

    /// Name as shown to peers: `hostname.namespace.base_domain`.
    pub fn fqdn(&self, base_domain: &str) -> String {
        format!("{}.{}.{}", self.hostname, self.namespace, base_domain)
    }
}

pub fn validate_namespace_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAMESPACE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!(
            "namespace name {name:?} must be 1-{MAX_NAMESPACE_NAME_LEN} lowercase letters, digits, '-' or '.'"
        )))
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

#[derive(Default)]
struct Inner {
    next_id: u64,
    namespaces: BTreeMap<String, Namespace>,
    machines: BTreeMap<u64, Machine>,
    pre_auth_keys: BTreeMap<String, PreAuthKey>,
    pending_updates: BTreeSet<String>,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn require_namespace(&self, name: &str) -> Result<&Namespace, StoreError> {
        self.namespaces
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("namespace {name}")))
    }

    fn live_machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values().filter(|m| m.deleted_at.is_none())
    }

    fn allocate_address(&self) -> Result<Ipv4Addr, StoreError> {
        let used: BTreeSet<Ipv4Addr> = self.machines.values().filter_map(|m| m.ip_address).collect();
        (1..ADDRESS_SPACE - 1)
            .map(|offset| Ipv4Addr::from(ADDRESS_BASE + offset))
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| StoreError::Unavailable("address space exhausted".to_string()))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.namespaces.values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        let inner = self.inner.lock().await;
        inner.require_namespace(name).cloned()
    }

    async fn create_namespace(&self, name: &str) -> Result<Namespace, StoreError> {
        validate_namespace_name(name)?;
        let mut inner = self.inner.lock().await;
        if inner.namespaces.contains_key(name) {
            return Err(StoreError::AlreadyExists(format!("namespace {name}")));
        }
        let namespace = Namespace {
            id: inner.allocate_id(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.namespaces.insert(name.to_string(), namespace.clone());
        debug!(namespace = name, "namespace created");
        Ok(namespace)
    }

    async fn rename_namespace(&self, old: &str, new: &str) -> Result<Namespace, StoreError> {
        validate_namespace_name(new)?;
        let mut inner = self.inner.lock().await;
        inner.require_namespace(old)?;
        if inner.namespaces.contains_key(new) {
            return Err(StoreError::AlreadyExists(format!("namespace {new}")));
        }
        let mut namespace = inner
            .namespaces
            .remove(old)
            .ok_or_else(|| StoreError::NotFound(format!("namespace {old}")))?;
        namespace.name = new.to_string();
        inner.namespaces.insert(new.to_string(), namespace.clone());

        for machine in inner.machines.values_mut().filter(|m| m.namespace == old) {
            machine.namespace = new.to_string();
        }
        for key in inner.pre_auth_keys.values_mut().filter(|k| k.namespace == old) {
            key.namespace = new.to_string();
        }
        if inner.pending_updates.remove(old) {
            inner.pending_updates.insert(new.to_string());
        }
        Ok(namespace)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.require_namespace(name)?;
        if inner.live_machines().any(|m| m.namespace == name) {
            return Err(StoreError::NotEmpty(format!("namespace {name}")));
        }
        inner.namespaces.remove(name);
        inner.pre_auth_keys.retain(|_, key| key.namespace != name);
        inner.machines.retain(|_, m| m.namespace != name);
        inner.pending_updates.remove(name);
        Ok(())
    }

    async fn list_machines_in_namespace(&self, namespace: &str) -> Result<Vec<Machine>, StoreError> {
        let inner = self.inner.lock().await;
        inner.require_namespace(namespace)?;
        Ok(inner
            .live_machines()
            .filter(|m| m.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get_machine(&self, key: &MachineKey) -> Result<Machine, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .live_machines()
            .find(|m| m.machine_key == *key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("machine {}", key.short())))
    }

    async fn get_machine_by_id(&self, id: u64) -> Result<Machine, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .machines
            .get(&id)
            .filter(|m| m.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))
    }

    async fn save_machine(&self, mut machine: Machine) -> Result<Machine, StoreError> {
        let mut inner = self.inner.lock().await;
        if !machine.namespace.is_empty() {
            inner.require_namespace(&machine.namespace)?;
        }
        if inner
            .live_machines()
            .any(|m| m.machine_key == machine.machine_key && m.id != machine.id)
        {
            return Err(StoreError::AlreadyExists(format!(
                "machine {}",
                machine.machine_key.short()
            )));
        }
        if machine.id == 0 {
            machine.id = inner.allocate_id();
        } else if !inner.machines.contains_key(&machine.id) {
            return Err(StoreError::NotFound(format!("machine {}", machine.id)));
        }
        if machine.registered && machine.ip_address.is_none() {
            machine.ip_address = Some(inner.allocate_address()?);
        }
        inner.machines.insert(machine.id, machine.clone());
        Ok(machine)
    }

    async fn delete_machine(&self, id: u64, hard: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if hard {
            return inner
                .machines
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(format!("machine {id}")));
        }
        match inner.machines.get_mut(&id) {
            Some(machine) if machine.deleted_at.is_none() => {
                machine.deleted_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("machine {id}"))),
        }
    }

    async fn create_pre_auth_key(
        &self,
        namespace: &str,
        reusable: bool,
        ephemeral: bool,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<PreAuthKey, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.require_namespace(namespace)?;

        let mut secret = [0u8; PRE_AUTH_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut secret);
        let key = PreAuthKey {
            id: inner.allocate_id(),
            key: hex::encode(secret),
            namespace: namespace.to_string(),
            reusable,
            ephemeral,
            used: false,
            expiration,
            created_at: Utc::now(),
        };
        inner.pre_auth_keys.insert(key.key.clone(), key.clone());
        Ok(key)
    }

    async fn list_pre_auth_keys(&self, namespace: &str) -> Result<Vec<PreAuthKey>, StoreError> {
        let inner = self.inner.lock().await;
        inner.require_namespace(namespace)?;
        let mut keys: Vec<PreAuthKey> = inner
            .pre_auth_keys
            .values()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.id);
        Ok(keys)
    }

    async fn get_pre_auth_key(&self, key: &str) -> Result<PreAuthKey, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .pre_auth_keys
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("pre-auth key".to_string()))
    }

    async fn mark_pre_auth_key_used(&self, key: &str) -> Result<PreAuthKey, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .pre_auth_keys
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound("pre-auth key".to_string()))?;
        if !entry.is_usable(Utc::now()) {
            return Err(StoreError::InvalidArgument(
                "pre-auth key is expired or already used".to_string(),
            ));
        }
        entry.used = true;
        Ok(entry.clone())
    }

    async fn expire_pre_auth_key(&self, namespace: &str, key: &str) -> Result<PreAuthKey, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .pre_auth_keys
            .get_mut(key)
            .filter(|k| k.namespace == namespace)
            .ok_or_else(|| StoreError::NotFound("pre-auth key".to_string()))?;
        entry.expiration = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn request_namespace_update(&self, namespace: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.pending_updates.insert(namespace.to_string());
        Ok(())
    }

    async fn take_pending_updates(&self) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(std::mem::take(&mut inner.pending_updates).into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mkey(byte: u8) -> MachineKey {
        MachineKey::from_bytes([byte; 32])
    }

    fn registered(byte: u8, namespace: &str) -> Machine {
        let mut machine = Machine::pending(mkey(byte), format!("node-{byte}"), format!("host-{byte}"));
        machine.namespace = namespace.to_string();
        machine.registered = true;
        machine
    }

    #[test]
    fn test_namespace_name_validation() {
        assert!(validate_namespace_name("acme").is_ok());
        assert!(validate_namespace_name("team-1.example").is_ok());
        assert!(validate_namespace_name("").is_err());
        assert!(validate_namespace_name("Upper").is_err());
        assert!(validate_namespace_name("-lead").is_err());
        assert!(validate_namespace_name(&"a".repeat(64)).is_err());
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        assert_eq!(
            store.create_namespace("acme").await.unwrap_err(),
            StoreError::AlreadyExists("namespace acme".to_string())
        );

        let renamed = store.rename_namespace("acme", "globex").await.unwrap();
        assert_eq!(renamed.name, "globex");
        assert!(matches!(store.get_namespace("acme").await, Err(StoreError::NotFound(_))));

        store.delete_namespace("globex").await.unwrap();
        assert!(store.list_namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_namespace_refuses_live_machines() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        let machine = store.save_machine(registered(1, "acme")).await.unwrap();

        assert!(matches!(store.delete_namespace("acme").await, Err(StoreError::NotEmpty(_))));

        store.delete_machine(machine.id, false).await.unwrap();
        store.delete_namespace("acme").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_moves_machines_and_keys() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        store.save_machine(registered(1, "acme")).await.unwrap();
        let key = store.create_pre_auth_key("acme", false, false, None).await.unwrap();

        store.rename_namespace("acme", "globex").await.unwrap();
        assert_eq!(store.list_machines_in_namespace("globex").await.unwrap().len(), 1);
        assert_eq!(store.get_pre_auth_key(&key.key).await.unwrap().namespace, "globex");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_record() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        let machine = store.save_machine(registered(1, "acme")).await.unwrap();

        store.delete_machine(machine.id, false).await.unwrap();
        assert!(store.get_machine(&mkey(1)).await.is_err());
        assert!(store.get_machine_by_id(machine.id).await.is_err());
        assert!(store.delete_machine(machine.id, false).await.is_err());
        // Soft-deleted records may still be purged.
        store.delete_machine(machine.id, true).await.unwrap();
        assert!(store.delete_machine(machine.id, true).await.is_err());
    }

    #[tokio::test]
    async fn test_machine_key_unique_among_live_records() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        let first = store.save_machine(registered(1, "acme")).await.unwrap();
        assert!(matches!(
            store.save_machine(registered(1, "acme")).await,
            Err(StoreError::AlreadyExists(_))
        ));

        store.delete_machine(first.id, false).await.unwrap();
        store.save_machine(registered(1, "acme")).await.unwrap();
    }

    #[tokio::test]
    async fn test_addresses_assigned_once_and_distinct() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        let a = store.save_machine(registered(1, "acme")).await.unwrap();
        let b = store.save_machine(registered(2, "acme")).await.unwrap();
        assert_eq!(a.ip_address, Some(Ipv4Addr::new(100, 64, 0, 1)));
        assert_eq!(b.ip_address, Some(Ipv4Addr::new(100, 64, 0, 2)));

        let resaved = store.save_machine(a.clone()).await.unwrap();
        assert_eq!(resaved.ip_address, a.ip_address);

        let pending = store
            .save_machine(Machine::pending(mkey(3), "n", "h"))
            .await
            .unwrap();
        assert!(pending.ip_address.is_none());
    }

    #[tokio::test]
    async fn test_save_into_unknown_namespace_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.save_machine(registered(1, "nowhere")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pre_auth_key_usage() {
        let store = MemoryStore::new();
        store.create_namespace("acme").await.unwrap();
        let key = store.create_pre_auth_key("acme", false, true, None).await.unwrap();
        assert_eq!(key.key.len(), PRE_AUTH_KEY_BYTES * 2);
        assert!(key.is_usable(Utc::now()));

        let used = store.mark_pre_auth_key_used(&key.key).await.unwrap();
        assert!(!used.is_usable(Utc::now()));
        assert!(matches!(
            store.mark_pre_auth_key_used(&key.key).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let reusable = store.create_pre_auth_key("acme", true, false, None).await.unwrap();
        let reusable = store.mark_pre_auth_key_used(&reusable.key).await.unwrap();
        assert!(reusable.is_usable(Utc::now()));

        assert!(store.mark_pre_auth_key_used(&reusable.key).await.is_ok());

        let expired = store.expire_pre_auth_key("acme", &reusable.key).await.unwrap();
        assert!(!expired.is_usable(Utc::now() + TimeDelta::seconds(1)));
        assert!(store.mark_pre_auth_key_used(&reusable.key).await.is_err());
        assert!(store.expire_pre_auth_key("other", &reusable.key).await.is_err());
        assert_eq!(store.list_pre_auth_keys("acme").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_use_key_admits_one_concurrent_claim() {
        let store = Arc::new(MemoryStore::new());
        store.create_namespace("acme").await.unwrap();
        let key = store.create_pre_auth_key("acme", false, false, None).await.unwrap();

        let mut claims = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            let key = key.key.clone();
            claims.spawn(async move { store.mark_pre_auth_key_used(&key).await.is_ok() });
        }
        let mut granted = 0;
        while let Some(ok) = claims.join_next().await {
            if ok.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_pending_updates_drain_once() {
        let store = MemoryStore::new();
        store.request_namespace_update("a").await.unwrap();
        store.request_namespace_update("b").await.unwrap();
        store.request_namespace_update("a").await.unwrap();

        assert_eq!(store.take_pending_updates().await.unwrap(), vec!["a", "b"]);
        assert!(store.take_pending_updates().await.unwrap().is_empty());
    }

    #[test]
    fn test_inactive_ephemeral_rule() {
        let now = Utc::now();
        let timeout = TimeDelta::minutes(5);
        let key = PreAuthKey {
            id: 1,
            key: "k".into(),
            namespace: "acme".into(),
            reusable: false,
            ephemeral: true,
            used: true,
            expiration: None,
            created_at: now,
        };

        let mut machine = registered(1, "acme");
        machine.auth_key = Some(key.clone());
        machine.last_seen = Some(now - TimeDelta::minutes(4));
        assert!(!machine.is_inactive_ephemeral(now, timeout));

        machine.last_seen = Some(now - TimeDelta::minutes(6));
        assert!(machine.is_inactive_ephemeral(now, timeout));

        machine.last_seen = None;
        assert!(!machine.is_inactive_ephemeral(now, timeout));

        machine.last_seen = Some(now);
        assert!(!machine.is_inactive_ephemeral(now, TimeDelta::MAX));
        assert!(!machine.is_inactive_ephemeral(now, TimeDelta::seconds(10_000_000_000_000)));

        machine.last_seen = Some(now - TimeDelta::days(30));
        machine.auth_key = Some(PreAuthKey { ephemeral: false, ..key });
        assert!(!machine.is_inactive_ephemeral(now, timeout));
        machine.auth_key = None;
        assert!(!machine.is_inactive_ephemeral(now, timeout));
    }
}
