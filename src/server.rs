//! # Coordination Server
//!
//! [`CoordinationServer`] is the long-lived process object. It owns the
//! signing key, the node store, the topology tracker, the relay map snapshot,
//! the access policy and the optional identity provider, and it wires them to
//! the network in [`CoordinationServer::serve`].
//!
//! ## Startup
//!
//! ```text
//! ServerConfig ──► CoordinationServer::new ──► serve(token)
//!                    │ store backend            │ resolve_tls + build
//!                    │ signing key              │ bind + ConnectionMultiplexer
//!                    │ metrics                  │ TaskGroup: mux, rpc, http, [acme]
//!                    │ initial relay map        │ schedulers (same token)
//!                    │ OIDC discovery           ▼
//!                    ▼                        first member exit = result
//! ```
//!
//! Every failure before the group starts is a [`StartupError`]; nothing is
//! left serving when one is returned.
//!
//! ## Replaced State
//!
//! The relay map and the access policy are swapped as whole values. Readers
//! hold an `Arc` to the version they started with.

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::acme;
use crate::config::ServerConfig;
use crate::error::StartupError;
use crate::http;
use crate::identity::ServerKey;
use crate::messages::{MapResponse, NodeView};
use crate::metrics::Metrics;
use crate::mux::ConnectionMultiplexer;
use crate::oidc::{NamespaceMatcher, OidcProvider, StateCache};
use crate::protocols::{AccessPolicy, AllowAll, IdentityProvider, NodeStore};
use crate::relay_map::{RelayMap, RelayMapHandle, RelayMapSources};
use crate::rpc::CoordinationApi;
use crate::scheduler;
use crate::store::{Machine, MemoryStore, StoreError};
use crate::supervisor::TaskGroup;
use crate::tls::resolve_tls;
use crate::tracker::TopologyVersionTracker;

/// The only storage backend compiled in.
pub const MEMORY_STORE: &str = "memory";

/// Identity-provider login state: provider, pending logins, namespace rules.
pub struct OidcLogin {
    pub provider: Arc<dyn IdentityProvider>,
    pub states: StateCache,
    pub matcher: NamespaceMatcher,
}

impl std::fmt::Debug for OidcLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcLogin")
            .field("states", &self.states)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

pub struct CoordinationServer {
    config: ServerConfig,
    key: ServerKey,
    store: Arc<dyn NodeStore>,
    tracker: Arc<TopologyVersionTracker>,
    relay_map: RelayMapHandle,
    relay_sources: RelayMapSources,
    http_client: reqwest::Client,
    policy: RwLock<Arc<dyn AccessPolicy>>,
    oidc: Option<OidcLogin>,
    metrics: Metrics,
}

impl CoordinationServer {
    /// Build the server from configuration, performing every startup check.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        if config.store_backend != MEMORY_STORE {
            return Err(StartupError::UnsupportedStore(config.store_backend.clone()).into());
        }
        let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::new());
        let mut server = Self::with_store(config, store).await?;

        if let Some(settings) = server.config.oidc.clone() {
            let matcher = NamespaceMatcher::new(&settings.match_map)?;
            let provider = OidcProvider::discover(&settings, &server.config.server_url).await?;
            server = server.with_identity_provider(Arc::new(provider), matcher);
        }
        Ok(server)
    }

    /// Build the server around an externally supplied store. OIDC is not set up.
    pub async fn with_store(config: ServerConfig, store: Arc<dyn NodeStore>) -> Result<Self> {
        let key = ServerKey::load_or_generate(&config.private_key_path)?;
        let metrics = Metrics::new().context("failed to register metrics")?;
        let tracker = Arc::new(TopologyVersionTracker::with_gauge(metrics.last_update.clone()));
        let http_client = reqwest::Client::builder()
            .timeout(config.http_read_timeout)
            .build()
            .context("failed to build HTTP client")?;

        let relay_sources = RelayMapSources {
            urls: config.relay.urls.clone(),
            paths: config.relay.paths.clone(),
        };
        let initial = if relay_sources.is_empty() {
            RelayMap::default()
        } else {
            match relay_sources.fetch(&http_client).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "initial relay map fetch failed, starting empty");
                    RelayMap::default()
                }
            }
        };
        let relay_map = RelayMapHandle::new(initial, Some(metrics.relay_map_regions.clone()));

        info!(key = %key.public_hex(), "server key loaded");
        Ok(Self {
            config,
            key,
            store,
            tracker,
            relay_map,
            relay_sources,
            http_client,
            policy: RwLock::new(Arc::new(AllowAll)),
            oidc: None,
            metrics,
        })
    }

    pub fn with_identity_provider(
        mut self,
        provider: Arc<dyn IdentityProvider>,
        matcher: NamespaceMatcher,
    ) -> Self {
        self.oidc = Some(OidcLogin {
            provider,
            states: StateCache::default(),
            matcher,
        });
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn key(&self) -> &ServerKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<TopologyVersionTracker> {
        &self.tracker
    }

    pub fn relay_map(&self) -> &RelayMapHandle {
        &self.relay_map
    }

    pub(crate) fn relay_sources(&self) -> &RelayMapSources {
        &self.relay_sources
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn oidc(&self) -> Option<&OidcLogin> {
        self.oidc.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn api(&self) -> CoordinationApi {
        CoordinationApi::new(self.store.clone(), self.config.registration)
    }

    pub fn policy(&self) -> Arc<dyn AccessPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the access policy and mark every namespace changed.
    pub async fn set_policy(&self, policy: Arc<dyn AccessPolicy>) -> Result<(), StoreError> {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
        for namespace in self.store.list_namespaces().await? {
            self.tracker.mark_changed(&namespace.name);
        }
        info!("access policy replaced");
        Ok(())
    }

    /// Registration expiry for a node asking for `requested`, bounded by the configured maximum.
    pub fn registration_expiry(&self, now: DateTime<Utc>, requested: Option<DateTime<Utc>>) -> DateTime<Utc> {
        let limits = &self.config.registration;
        let max = chrono::TimeDelta::from_std(limits.max_duration).unwrap_or(chrono::TimeDelta::MAX);
        let default = chrono::TimeDelta::from_std(limits.default_duration).unwrap_or(max);
        let latest = now.checked_add_signed(max).unwrap_or(DateTime::<Utc>::MAX_UTC);
        match requested {
            Some(at) if at > now => at.min(latest),
            _ => now.checked_add_signed(default).unwrap_or(latest),
        }
    }

    /// Full map for `machine`: itself, visible peers, relay map and domain.
    pub async fn map_response(&self, machine: &Machine, omit_peers: bool) -> Result<MapResponse, StoreError> {
        let base_domain = &self.config.base_domain;
        let peers = if omit_peers || machine.namespace.is_empty() {
            Vec::new()
        } else {
            let now = Utc::now();
            let policy = self.policy();
            self.store
                .list_machines_in_namespace(&machine.namespace)
                .await?
                .iter()
                .filter(|peer| peer.id != machine.id && peer.registered && !peer.is_expired(now))
                .filter(|peer| policy.allows(machine, peer))
                .map(|peer| NodeView::from_machine(peer, base_domain))
                .collect()
        };

        Ok(MapResponse {
            node: Some(NodeView::from_machine(machine, base_domain)),
            peers,
            relay_map: Some(self.relay_map.snapshot().as_ref().clone()),
            domain: base_domain.clone(),
            keep_alive: false,
        })
    }

    /// Bind, serve and supervise until the first member exits or `token` is cancelled.
    pub async fn serve(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|source| StartupError::Bind {
                addr: self.config.listen_addr,
                source,
            })?;
        self.serve_on(listener, token).await
    }

    /// Like [`CoordinationServer::serve`] on an already bound listener.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener, token: CancellationToken) -> Result<()> {
        let plan = resolve_tls(&self.config.tls)?;
        let setup = plan.build(&self.config.server_url)?;

        let challenge_listener = match setup.challenge_listen {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| StartupError::Bind { addr, source })?,
            ),
            None => None,
        };

        let (mux, rpc_listener, http_listener) = ConnectionMultiplexer::new(listener, setup.acceptor)
            .context("failed to set up connection multiplexer")?;
        info!(addr = %mux.local_addr(), tls = plan.is_tls(), "coordination server listening");

        let token = token.child_token();
        let mut group = TaskGroup::new(token.clone());

        group.spawn("connection multiplexer", mux.run(token.clone()));

        {
            let service = self.api().into_service();
            let shutdown = token.clone().cancelled_owned();
            group.spawn("rpc server", async move {
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(rpc_listener.into_incoming(), shutdown)
                    .await
                    .context("rpc server stopped")
            });
        }

        {
            let router = http::router(self.clone(), token.clone());
            let shutdown = token.clone().cancelled_owned();
            group.spawn("http server", async move {
                axum::serve(http_listener, router)
                    .with_graceful_shutdown(shutdown)
                    .await
                    .context("http server stopped")
            });
        }

        if let Some(manager) = setup.cert_manager {
            if let Some(listener) = challenge_listener {
                group.spawn(
                    "acme challenge listener",
                    acme::serve_http_challenge(
                        listener,
                        manager.clone(),
                        self.config.server_url.clone(),
                        token.clone(),
                    ),
                );
            }
            let renewal_token = token.clone();
            group.spawn("certificate renewal", async move {
                manager.run_renewal(renewal_token).await
            });
        }

        let mut schedulers: JoinSet<()> = scheduler::spawn_all(self.clone(), token.clone());

        let result = group.wait().await;
        schedulers.shutdown().await;
        match &result {
            Ok(()) => info!("coordination server stopped"),
            Err(e) => warn!(error = %format!("{e:#}"), "coordination server stopped"),
        }
        result
    }
}

impl std::fmt::Debug for CoordinationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationServer")
            .field("listen_addr", &self.config.listen_addr)
            .field("server_url", &self.config.server_url)
            .field("tracker", &self.tracker)
            .field("relay_map", &self.relay_map)
            .field("oidc", &self.oidc.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MachineKey;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> ServerConfig {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        ServerConfig::new(addr, "http://127.0.0.1", dir.join("private.key"))
    }

    struct DenyAll;

    impl AccessPolicy for DenyAll {
        fn allows(&self, _from: &Machine, _to: &Machine) -> bool {
            false
        }
    }

    async fn registered(server: &CoordinationServer, byte: u8, namespace: &str) -> Machine {
        let mut machine = Machine::pending(MachineKey::from_bytes([byte; 32]), format!("nk{byte}"), format!("host{byte}"));
        machine.namespace = namespace.to_string();
        machine.registered = true;
        server.store().save_machine(machine).await.unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_store_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.store_backend = "postgres".to_string();

        let err = CoordinationServer::new(config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StartupError>(),
            Some(StartupError::UnsupportedStore(name)) if name == "postgres"
        ));
    }

    #[tokio::test]
    async fn test_unreadable_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        std::fs::write(dir.path().join("private.key"), "not hex").unwrap();
        config.private_key_path = dir.path().join("private.key");

        let err = CoordinationServer::new(config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StartupError>(),
            Some(StartupError::SigningKeyInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_map_filters_peers() {
        let dir = tempfile::tempdir().unwrap();
        let server = CoordinationServer::new(config(dir.path())).await.unwrap();
        server.store().create_namespace("acme").await.unwrap();
        server.store().create_namespace("other").await.unwrap();

        let me = registered(&server, 1, "acme").await;
        registered(&server, 2, "acme").await;
        registered(&server, 3, "other").await;
        let mut expired = registered(&server, 4, "acme").await;
        expired.expiry = Some(Utc::now() - chrono::TimeDelta::minutes(1));
        server.store().save_machine(expired).await.unwrap();
        let pending = Machine::pending(MachineKey::from_bytes([5; 32]), "nk5", "host5");
        server.store().save_machine(pending).await.unwrap();

        let map = server.map_response(&me, false).await.unwrap();
        assert_eq!(map.peers.len(), 1);
        assert_eq!(map.peers[0].name, "host2.acme.mesh.local");
        assert_eq!(map.node.unwrap().name, "host1.acme.mesh.local");

        assert!(server.map_response(&me, true).await.unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_set_policy_marks_every_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let server = CoordinationServer::new(config(dir.path())).await.unwrap();
        server.store().create_namespace("acme").await.unwrap();
        server.store().create_namespace("other").await.unwrap();
        let me = registered(&server, 1, "acme").await;
        registered(&server, 2, "acme").await;

        server.set_policy(Arc::new(DenyAll)).await.unwrap();
        assert!(server.tracker().latest_marked(&["acme"]).is_some());
        assert!(server.tracker().latest_marked(&["other"]).is_some());
        assert!(server.map_response(&me, false).await.unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_registration_expiry_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.registration.default_duration = Duration::from_secs(3600);
        config.registration.max_duration = Duration::from_secs(7200);
        let server = CoordinationServer::new(config).await.unwrap();
        let now = Utc::now();

        assert_eq!(server.registration_expiry(now, None), now + chrono::TimeDelta::hours(1));
        assert_eq!(
            server.registration_expiry(now, Some(now + chrono::TimeDelta::days(3))),
            now + chrono::TimeDelta::hours(2)
        );
        let soon = now + chrono::TimeDelta::minutes(10);
        assert_eq!(server.registration_expiry(now, Some(soon)), soon);
        assert_eq!(
            server.registration_expiry(now, Some(now - chrono::TimeDelta::minutes(1))),
            now + chrono::TimeDelta::hours(1)
        );
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(CoordinationServer::new(config(dir.path())).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();

        let handle = tokio::spawn(server.serve_on(listener, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
