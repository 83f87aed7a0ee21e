//! # Meshward - Mesh Overlay Coordination Server
//!
//! Meshward is the control plane of a mesh overlay network. Member nodes
//! register with it, long-poll it for the current topology (their peers and
//! the relay map), and use that to build direct encrypted tunnels to each
//! other.
//!
//! - **One port, two protocols**: gRPC and plain HTTP share a listener; each
//!   connection is classified by its opening bytes
//! - **TLS**: static certificate with mutual TLS, automatic certificates
//!   (TLS-ALPN-01 or HTTP-01), or plaintext
//! - **Topology versions**: a per-namespace "last changed" tracker drives
//!   long-poll wake-ups
//! - **Maintenance**: ephemeral-node expiry, relay map refresh and
//!   out-of-band update publication run on their own timers
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────── TaskGroup (first exit wins) ────────────┐
//!  TCP ─► [TLS] ─► ConnectionMultiplexer ─┬─► tonic  CoordinationService   │
//!                    │                    └─► axum   nodes, OIDC, /api/v1  │
//!                    │  [HTTP-01 listener]  [certificate renewal]          │
//!                    └─────────────────────────────────────────────────────┘
//!  schedulers ──► NodeStore ──► TopologyVersionTracker ◄── map long-polls
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `server` | `CoordinationServer` construction and wiring |
//! | `config` | `ServerConfig` and the command-line surface |
//! | `error` | Fatal-at-startup error taxonomy |
//! | `identity` | Server signing key, machine keys |
//! | `tls` | TLS strategy resolution and rustls configuration |
//! | `acme` | Automatic certificates, renewal, HTTP-01 listener |
//! | `mux` | Protocol sniffing and the two sub-listeners |
//! | `tracker` | Per-namespace topology versions |
//! | `relay_map` | Relay map types, sources and the atomic snapshot |
//! | `protocols` | Store, identity-provider and policy traits |
//! | `store` | Domain records and the in-memory store |
//! | `messages` | Node-facing wire types and map-stream framing |
//! | `oidc` | OpenID Connect login |
//! | `rpc` | gRPC messages and the `CoordinationService` implementation |
//! | `scheduler` | Background maintenance loops |
//! | `supervisor` | Fan-in task group |
//! | `metrics` | Prometheus metric families |

pub mod acme;
pub mod config;
pub mod error;
mod gateway;
mod http;
pub mod identity;
pub mod messages;
pub mod metrics;
pub mod mux;
pub mod oidc;
pub mod protocols;
pub mod relay_map;
pub mod rpc;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod tls;
pub mod tracker;

pub use config::{Args, ServerConfig};
pub use error::StartupError;
pub use identity::{MachineKey, ServerKey};
pub use protocols::{AccessPolicy, AllowAll, IdentityClaims, IdentityProvider, NodeStore};
pub use server::CoordinationServer;
pub use store::MemoryStore;
pub use tracker::TopologyVersionTracker;
