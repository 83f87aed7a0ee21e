//! Integration tests for ephemeral-node expiry and topology versions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use meshward::store::Machine;
use meshward::{CoordinationServer, MachineKey, MemoryStore, NodeStore, ServerConfig};

async fn server(dir: &std::path::Path, inactivity: Duration) -> CoordinationServer {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut config = ServerConfig::new(addr, "http://127.0.0.1", dir.join("private.key"));
    config.ephemeral_node_inactivity_timeout = inactivity;
    CoordinationServer::with_store(config, Arc::new(MemoryStore::new()))
        .await
        .expect("server construction")
}

async fn node(server: &CoordinationServer, byte: u8, namespace: &str, ephemeral: bool) -> Machine {
    let key = server
        .store()
        .create_pre_auth_key(namespace, false, ephemeral, None)
        .await
        .unwrap();
    let mut machine = Machine::pending(MachineKey::from_bytes([byte; 32]), format!("nk{byte}"), format!("node{byte}"));
    machine.namespace = namespace.to_string();
    machine.registered = true;
    machine.auth_key = Some(key);
    server.store().save_machine(machine).await.unwrap()
}

#[tokio::test]
async fn unmarked_namespace_reports_now() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path(), Duration::from_secs(300)).await;

    let before = Utc::now();
    let seen = server.tracker().latest_change(&["acme"]);
    assert!(seen >= before && seen - before < TimeDelta::seconds(1));

    let marked = server.tracker().mark_changed("acme");
    assert_eq!(server.tracker().latest_change(&["acme"]), marked);
    assert_eq!(server.tracker().latest_change(&["acme"]), marked);
}

#[tokio::test]
async fn ephemeral_node_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path(), Duration::from_secs(5 * 60)).await;
    server.store().create_namespace("acme").await.unwrap();

    let t = Utc::now();
    let mut a = node(&server, 1, "acme", true).await;
    a.last_seen = Some(t);
    let a = server.store().save_machine(a).await.unwrap();
    let mut durable = node(&server, 2, "acme", false).await;
    durable.last_seen = Some(t);
    let durable = server.store().save_machine(durable).await.unwrap();

    server.expire_ephemeral_nodes_at(t + TimeDelta::minutes(4)).await;
    assert!(server.store().get_machine_by_id(a.id).await.is_ok());

    let at = t + TimeDelta::minutes(6);
    assert_eq!(server.expire_ephemeral_nodes_at(at).await, 1);
    assert!(server.store().get_machine_by_id(a.id).await.is_err());
    assert!(server.store().get_machine_by_id(durable.id).await.is_ok());
    assert!(server.tracker().latest_change(&["acme"]) >= at);

    let remaining = server.store().list_machines_in_namespace("acme").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, durable.id);
}

#[tokio::test]
async fn expiry_covers_every_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let server = server(dir.path(), Duration::from_secs(60)).await;
    let stale = Utc::now() - TimeDelta::hours(1);

    let mut ids = Vec::new();
    for (byte, ns) in [(1u8, "alpha"), (2, "beta"), (3, "gamma")] {
        server.store().create_namespace(ns).await.unwrap();
        let mut machine = node(&server, byte, ns, true).await;
        machine.last_seen = Some(stale);
        ids.push(server.store().save_machine(machine).await.unwrap().id);
    }

    assert_eq!(server.expire_ephemeral_nodes().await, 3);
    for id in ids {
        assert!(server.store().get_machine_by_id(id).await.is_err());
    }
    for ns in ["alpha", "beta", "gamma"] {
        assert!(server.tracker().latest_marked(&[ns]).is_some());
    }
}
