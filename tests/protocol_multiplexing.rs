//! Integration tests for serving gRPC and HTTP on one port.
//!
//! A gRPC call routed to the HTTP server (or the reverse) fails outright, so
//! every successful call below is evidence of correct classification.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use meshward::rpc::{
    CoordinationServiceClient, CreateNamespaceRequest, GetNamespaceRequest, ListNamespacesRequest,
};
use meshward::{CoordinationServer, ServerConfig};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(33000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

async fn start_server() -> (Arc<CoordinationServer>, SocketAddr, CancellationToken, tempfile::TempDir) {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let addr: SocketAddr = format!("127.0.0.1:{}", next_port()).parse().unwrap();
    let config = ServerConfig::new(addr, format!("http://{addr}"), dir.path().join("private.key"));
    let server = Arc::new(CoordinationServer::new(config).await.expect("server construction"));
    let token = CancellationToken::new();
    tokio::spawn(server.clone().serve(token.clone()));

    timeout(TEST_TIMEOUT, async {
        while tokio::net::TcpStream::connect(addr).await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("server did not start listening");
    (server, addr, token, dir)
}

#[tokio::test]
async fn grpc_and_http_share_the_port() {
    let (_server, addr, token, _dir) = start_server().await;

    let mut client = CoordinationServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("grpc connect");
    let created = client
        .create_namespace(CreateNamespaceRequest { name: "acme".to_string() })
        .await
        .expect("create over grpc")
        .into_inner();
    assert_eq!(created.namespace.unwrap().name, "acme");

    let listed: serde_json::Value = reqwest::get(format!("http://{addr}/api/v1/namespace/acme"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["namespace"]["name"], "acme");

    token.cancel();
}

#[tokio::test]
async fn concurrent_interleaved_connections() {
    let (server, addr, token, _dir) = start_server().await;
    server.store().create_namespace("acme").await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16 {
        if i % 2 == 0 {
            tasks.spawn(async move {
                let mut client = CoordinationServiceClient::connect(format!("http://{addr}"))
                    .await
                    .map_err(|e| e.to_string())?;
                client
                    .get_namespace(GetNamespaceRequest { name: "acme".to_string() })
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<_, String>("grpc")
            });
        } else {
            tasks.spawn(async move {
                let response = reqwest::get(format!("http://{addr}/health"))
                    .await
                    .map_err(|e| e.to_string())?;
                if !response.status().is_success() {
                    return Err(format!("status {}", response.status()));
                }
                Ok("http")
            });
        }
    }

    let mut grpc = 0;
    let mut http = 0;
    timeout(TEST_TIMEOUT, async {
        while let Some(result) = tasks.join_next().await {
            match result.unwrap().expect("request failed") {
                "grpc" => grpc += 1,
                _ => http += 1,
            }
        }
    })
    .await
    .expect("requests did not complete");
    assert_eq!((grpc, http), (8, 8));

    token.cancel();
}

#[tokio::test]
async fn closing_one_connection_leaves_the_other() {
    let (_server, addr, token, _dir) = start_server().await;

    let mut grpc = CoordinationServiceClient::connect(format!("http://{addr}"))
        .await
        .expect("grpc connect");
    let http = reqwest::Client::new();

    assert!(http.get(format!("http://{addr}/health")).send().await.unwrap().status().is_success());
    drop(http);

    grpc.list_namespaces(ListNamespacesRequest {})
        .await
        .expect("grpc still served");
    drop(grpc);

    let status = reqwest::get(format!("http://{addr}/health")).await.unwrap().status();
    assert!(status.is_success());

    token.cancel();
}
