//! # HTTP Surface
//!
//! The axum router served on the multiplexer's HTTP sub-listener.
//!
//! | Path | Method | Handler |
//! |------|--------|---------|
//! | `/health` | GET | fixed `{"healthy":"ok"}` |
//! | `/key` | GET | server public key (hex) |
//! | `/register?key=` | GET | interactive registration page |
//! | `/machine/{mkey}` | POST | node registration / refresh / logout |
//! | `/machine/{mkey}/map` | POST | map fetch or long-poll stream |
//! | `/oidc/register/{mkey}` | GET | start identity-provider login |
//! | `/oidc/callback` | GET | finish login, register the machine |
//! | `/apple`, `/apple/{platform}` | GET | device configuration profiles |
//! | `/metrics` | GET | prometheus text exposition |
//! | `/api/v1/*` | any | [`crate::gateway`] |
//!
//! ## Timeouts
//!
//! Request bodies must arrive within `http_read_timeout`. Responses have no
//! write deadline, since map streams stay open indefinitely.
//!
//! ## Map Streams
//!
//! A streaming map request gets the full map immediately, then one frame per
//! wake-up: a new full map when the namespace's tracker entry moved past the
//! last version sent, a keep-alive frame after `keepalive_interval` of
//! silence. The producer stops when the client goes away, when the machine is
//! deleted or deauthorized, or when the server shuts down.

use std::io;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::gateway;
use crate::identity::MachineKey;
use crate::messages::{MapRequest, MapResponse, RegisterRequest, RegisterResponse, encode_frame};
use crate::metrics::Metrics;
use crate::store::{Machine, RegisterMethod, StoreError};
use crate::server::CoordinationServer;

/// Frames buffered per map stream before the producer waits on the client.
const MAP_STREAM_BUFFER: usize = 8;

const MOBILECONFIG_CONTENT_TYPE: &str = "application/x-apple-aspen-config";

#[derive(Clone)]
struct HttpState {
    server: Arc<CoordinationServer>,
    token: CancellationToken,
}

type HandlerError = (StatusCode, String);
type HandlerResult<T> = Result<T, HandlerError>;

fn internal(err: impl std::fmt::Display) -> HandlerError {
    warn!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

fn parse_machine_key(raw: &str) -> HandlerResult<MachineKey> {
    raw.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "machine key must be 64 hex characters".to_string()))
}

pub fn router(server: Arc<CoordinationServer>, token: CancellationToken) -> Router {
    let metrics = server.metrics().clone();
    let read_timeout = server.config().http_read_timeout;
    let api = server.api();

    Router::new()
        .route("/health", get(health))
        .route("/key", get(server_key))
        .route("/register", get(register_page))
        .route("/machine/{mkey}", post(register_machine))
        .route("/machine/{mkey}/map", post(poll_map))
        .route("/oidc/register/{mkey}", get(oidc_register))
        .route("/oidc/callback", get(oidc_callback))
        .route("/apple", get(apple_index))
        .route("/apple/{platform}", get(apple_profile))
        .route("/metrics", get(metrics_text))
        .with_state(HttpState { server, token })
        .merge(gateway::router(api))
        .layer(middleware::from_fn_with_state(metrics, count_requests))
        .layer(RequestBodyTimeoutLayer::new(read_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn count_requests(State(metrics): State<Metrics>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let response = next.run(request).await;
    metrics
        .http_requests
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .inc();
    response
}

// ============================================================================
// Static Endpoints
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "healthy": "ok" }))
}

async fn server_key(State(state): State<HttpState>) -> String {
    state.server.key().public_hex()
}

async fn metrics_text(State(state): State<HttpState>) -> HandlerResult<Response> {
    let text = state.server.metrics().encode().map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

#[derive(Debug, Deserialize)]
struct RegisterQuery {
    key: Option<String>,
}

async fn register_page(
    State(state): State<HttpState>,
    Query(query): Query<RegisterQuery>,
) -> HandlerResult<Html<String>> {
    let Some(raw) = query.key.filter(|k| !k.is_empty()) else {
        return Err((StatusCode::BAD_REQUEST, "missing key parameter".to_string()));
    };
    let key = parse_machine_key(&raw)?;
    let server_url = state.server.config().server_url.trim_end_matches('/');
    Ok(Html(format!(
        "<html><body>\
         <h1>Machine registration</h1>\
         <p>Ask an administrator to register this machine with the <code>RegisterMachine</code> call:</p>\
         <pre>curl -X POST '{server_url}/api/v1/machine/register?namespace=NAMESPACE&amp;key={key}'</pre>\
         </body></html>"
    )))
}

// ============================================================================
// Registration
// ============================================================================

fn granted(machine: &Machine) -> Json<RegisterResponse> {
    Json(RegisterResponse {
        machine_authorized: true,
        auth_url: None,
        namespace: Some(machine.namespace.clone()),
        expiry: machine.expiry,
    })
}

async fn register_machine(
    State(state): State<HttpState>,
    Path(raw_key): Path<String>,
    Json(request): Json<RegisterRequest>,
) -> HandlerResult<Json<RegisterResponse>> {
    let mkey = parse_machine_key(&raw_key)?;
    let server = &state.server;
    let store = server.store();
    let now = Utc::now();

    let existing = match store.get_machine(&mkey).await {
        Ok(machine) => Some(machine),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => return Err(internal(e)),
    };

    if let Some(mut machine) = existing.clone().filter(|m| m.registered && !m.is_expired(now)) {
        if request.expiry.is_some_and(|at| at <= now) {
            machine.expiry = Some(now);
            let machine = store.save_machine(machine).await.map_err(internal)?;
            server.tracker().mark_changed(&machine.namespace);
            info!(machine = %machine.hostname, namespace = %machine.namespace, "machine logged out");
            return Ok(Json(RegisterResponse {
                machine_authorized: false,
                auth_url: None,
                namespace: Some(machine.namespace),
                expiry: machine.expiry,
            }));
        }

        let rotated = machine.node_key != request.node_key;
        machine.node_key = request.node_key;
        if !request.hostname.is_empty() {
            machine.hostname = request.hostname;
        }
        let machine = store.save_machine(machine).await.map_err(internal)?;
        if rotated {
            debug!(machine = %machine.hostname, "node key rotated");
            server.tracker().mark_changed(&machine.namespace);
        }
        return Ok(granted(&machine));
    }

    let mut machine = existing.unwrap_or_else(|| Machine::pending(mkey, "", mkey.short()));
    machine.node_key = request.node_key;
    if !request.hostname.is_empty() {
        machine.hostname = request.hostname;
    }

    if let Some(auth_key) = request.auth_key.as_deref().filter(|k| !k.is_empty()) {
        // Consuming the key is the check, so concurrent registrations cannot share a single-use key.
        let key = match store.mark_pre_auth_key_used(auth_key).await {
            Ok(key) => key,
            Err(StoreError::NotFound(_) | StoreError::InvalidArgument(_)) => {
                info!(machine = %mkey.short(), "registration with invalid pre-auth key refused");
                return Err((StatusCode::UNAUTHORIZED, "invalid or expired pre-auth key".to_string()));
            }
            Err(e) => return Err(internal(e)),
        };

        let previous = std::mem::replace(&mut machine.namespace, key.namespace.clone());
        machine.registered = true;
        machine.register_method = RegisterMethod::AuthKey;
        machine.expiry = Some(server.registration_expiry(now, request.expiry));
        machine.last_seen = Some(now);
        machine.auth_key = Some(key.clone());
        let machine = store.save_machine(machine).await.map_err(internal)?;

        if !previous.is_empty() && previous != machine.namespace {
            server.tracker().mark_changed(&previous);
        }
        server.tracker().mark_changed(&machine.namespace);
        info!(
            machine = %machine.hostname,
            namespace = %machine.namespace,
            ephemeral = key.ephemeral,
            "machine registered with pre-auth key"
        );
        return Ok(granted(&machine));
    }

    let machine = store.save_machine(machine).await.map_err(internal)?;
    let server_url = server.config().server_url.trim_end_matches('/');
    let auth_url = if server.oidc().is_some() {
        format!("{server_url}/oidc/register/{mkey}")
    } else {
        format!("{server_url}/register?key={mkey}")
    };
    debug!(machine = %machine.hostname, "machine awaiting interactive registration");
    Ok(Json(RegisterResponse {
        machine_authorized: false,
        auth_url: Some(auth_url),
        namespace: None,
        expiry: None,
    }))
}

// ============================================================================
// Map
// ============================================================================

async fn authorized_machine(server: &CoordinationServer, mkey: &MachineKey) -> HandlerResult<Machine> {
    match server.store().get_machine(mkey).await {
        Ok(machine) if machine.registered && !machine.is_expired(Utc::now()) => Ok(machine),
        Ok(_) | Err(StoreError::NotFound(_)) => {
            Err((StatusCode::UNAUTHORIZED, "machine is not registered".to_string()))
        }
        Err(e) => Err(internal(e)),
    }
}

async fn poll_map(
    State(state): State<HttpState>,
    Path(raw_key): Path<String>,
    Json(request): Json<MapRequest>,
) -> HandlerResult<Response> {
    let mkey = parse_machine_key(&raw_key)?;
    let server = state.server.clone();
    let mut machine = authorized_machine(&server, &mkey).await?;

    if !request.read_only {
        let moved = machine.endpoints != request.endpoints;
        machine.endpoints = request.endpoints.clone();
        machine.last_seen = Some(Utc::now());
        machine = server.store().save_machine(machine).await.map_err(internal)?;
        if moved {
            server.tracker().mark_changed(&machine.namespace);
        }
    }

    // Read before building the map so a change landing mid-build is still pushed.
    let since = server.tracker().latest_marked(&[machine.namespace.as_str()]);
    let map = server
        .map_response(&machine, request.omit_peers)
        .await
        .map_err(internal)?;
    if !request.stream {
        return Ok(Json(map).into_response());
    }

    let first = encode_frame(&map).map_err(internal)?;
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(MAP_STREAM_BUFFER);
    tx.send(Ok(Bytes::from(first))).await.map_err(internal)?;

    debug!(machine = %machine.hostname, namespace = %machine.namespace, "map stream opened");
    tokio::spawn(stream_map_updates(server, state.token.clone(), mkey, request, since, tx));

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

async fn stream_map_updates(
    server: Arc<CoordinationServer>,
    token: CancellationToken,
    mkey: MachineKey,
    request: MapRequest,
    mut since: Option<chrono::DateTime<Utc>>,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let keepalive = server.config().keepalive_interval;
    loop {
        let Ok(machine) = authorized_machine(&server, &mkey).await else {
            break;
        };

        let changed = tokio::select! {
            _ = token.cancelled() => break,
            _ = tx.closed() => break,
            changed = server.tracker().wait_for_change(&machine.namespace, since, keepalive) => changed,
        };

        let Ok(mut machine) = authorized_machine(&server, &mkey).await else {
            break;
        };
        if !request.read_only {
            machine.last_seen = Some(Utc::now());
            machine = match server.store().save_machine(machine).await {
                Ok(machine) => machine,
                Err(e) => {
                    warn!(machine = %mkey.short(), error = %e, "cannot record last seen");
                    break;
                }
            };
        }

        let frame = match changed {
            Some(version) => {
                since = Some(version);
                match server.map_response(&machine, request.omit_peers).await {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(machine = %machine.hostname, error = %e, "cannot build map");
                        break;
                    }
                }
            }
            None => MapResponse::keep_alive(),
        };
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(machine = %machine.hostname, error = %e, "cannot encode map frame");
                break;
            }
        };
        if tx.send(Ok(Bytes::from(bytes))).await.is_err() {
            break;
        }
    }
    debug!(machine = %mkey.short(), "map stream closed");
}

// ============================================================================
// OIDC
// ============================================================================

async fn oidc_register(
    State(state): State<HttpState>,
    Path(raw_key): Path<String>,
) -> HandlerResult<Redirect> {
    let Some(oidc) = state.server.oidc() else {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "OIDC is not configured".to_string()));
    };
    let mkey = parse_machine_key(&raw_key)?;
    let login_state = oidc.states.begin(mkey);
    Ok(Redirect::to(&oidc.provider.authorize_url(&login_state)))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

async fn oidc_callback(
    State(state): State<HttpState>,
    Query(query): Query<CallbackQuery>,
) -> HandlerResult<Html<String>> {
    let server = &state.server;
    let Some(oidc) = server.oidc() else {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "OIDC is not configured".to_string()));
    };
    let (Some(code), Some(login_state)) = (query.code, query.state) else {
        return Err((StatusCode::BAD_REQUEST, "missing code or state".to_string()));
    };
    let Some(mkey) = oidc.states.take(&login_state) else {
        return Err((StatusCode::BAD_REQUEST, "unknown or expired login state".to_string()));
    };

    let claims = oidc.provider.exchange(&code).await.map_err(|e| {
        warn!(machine = %mkey.short(), error = %format!("{e:#}"), "OIDC code exchange failed");
        (StatusCode::BAD_REQUEST, "login failed".to_string())
    })?;
    let Some(namespace) = oidc.matcher.resolve(&claims.email) else {
        info!(email = %claims.email, "no namespace matches login");
        return Err((StatusCode::FORBIDDEN, "no namespace for this account".to_string()));
    };

    let store = server.store();
    match store.get_namespace(namespace).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => match store.create_namespace(namespace).await {
            Ok(_) | Err(StoreError::AlreadyExists(_)) => info!(namespace, "namespace created for login"),
            Err(e) => return Err(internal(e)),
        },
        Err(e) => return Err(internal(e)),
    }

    let mut machine = match store.get_machine(&mkey).await {
        Ok(machine) => machine,
        Err(StoreError::NotFound(_)) => {
            return Err((StatusCode::NOT_FOUND, "machine not found".to_string()));
        }
        Err(e) => return Err(internal(e)),
    };
    let now = Utc::now();
    let previous = std::mem::replace(&mut machine.namespace, namespace.to_string());
    machine.registered = true;
    machine.register_method = RegisterMethod::Oidc;
    machine.expiry = Some(server.registration_expiry(now, None));
    let machine = store.save_machine(machine).await.map_err(internal)?;

    if !previous.is_empty() && previous != machine.namespace {
        server.tracker().mark_changed(&previous);
    }
    server.tracker().mark_changed(&machine.namespace);
    info!(machine = %machine.hostname, namespace = %machine.namespace, email = %claims.email, "machine registered via OIDC");

    Ok(Html(format!(
        "<html><body><h1>Machine registered</h1>\
         <p>{} joined namespace {}. You can close this window.</p></body></html>",
        machine.hostname.replace('<', "&lt;").replace('>', "&gt;"),
        machine.namespace
    )))
}

// ============================================================================
// Apple Profiles
// ============================================================================

async fn apple_index(State(state): State<HttpState>) -> Html<String> {
    let server_url = state.server.config().server_url.trim_end_matches('/');
    Html(format!(
        "<html><body><h1>Apple configuration</h1>\
         <p>Install the profile for your device to point the client at <code>{server_url}</code>:</p>\
         <ul><li><a href=\"/apple/macos\">macOS</a></li><li><a href=\"/apple/ios\">iOS</a></li></ul>\
         </body></html>"
    ))
}

fn random_uuid() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let h = hex::encode_upper(b);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

async fn apple_profile(
    State(state): State<HttpState>,
    Path(platform): Path<String>,
) -> HandlerResult<Response> {
    let payload_type = match platform.as_str() {
        "macos" => "io.meshward.client.macos",
        "ios" => "io.meshward.client.ios",
        _ => return Err((StatusCode::BAD_REQUEST, format!("unknown platform {platform:?}"))),
    };
    let server_url = state.server.config().server_url.trim_end_matches('/');
    let profile = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>PayloadContent</key>
  <array>
    <dict>
      <key>PayloadType</key><string>{payload_type}</string>
      <key>PayloadUUID</key><string>{inner}</string>
      <key>PayloadIdentifier</key><string>io.meshward.client.{inner}</string>
      <key>PayloadVersion</key><integer>1</integer>
      <key>ControlURL</key><string>{server_url}</string>
    </dict>
  </array>
  <key>PayloadDisplayName</key><string>meshward</string>
  <key>PayloadIdentifier</key><string>io.meshward.profile</string>
  <key>PayloadType</key><string>Configuration</string>
  <key>PayloadUUID</key><string>{outer}</string>
  <key>PayloadVersion</key><integer>1</integer>
</dict>
</plist>
"#,
        inner = random_uuid(),
        outer = random_uuid(),
    );
    Ok((
        [
            (header::CONTENT_TYPE, MOBILECONFIG_CONTENT_TYPE),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"meshward.mobileconfig\""),
        ],
        profile,
    )
        .into_response())
}
