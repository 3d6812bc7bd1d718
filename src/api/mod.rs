//! Control-plane HTTP API.
//!
//! | Method | Path                | Purpose                                  |
//! |--------|---------------------|------------------------------------------|
//! | POST   | `/dqlite`           | Upgrade to the engine protocol           |
//! | GET    | `/watch`            | Upgrade to a watch stream                |
//! | POST   | `/watch`            | Publish a committed row (leader only)    |
//! | GET    | `/cluster`          | Cluster topology                         |
//! | DELETE | `/cluster/:address` | Remove a member                          |

pub mod client;

pub use client::ApiClient;

use crate::cluster::Membership;
use crate::core::error::KvsqlError;
use crate::kv::{KeyValue, KvStore};
use crate::net::upgrade::{accept_engine, wants_upgrade, DQLITE_PROTOCOL};
use crate::watch::stream::{serve_watch, WatchRequest};
use crate::watch::{Broadcaster, WATCH_PROTOCOL};
use axum::extract::{Path, Request, State};
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub store: KvStore,
    pub broadcaster: Arc<Broadcaster>,
    pub membership: Arc<Membership>,
    /// Local socket the engine listens on.
    pub engine_socket: PathBuf,
    /// Parent of every watch subscription; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/dqlite", post(engine_upgrade))
        .route("/watch", get(watch_upgrade).post(watch_publish))
        .route("/cluster", get(cluster_list))
        .route("/cluster/:address", axum::routing::delete(cluster_remove))
        .with_state(state)
}

/// The 101 reply is framed by hyper, so the wire carries `connection` and
/// `date` headers next to `upgrade: <protocol>` rather than a hand-written
/// status line with a single `Upgrade` header. Clients only check the status
/// and the upgrade token.
fn switching_protocols(protocol: &'static str) -> Response {
    (
        StatusCode::SWITCHING_PROTOCOLS,
        [(UPGRADE, protocol), (CONNECTION, "Upgrade")],
    )
        .into_response()
}

fn take_upgrade(req: &mut Request) -> Result<OnUpgrade, Response> {
    req.extensions_mut().remove::<OnUpgrade>().ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Connection does not support upgrades",
        )
            .into_response()
    })
}

async fn engine_upgrade(State(state): State<ApiState>, mut req: Request) -> Response {
    if !wants_upgrade(req.headers(), DQLITE_PROTOCOL) {
        return (StatusCode::BAD_REQUEST, "Missing or invalid upgrade header").into_response();
    }
    let on_upgrade = match take_upgrade(&mut req) {
        Ok(on_upgrade) => on_upgrade,
        Err(response) => return response,
    };

    tokio::spawn(accept_engine(on_upgrade, state.engine_socket.clone()));
    switching_protocols(DQLITE_PROTOCOL)
}

async fn watch_upgrade(State(state): State<ApiState>, mut req: Request) -> Response {
    let request = match WatchRequest::from_headers(req.headers()) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    let on_upgrade = match take_upgrade(&mut req) {
        Ok(on_upgrade) => on_upgrade,
        Err(response) => return response,
    };

    // Subscribe before answering so nothing committed after the 101 is missed.
    let subscription = state.broadcaster.subscribe(state.shutdown.child_token());
    let store = state.store.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                if let Err(e) = serve_watch(TokioIo::new(upgraded), request, subscription, store).await {
                    tracing::debug!(error = %e, "watch stream closed with error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "watch upgrade failed"),
        }
    });

    switching_protocols(WATCH_PROTOCOL)
}

async fn watch_publish(State(state): State<ApiState>, Json(kv): Json<KeyValue>) -> Response {
    match state.broadcaster.publish(kv).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn cluster_list(State(state): State<ApiState>) -> Response {
    match state.membership.list().await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("can't list servers: {}", e),
        )
            .into_response(),
    }
}

async fn cluster_remove(State(state): State<ApiState>, Path(address): Path<String>) -> Response {
    match state.membership.remove(&address).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(KvsqlError::InvalidArgument { message }) => {
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("can't remove server: {}", e),
        )
            .into_response(),
    }
}
