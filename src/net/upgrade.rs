//! HTTP/1.1 protocol upgrades.
//!
//! Both the engine's replication traffic and watch streams start life as an
//! HTTP request on the control-plane port and are then switched to a raw
//! byte stream. [`request_upgrade`] is the client half; the server half is
//! an axum handler that answers `101 Switching Protocols` and picks the
//! connection up from `hyper::upgrade::OnUpgrade`.

use crate::core::error::{KvsqlError, KvsqlResult};
use crate::net::tunnel::tunnel;
use crate::net::Transport;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{HeaderMap, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;

/// Path of the engine upgrade endpoint.
pub const DQLITE_PATH: &str = "/dqlite";
/// Upgrade token of the engine protocol.
pub const DQLITE_PROTOCOL: &str = "dqlite";

/// An upgraded connection usable as a tokio stream.
pub type UpgradedStream = TokioIo<Upgraded>;

/// Request line and headers of an upgrade handshake.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: Method,
    pub path: String,
    pub host: String,
    pub protocol: &'static str,
    pub headers: Vec<(&'static str, String)>,
}

impl UpgradeRequest {
    /// `POST /dqlite` with `Upgrade: dqlite`.
    pub fn dqlite(host: &str) -> Self {
        Self {
            method: Method::POST,
            path: DQLITE_PATH.to_string(),
            host: host.to_string(),
            protocol: DQLITE_PROTOCOL,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Whether `headers` ask to switch to `protocol`.
pub fn wants_upgrade(headers: &HeaderMap, protocol: &str) -> bool {
    headers
        .get(UPGRADE)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(protocol.as_bytes()))
}

/// Perform an HTTP/1.1 upgrade handshake over `io` and return the switched
/// stream.
///
/// Fails unless the server answers `101` with a matching `Upgrade` header.
pub async fn request_upgrade<S>(io: S, request: &UpgradeRequest) -> KvsqlResult<UpgradedStream>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(error = %e, "upgrade connection ended");
        }
    });

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(request.path.as_str())
        .header(HOST, request.host.as_str())
        .header(UPGRADE, request.protocol)
        .header(CONNECTION, "Upgrade");
    for (name, value) in &request.headers {
        builder = builder.header(*name, value.as_str());
    }
    let req = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| KvsqlError::http(e.to_string()))?;

    let response = sender.send_request(req).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(KvsqlError::upgrade(format!(
            "expected status code 101 got {}",
            response.status().as_u16()
        )));
    }
    if !wants_upgrade(response.headers(), request.protocol) {
        return Err(KvsqlError::upgrade("missing or unexpected Upgrade header in response"));
    }

    let upgraded = hyper::upgrade::on(response).await?;
    Ok(TokioIo::new(upgraded))
}

/// Dials the engine protocol on a remote node.
///
/// The caller gets the near end of a local socket pair; the far end is
/// tunneled to the remote node's engine over an upgraded connection.
#[derive(Clone)]
pub struct Dialer {
    transport: Arc<dyn Transport>,
}

impl Dialer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn dial(&self, address: &str) -> KvsqlResult<UnixStream> {
        let stream = self.transport.connect(address).await?;
        let remote = request_upgrade(stream, &UpgradeRequest::dqlite(address)).await?;

        let (local, far) = UnixStream::pair()?;
        let address = address.to_string();
        tokio::spawn(async move {
            let outcome = tunnel(remote, far).await;
            if let Some(e) = outcome.error {
                tracing::debug!(%address, error = %e, "outbound engine tunnel failed");
            }
        });
        Ok(local)
    }
}

/// Server half of an engine upgrade: wait for the switched connection and
/// tunnel it to the local engine socket.
pub async fn accept_engine(on_upgrade: OnUpgrade, engine_socket: PathBuf) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => TokioIo::new(upgraded),
        Err(e) => {
            tracing::warn!(error = %e, "engine upgrade failed");
            return;
        }
    };
    let engine = match UnixStream::connect(&engine_socket).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::warn!(socket = %engine_socket.display(), error = %e, "engine socket unavailable");
            return;
        }
    };
    let outcome = tunnel(upgraded, engine).await;
    if let Some(e) = outcome.error {
        tracing::debug!(error = %e, "inbound engine tunnel failed");
    }
}
