//! HTTP client for other nodes' control-plane API.

use crate::cluster::NodeInfo;
use crate::core::error::{KvsqlError, KvsqlResult};
use crate::kv::KeyValue;
use crate::net::Transport;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;

const JSON: &str = "application/json; charset=utf-8";

/// One-request-per-connection API client.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Forward a committed row to the broadcaster on `address`.
    pub async fn notify(&self, address: &str, kv: &KeyValue) -> KvsqlResult<()> {
        let body = serde_json::to_vec(kv)?;
        let (status, _) = self
            .request(address, Method::POST, "/watch", Some(body))
            .await
            .map_err(|e| KvsqlError::notification(e.to_string()))?;
        if status != StatusCode::OK {
            return Err(KvsqlError::notification(format!(
                "HTTP request failed with: {}",
                status
            )));
        }
        Ok(())
    }

    /// Cluster topology as seen by `address`.
    pub async fn cluster(&self, address: &str) -> KvsqlResult<Vec<NodeInfo>> {
        let (status, body) = self.request(address, Method::GET, "/cluster", None).await?;
        if status != StatusCode::OK {
            return Err(failure(status, &body));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Ask `address` to remove the member at `member`.
    pub async fn remove(&self, address: &str, member: &str) -> KvsqlResult<()> {
        let path = format!("/cluster/{}", member);
        let (status, body) = self.request(address, Method::DELETE, &path, None).await?;
        match status {
            StatusCode::OK => Ok(()),
            StatusCode::BAD_REQUEST => Err(KvsqlError::invalid_argument(body_text(&body))),
            _ => Err(failure(status, &body)),
        }
    }

    async fn request(
        &self,
        address: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> KvsqlResult<(StatusCode, Bytes)> {
        let stream = self.transport.connect(address).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "api connection ended");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, address);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, JSON);
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| KvsqlError::http(e.to_string()))?;

        let response = sender.send_request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}

fn body_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}

fn failure(status: StatusCode, body: &[u8]) -> KvsqlError {
    let text = body_text(body);
    if text.is_empty() {
        KvsqlError::http(format!("HTTP request failed with: {}", status))
    } else {
        KvsqlError::http(format!("HTTP request failed with: {}: {}", status, text))
    }
}
