//! Consuming side of a watch stream.

use crate::core::error::{KvsqlError, KvsqlResult};
use crate::net::upgrade::{request_upgrade, UpgradeRequest};
use crate::net::Transport;
use crate::watch::{Event, WATCH_KEY_HEADER, WATCH_PROTOCOL, WATCH_REV_HEADER};
use hyper::Method;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered events between the stream reader and the consumer.
const CLIENT_CAPACITY: usize = 100;

impl UpgradeRequest {
    /// `GET /watch` with `Upgrade: watch` and the key/revision headers.
    pub fn watch(host: &str, key: &str, revision: i64) -> Self {
        Self {
            method: Method::GET,
            path: "/watch".to_string(),
            host: host.to_string(),
            protocol: WATCH_PROTOCOL,
            headers: Vec::new(),
        }
        .header(WATCH_KEY_HEADER, key)
        .header(WATCH_REV_HEADER, revision.to_string())
    }
}

/// Open a watch on the node at `address`.
///
/// The first event is `Start`. A transport or decode failure is delivered
/// as a final `Err` event before the channel closes. Cancelling `cancel`
/// closes the stream without an error event.
pub fn watch(
    transport: Arc<dyn Transport>,
    address: &str,
    key: &str,
    revision: i64,
    cancel: CancellationToken,
) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel(CLIENT_CAPACITY);
    let request = UpgradeRequest::watch(address, key, revision);
    let address = address.to_string();

    tokio::spawn(async move {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = stream_events(transport, &address, &request, &tx) => result,
        };
        if let Err(e) = result {
            tracing::debug!(%address, error = %e, "watch stream failed");
            let _ = tx.send(Event::error(e.to_string())).await;
        }
    });

    rx
}

async fn stream_events(
    transport: Arc<dyn Transport>,
    address: &str,
    request: &UpgradeRequest,
    tx: &mpsc::Sender<Event>,
) -> KvsqlResult<()> {
    let stream = transport.connect(address).await?;
    let io = request_upgrade(stream, request).await?;
    let mut lines = BufReader::new(io).lines();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        if tx.send(event).await.is_err() {
            // consumer went away
            return Ok(());
        }
    }

    Err(KvsqlError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "watch stream closed",
    )))
}
