//! Server side of a watch stream.
//!
//! After the upgrade the stream carries newline-delimited JSON [`Event`]s:
//! one `Start` frame, then historical rows from the requested revision,
//! then live rows from the broadcaster. The stream ends when the client
//! goes away, the subscription is evicted or cancelled, or a write fails.

use crate::core::error::KvsqlResult;
use crate::kv::{KeyMatch, KvStore};
use crate::watch::{Event, Subscription, WATCH_KEY_HEADER, WATCH_PROTOCOL, WATCH_REV_HEADER};
use hyper::header::{HeaderMap, UPGRADE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Parsed watch upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    /// Exact key, or prefix with a trailing `%`.
    pub key: String,
    /// First revision to replay; `<= 0` streams live events only.
    pub revision: i64,
}

impl WatchRequest {
    /// Validate the upgrade headers. The error is the 400 response body.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, &'static str> {
        let upgrade = headers.get(UPGRADE).and_then(|v| v.to_str().ok());
        if upgrade != Some(WATCH_PROTOCOL) {
            return Err("Missing or invalid upgrade header");
        }

        let key = headers
            .get(WATCH_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|k| !k.is_empty())
            .ok_or("Missing key header")?;

        let revision = headers
            .get(WATCH_REV_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|r| !r.is_empty())
            .ok_or("Missing rev header")?
            .parse::<i64>()
            .map_err(|_| "Bad revision")?;

        Ok(Self {
            key: key.to_string(),
            revision,
        })
    }

    pub fn matcher(&self) -> KeyMatch {
        KeyMatch::parse(&self.key)
    }
}

/// Stream one watch over `io`.
///
/// `subscription` must already be registered so that no live event
/// committed during replay is lost. Live events at or below the last
/// replayed revision are skipped.
pub async fn serve_watch<S>(
    io: S,
    request: WatchRequest,
    mut subscription: Subscription,
    store: KvStore,
) -> KvsqlResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, writer) = tokio::io::split(io);
    let mut writer = BufWriter::new(writer);
    let matcher = request.matcher();

    send(&mut writer, &Event::start()).await?;

    let mut last_sent = 0;
    if request.revision > 0 {
        for kv in store.replay(&request.key, request.revision).await? {
            last_sent = kv.revision;
            send(&mut writer, &Event::kv(kv)).await?;
        }
    }

    tracing::debug!(
        subscriber = subscription.id(),
        key = %request.key,
        revision = request.revision,
        "watch started"
    );

    let mut probe = [0u8; 64];
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(kv) = event else { break };
                if kv.revision <= last_sent || !matcher.matches(&kv) {
                    continue;
                }
                send(&mut writer, &Event::kv(kv)).await?;
            }
            read = reader.read(&mut probe) => {
                // The client never sends after the upgrade; EOF or an error
                // means it is gone.
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    }

    tracing::debug!(subscriber = subscription.id(), key = %request.key, "watch ended");
    Ok(())
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, event: &Event) -> KvsqlResult<()> {
    writer.write_all(&event.to_line()?).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_parse_valid_request() {
        let req = WatchRequest::from_headers(&headers(&[
            ("upgrade", "watch"),
            ("x-watch-key", "/registry/%"),
            ("x-watch-rev", "5"),
        ]))
        .unwrap();
        assert_eq!(req.key, "/registry/%");
        assert_eq!(req.revision, 5);
        assert!(req.matcher().is_prefix());
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(
            WatchRequest::from_headers(&headers(&[("upgrade", "dqlite")])),
            Err("Missing or invalid upgrade header")
        );
        assert_eq!(
            WatchRequest::from_headers(&headers(&[("upgrade", "watch"), ("x-watch-rev", "1")])),
            Err("Missing key header")
        );
        assert_eq!(
            WatchRequest::from_headers(&headers(&[("upgrade", "watch"), ("x-watch-key", "a")])),
            Err("Missing rev header")
        );
        assert_eq!(
            WatchRequest::from_headers(&headers(&[
                ("upgrade", "watch"),
                ("x-watch-key", "a"),
                ("x-watch-rev", "five"),
            ])),
            Err("Bad revision")
        );
    }
}
