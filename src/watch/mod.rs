//! Watch propagation.
//!
//! Committed mutations reach watchers in three hops: the writing node's
//! [`notifier`] forwards the row to the leader, the leader's
//! [`broadcaster`] fans it out to local subscriptions, and each
//! subscription is streamed to its client by [`stream`]. The [`client`]
//! module is the consuming side of that stream.

pub mod broadcaster;
pub mod client;
pub mod notifier;
pub mod stream;

pub use broadcaster::{Broadcaster, Subscription};
pub use notifier::{ClusterNotifier, Notifier};

use crate::kv::KeyValue;
use serde::{Deserialize, Serialize};

/// Upgrade token of the watch stream.
pub const WATCH_PROTOCOL: &str = "watch";
/// Header carrying the watched key.
pub const WATCH_KEY_HEADER: &str = "X-Watch-Key";
/// Header carrying the start revision.
pub const WATCH_REV_HEADER: &str = "X-Watch-Rev";

/// One frame of a watch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "KV", default)]
    pub kv: Option<KeyValue>,
    #[serde(rename = "Err", default)]
    pub err: Option<String>,
    #[serde(rename = "Start", default)]
    pub start: bool,
}

impl Event {
    /// Synthetic frame sent once the subscription is in place.
    pub fn start() -> Self {
        Self {
            start: true,
            ..Self::default()
        }
    }

    pub fn kv(kv: KeyValue) -> Self {
        Self {
            kv: Some(kv),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            err: Some(message.into()),
            ..Self::default()
        }
    }

    /// JSON encoding followed by a newline.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_frame_encoding() {
        let line = Event::start().to_line().unwrap();
        assert_eq!(line, b"{\"KV\":null,\"Err\":null,\"Start\":true}\n");
    }

    #[test]
    fn test_decode_tolerates_missing_fields() {
        let event: Event = serde_json::from_str(r#"{"Err":"boom"}"#).unwrap();
        assert_eq!(event, Event::error("boom"));
    }
}
