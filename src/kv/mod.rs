//! MVCC key-value engine over a relational table.
//!
//! Every mutation appends one `key_value` row stamped with the next global
//! revision. This module contains:
//! - [`db`] - Schema, named statements and the retrying storage handle
//! - [`retry`] - Bounded retry of "database locked" failures
//! - [`store`] - List/Get/Update/Delete and compaction entry points
//! - [`compaction`] - TTL sweep and history compaction

pub mod compaction;
pub mod db;
pub mod retry;
pub mod store;

pub use db::{Db, ListQuery};
pub use store::KvStore;

use serde::{Deserialize, Serialize};

/// Suffix that turns a key argument into a prefix match.
pub const WILDCARD: char = '%';

/// One historical row of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValue {
    /// Storage-assigned row id, never reused.
    #[serde(rename = "ID")]
    pub id: i64,
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub old_value: Vec<u8>,
    pub old_revision: i64,
    pub create_revision: i64,
    pub revision: i64,
    /// Absolute expiry in UNIX seconds, 0 for none.
    #[serde(rename = "TTL")]
    pub ttl: i64,
    pub version: i64,
    /// Tombstone marker.
    pub del: bool,
}

impl KeyValue {
    /// Whether this row is a live (non-tombstone) version.
    pub fn is_live(&self) -> bool {
        !self.del
    }
}

/// Parsed key argument: exact key or prefix (trailing `%`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    Exact(String),
    Prefix(String),
}

impl KeyMatch {
    pub fn parse(key: &str) -> Self {
        match key.strip_suffix(WILDCARD) {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(key.to_string()),
        }
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }

    /// Key or prefix without the wildcard.
    pub fn stem(&self) -> &str {
        match self {
            Self::Exact(k) | Self::Prefix(k) => k,
        }
    }

    pub fn matches(&self, kv: &KeyValue) -> bool {
        match self {
            Self::Exact(k) => kv.key == *k,
            Self::Prefix(p) => kv.key.starts_with(p.as_str()),
        }
    }
}

/// Serde adapter encoding byte payloads as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str) -> KeyValue {
        KeyValue {
            id: 1,
            key: key.to_string(),
            value: b"v".to_vec(),
            old_value: Vec::new(),
            old_revision: 0,
            create_revision: 2,
            revision: 2,
            ttl: 0,
            version: 1,
            del: false,
        }
    }

    #[test]
    fn test_key_match_parse() {
        assert_eq!(
            KeyMatch::parse("/registry/pods/%"),
            KeyMatch::Prefix("/registry/pods/".to_string())
        );
        assert_eq!(KeyMatch::parse("/a"), KeyMatch::Exact("/a".to_string()));
        assert!(KeyMatch::parse("%").is_prefix());
        assert_eq!(KeyMatch::parse("%").stem(), "");
    }

    #[test]
    fn test_key_match_filtering() {
        let prefix = KeyMatch::parse("/registry/%");
        assert!(prefix.matches(&kv("/registry/pods/a")));
        assert!(!prefix.matches(&kv("/other")));

        let exact = KeyMatch::parse("/registry/pods/a");
        assert!(exact.matches(&kv("/registry/pods/a")));
        assert!(!exact.matches(&kv("/registry/pods/ab")));
    }

    #[test]
    fn test_key_value_json_shape() {
        let json = serde_json::to_value(kv("foo")).unwrap();
        assert_eq!(json["ID"], 1);
        assert_eq!(json["Key"], "foo");
        assert_eq!(json["Value"], "dg==");
        assert_eq!(json["CreateRevision"], 2);
        assert_eq!(json["TTL"], 0);
        assert_eq!(json["Del"], false);
    }

    #[test]
    fn test_null_payload_decodes_empty() {
        let json = r#"{"ID":3,"Key":"k","Value":null,"OldValue":"","OldRevision":0,
            "CreateRevision":3,"Revision":3,"TTL":0,"Version":1,"Del":true}"#;
        let kv: KeyValue = serde_json::from_str(json).unwrap();
        assert!(kv.value.is_empty());
        assert!(!kv.is_live());
    }
}
