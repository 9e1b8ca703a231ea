use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// Message attributes (key → value). Order carries no meaning.
pub type Attributes = BTreeMap<String, String>;

/// An immutable published message.
///
/// Owned by the message store for its retention lifetime; delivery records
/// refer to it by [`MessageId`] only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub attributes: Attributes,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Decode a JSON payload into a typed message.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
