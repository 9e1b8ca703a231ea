//! Strongly-typed identifiers used across the broker.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};

/// Longest accepted topic or subscription name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Identifier of a topic (publish target).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(Uuid);

/// Identifier of a subscription (consumer queue over a topic).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

/// Identifier of a single lease handed out by `deliver`.
///
/// A fresh lease id is minted on every delivery attempt, so a consumer holding
/// an older lease for a redelivered message can be told apart from the
/// current holder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| ConfigError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(TopicId, "TopicId");
impl_uuid_newtype!(SubscriptionId, "SubscriptionId");
impl_uuid_newtype!(LeaseId, "LeaseId");

/// Identifier of a published message.
///
/// `sequence` is assigned by the message store at publish time and is
/// monotonically increasing per topic, starting at 1. Ordering is by topic
/// first, then sequence, so within one subscription the natural order is
/// publish order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub topic: TopicId,
    pub sequence: u64,
}

impl MessageId {
    pub fn new(topic: TopicId, sequence: u64) -> Self {
        Self { topic, sequence }
    }
}

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.topic, self.sequence)
    }
}

/// Validate a topic or subscription name.
///
/// Names must be non-empty, at most [`MAX_NAME_LENGTH`] bytes and contain only
/// alphanumeric characters, `-`, `_` or `.`.
pub fn validate_name(name: &str) -> ConfigResult<()> {
    if name.is_empty() {
        return Err(ConfigError::invalid_name("name must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ConfigError::invalid_name(format!(
            "name is {} bytes, maximum is {MAX_NAME_LENGTH}",
            name.len()
        )));
    }
    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_alphanumeric() && !matches!(ch, '-' | '_' | '.'))
    {
        return Err(ConfigError::invalid_name(format!(
            "'{name}' contains invalid character {ch:?}"
        )));
    }
    Ok(())
}
