//! Broker front-door error model.

use thiserror::Error;

use courier_core::{ConfigError, MessageId, SubscriptionId};

use crate::dead_letter::DeadLetterError;
use crate::store::StoreError;

/// Error returned by [`crate::Broker`] operations.
///
/// ## Error Categories
///
/// - **InvalidConfig / *Exists**: creation-time failures, nothing is registered
/// - **LeaseExpired / LeaseNotFound**: expected outcomes of at-least-once
///   races between consumers and the redelivery sweep; report, don't alarm
/// - **StorageUnavailable**: the storage collaborator failed; publish fails closed
/// - **DeadLetterUnavailable**: the dead-letter destination refused a message;
///   the message stays tracked and is retried on the next sweep
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("topic already exists: {0}")]
    TopicExists(String),

    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("lease expired for message {0}")]
    LeaseExpired(MessageId),

    #[error("no lease for message {0}: already acknowledged or dead-lettered")]
    LeaseNotFound(MessageId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),

    #[error("dead-letter destination unavailable: {0}")]
    DeadLetterUnavailable(#[from] DeadLetterError),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// `true` for the lease outcomes that are a normal part of at-least-once
    /// delivery rather than a fault.
    pub fn is_lease_race(&self) -> bool {
        matches!(self, BrokerError::LeaseExpired(_) | BrokerError::LeaseNotFound(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
