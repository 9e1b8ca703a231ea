//! Configuration error model.

use std::time::Duration;

use thiserror::Error;

use crate::config::DeliveryGuarantee;

/// Result type used by configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Creation-time configuration failure.
///
/// Returned before anything is registered, so a failed create call never
/// leaves a half-configured topic or subscription behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested delivery guarantee is reserved but not implemented.
    #[error("unsupported delivery guarantee: {0:?}")]
    UnsupportedDeliveryGuarantee(DeliveryGuarantee),

    /// Ordering keys are declared in the configuration surface but not supported.
    #[error("ordering keys are not supported")]
    OrderingKeyUnsupported,

    /// Attribute filters are declared in the configuration surface but not supported.
    #[error("subscription filters are not supported")]
    FilterUnsupported,

    /// The ack deadline must be strictly positive.
    #[error("ack deadline must be greater than zero")]
    NonPositiveAckDeadline,

    /// `min_retry_delay` exceeds `max_retry_delay`.
    #[error("retry bounds inverted: min {min:?} > max {max:?}")]
    InvertedRetryBounds { min: Duration, max: Duration },

    /// A raw `max_retries` value outside the documented convention.
    #[error("invalid max retries value: {0}")]
    InvalidMaxRetries(i64),

    /// A topic or subscription name failed validation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl ConfigError {
    pub fn invalid_name(msg: impl Into<String>) -> Self {
        Self::InvalidName(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
