//! Topic, subscription and retry configuration.
//!
//! Configuration is validated once, at creation time, and frozen afterwards.
//! There is deliberately no mutation API: changing a subscription's policy
//! means creating a new subscription.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Retry budget used when `max_retries` is left at its default.
pub const DEFAULT_MAX_RETRIES: u32 = 100;

/// Default lower bound between retries.
pub const DEFAULT_MIN_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound between retries.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// Default ack deadline for subscriptions built with `Default`.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(30);

/// Raw value meaning "never dead-letter".
pub const INFINITE_RETRIES: i64 = -1;

/// Raw value meaning "dead-letter on the first failure".
pub const NO_RETRIES: i64 = -2;

/// Delivery contract of a topic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Every message is delivered to each subscription at least once.
    #[default]
    AtLeastOnce,
    /// Reserved. Rejected at topic creation.
    ExactlyOnce,
}

/// Configuration used when creating a topic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopicConfig {
    pub delivery_guarantee: DeliveryGuarantee,

    /// Attribute used to group messages for ordered delivery. Reserved;
    /// any value is rejected at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl TopicConfig {
    pub fn at_least_once() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.delivery_guarantee != DeliveryGuarantee::AtLeastOnce {
            return Err(ConfigError::UnsupportedDeliveryGuarantee(
                self.delivery_guarantee,
            ));
        }
        if self.ordering_key.is_some() {
            return Err(ConfigError::OrderingKeyUnsupported);
        }
        Ok(())
    }
}

/// Dead-letter budget of a retry policy.
///
/// Serialises as the raw integer convention used by deployment manifests:
/// `0` default, `n > 0` finite, `-1` infinite, `-2` no retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum MaxRetries {
    /// Substitute [`DEFAULT_MAX_RETRIES`].
    #[default]
    UseDefault,
    /// Dead-letter after `n` failed attempts.
    Finite(NonZeroU32),
    /// Never dead-letter.
    Infinite,
    /// Dead-letter on the first failure; redelivery is disabled.
    Immediate,
}

impl MaxRetries {
    /// Finite budget of `n` attempts. `0` maps to [`MaxRetries::UseDefault`].
    pub fn finite(n: u32) -> Self {
        NonZeroU32::new(n).map_or(Self::UseDefault, Self::Finite)
    }

    /// Number of attempts after which a message is dead-lettered, if any.
    pub fn limit(&self) -> Option<u32> {
        match self {
            MaxRetries::UseDefault => Some(DEFAULT_MAX_RETRIES),
            MaxRetries::Finite(n) => Some(n.get()),
            MaxRetries::Infinite => None,
            MaxRetries::Immediate => Some(1),
        }
    }
}

impl TryFrom<i64> for MaxRetries {
    type Error = ConfigError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MaxRetries::UseDefault),
            INFINITE_RETRIES => Ok(MaxRetries::Infinite),
            NO_RETRIES => Ok(MaxRetries::Immediate),
            n if n > 0 => u32::try_from(n)
                .ok()
                .and_then(NonZeroU32::new)
                .map(MaxRetries::Finite)
                .ok_or(ConfigError::InvalidMaxRetries(n)),
            n => Err(ConfigError::InvalidMaxRetries(n)),
        }
    }
}

impl From<MaxRetries> for i64 {
    fn from(value: MaxRetries) -> Self {
        match value {
            MaxRetries::UseDefault => 0,
            MaxRetries::Finite(n) => i64::from(n.get()),
            MaxRetries::Infinite => INFINITE_RETRIES,
            MaxRetries::Immediate => NO_RETRIES,
        }
    }
}

/// How a subscription retries failed deliveries.
///
/// Bounds are backend-agnostic; clamping them to what a particular backend
/// supports happens in that backend's provisioning step, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Minimum time to wait between retries.
    #[serde(default = "default_min_retry_delay")]
    pub min_retry_delay: Duration,
    /// Maximum time to wait between retries.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: Duration,
    #[serde(default)]
    pub max_retries: MaxRetries,
}

fn default_min_retry_delay() -> Duration {
    DEFAULT_MIN_RETRY_DELAY
}

fn default_max_retry_delay() -> Duration {
    DEFAULT_MAX_RETRY_DELAY
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_retry_delay: DEFAULT_MIN_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            max_retries: MaxRetries::UseDefault,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        min_retry_delay: Duration,
        max_retry_delay: Duration,
        max_retries: MaxRetries,
    ) -> Self {
        Self {
            min_retry_delay,
            max_retry_delay,
            max_retries,
        }
    }

    /// Policy that dead-letters on the first failure.
    pub fn no_retries() -> Self {
        Self {
            max_retries: MaxRetries::Immediate,
            ..Default::default()
        }
    }

    /// Policy that never dead-letters.
    pub fn infinite() -> Self {
        Self {
            max_retries: MaxRetries::Infinite,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: MaxRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_retry_delay > self.max_retry_delay {
            return Err(ConfigError::InvertedRetryBounds {
                min: self.min_retry_delay,
                max: self.max_retry_delay,
            });
        }
        Ok(())
    }
}

/// Configuration used when creating a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Time a consumer has to acknowledge a delivered message.
    pub ack_deadline: Duration,

    /// How long an undelivered message is kept before it is dropped.
    /// Zero keeps it until it is acknowledged or dead-lettered.
    #[serde(default)]
    pub message_retention: Duration,

    /// Retry behaviour; [`RetryPolicy::default`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Attribute filter expression. Reserved; any value is rejected at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_DEADLINE)
    }
}

impl SubscriptionConfig {
    pub fn new(ack_deadline: Duration) -> Self {
        Self {
            ack_deadline,
            message_retention: Duration::ZERO,
            retry_policy: None,
            filter: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.message_retention = retention;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Retry policy with defaults substituted.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    /// Retention window, or `None` when messages are kept until settled.
    pub fn retention_window(&self) -> Option<Duration> {
        (!self.message_retention.is_zero()).then_some(self.message_retention)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.filter.is_some() {
            return Err(ConfigError::FilterUnsupported);
        }
        if self.ack_deadline.is_zero() {
            return Err(ConfigError::NonPositiveAckDeadline);
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}
