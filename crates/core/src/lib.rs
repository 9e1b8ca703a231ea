//! `courier-core`: delivery engine building blocks.
//!
//! This crate contains the **pure** pieces of the broker: identifiers, message
//! and configuration types, the backoff calculator and the clock abstraction.
//! Nothing here performs IO or spawns threads.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod message;

pub use backoff::{Backoff, FixedRandom, JitterMode, RandomSource, ThreadRandom};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_MAX_RETRIES, DeliveryGuarantee, MaxRetries, RetryPolicy, SubscriptionConfig,
    TopicConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use id::{LeaseId, MessageId, SubscriptionId, TopicId, validate_name};
pub use message::{Attributes, Message};
