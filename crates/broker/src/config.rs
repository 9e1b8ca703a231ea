//! Runtime configuration for the broker, the redelivery scheduler and workers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::JitterMode;

/// Lower bound on the time between two sweeps.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Broker-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Upper bound between redelivery sweeps. The scheduler never waits longer
    /// than the smallest registered ack deadline, whatever this says.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: Duration,
    /// Jitter applied to retry delays.
    #[serde(default)]
    pub jitter: JitterMode,
    /// Name of the scheduler thread, for logging.
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_scheduler_name() -> String {
    "redelivery-scheduler".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            jitter: JitterMode::None,
            scheduler_name: default_scheduler_name(),
        }
    }
}

impl BrokerConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = name.into();
        self
    }

    /// Sweep interval bounded by the smallest ack deadline, if any, and
    /// never below [`MIN_SWEEP_INTERVAL`].
    pub fn effective_sweep_interval(&self, min_ack_deadline: Option<Duration>) -> Duration {
        let interval = match min_ack_deadline {
            Some(deadline) => self.sweep_interval.min(deadline),
            None => self.sweep_interval,
        };
        interval.max(MIN_SWEEP_INTERVAL)
    }
}

/// Subscription worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Name for logging and for the worker thread.
    pub name: String,
    /// How long to wait before polling again when nothing is deliverable.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "subscription-worker".to_string(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_capped_by_ack_deadline() {
        let cfg = BrokerConfig::default().with_sweep_interval(Duration::from_secs(5));
        assert_eq!(
            cfg.effective_sweep_interval(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            cfg.effective_sweep_interval(Some(Duration::from_secs(30))),
            Duration::from_secs(5)
        );
        assert_eq!(cfg.effective_sweep_interval(None), Duration::from_secs(5));
    }

    #[test]
    fn zero_sweep_interval_is_floored() {
        let cfg = BrokerConfig::default().with_sweep_interval(Duration::ZERO);
        assert_eq!(cfg.effective_sweep_interval(None), MIN_SWEEP_INTERVAL);
        assert_eq!(
            cfg.effective_sweep_interval(Some(Duration::from_secs(1))),
            MIN_SWEEP_INTERVAL
        );

        let tiny_deadline = BrokerConfig::default();
        assert_eq!(
            tiny_deadline.effective_sweep_interval(Some(Duration::from_millis(1))),
            MIN_SWEEP_INTERVAL
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: BrokerConfig = serde_json::from_str(r#"{"jitter": "full"}"#).unwrap();
        assert_eq!(cfg.jitter, JitterMode::Full);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
    }
}
