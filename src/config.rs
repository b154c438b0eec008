//! Channel configuration.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// How inbound responses are matched to the calls that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// No ids on the wire. One call is outstanding at a time; the rest wait in a FIFO queue
    /// and the next inbound message answers the outstanding call.
    #[default]
    Sequential,
    /// Every request carries an `id` which the backend echoes back. Calls are pipelined.
    Tagged,
}

/// When and how often to try again after the connection drops or an attempt fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub delay: Duration,
    /// Growth factor applied per consecutive failure. `1.0` keeps the delay flat.
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Consecutive failed attempts after which the channel stops retrying.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(3),
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// A flat delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    /// A delay that grows by `multiplier` per failure, capped at `max_delay`.
    pub fn exponential(delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            delay,
            multiplier,
            max_delay,
            ..Self::default()
        }
    }

    /// Stops retrying after `max_attempts` consecutive failures.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Returns the delay before retry number `attempt` (1-based), or `None` when the policy
    /// says to stop.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let cap = self.max_delay.max(self.delay);
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            return Some(cap);
        }
        Some(Duration::from_secs_f64(scaled).min(cap))
    }
}

/// Settings for an [`RpcChannel`](crate::RpcChannel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub correlation: Correlation,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single connect attempt.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Default per-call timeout; `None` waits until a response or a connection drop.
    #[serde(with = "opt_millis")]
    pub call_timeout: Option<Duration>,
    /// Sequential mode: how long to wait for the reply owed to an abandoned call before the
    /// connection is recycled.
    #[serde(with = "millis")]
    pub owed_reply_timeout: Duration,
    /// Buffer size of the connectivity event stream.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            correlation: Correlation::Sequential,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Some(Duration::from_secs(30)),
            owed_reply_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

impl ChannelConfig {
    /// Sets how responses are matched to calls.
    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    /// Sets the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the upper bound on a single connect attempt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the buffer size of the event stream.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Sets how long an abandoned call's reply is awaited before the connection is recycled.
    pub fn with_owed_reply_timeout(mut self, timeout: Duration) -> Self {
        self.owed_reply_timeout = timeout;
        self
    }

    /// Checks the settings for values the channel cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(RpcError::Config("connect_timeout must be non-zero".into()));
        }
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(RpcError::Config("call_timeout must be non-zero".into()));
        }
        if self.owed_reply_timeout.is_zero() {
            return Err(RpcError::Config("owed_reply_timeout must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(RpcError::Config("event_capacity must be non-zero".into()));
        }
        let reconnect = &self.reconnect;
        if reconnect.enabled {
            if reconnect.delay.is_zero() {
                return Err(RpcError::Config("reconnect delay must be non-zero".into()));
            }
            if !(reconnect.multiplier >= 1.0 && reconnect.multiplier.is_finite()) {
                return Err(RpcError::Config(
                    "reconnect multiplier must be a finite value >= 1.0".into(),
                ));
            }
            if reconnect.max_delay < reconnect.delay {
                return Err(RpcError::Config(
                    "reconnect max_delay must not be below delay".into(),
                ));
            }
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
