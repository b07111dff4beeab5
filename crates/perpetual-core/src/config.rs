//! Connection and channel configuration
//!
//! All timing knobs of a perpetual channel live here. Every structure has a
//! production `Default`, a `testing()` preset with short timings, and a
//! `validate()` method that channel construction calls before anything is
//! dialed.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

fn require_positive(value: Duration, field: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidDuration { field });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Liveness timers of a single physical connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Idle time after which a ping is sent
    pub ping_interval: Duration,
    /// Idle time after which the connection is considered dead
    pub read_timeout: Duration,
    /// Time allowed to walk the handler chain to its final stage
    pub init_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            init_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Short timers for tests
    pub fn testing() -> Self {
        Self {
            ping_interval: Duration::from_millis(300),
            read_timeout: Duration::from_millis(1000),
            init_timeout: Duration::from_millis(500),
        }
    }

    /// Every timer accepts zero; a zero timer fires as soon as it is armed
    pub fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Retry Policies
// ----------------------------------------------------------------------------

/// Bounded retry of channel-level sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub multiplier: f32,
    /// Time one attempt may wait for a connection before it counts as failed
    pub attempt_timeout: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl SendRetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast retries for tests
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            attempt_timeout: Duration::from_millis(500),
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(self.initial_delay, self.max_delay, self.multiplier, attempt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        require_positive(self.attempt_timeout, "attempt_timeout")?;
        validate_backoff(self.initial_delay, self.max_delay, self.multiplier)
    }
}

/// Backoff between failed dials of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first redial
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub multiplier: f32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Fast redials for tests
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
        }
    }

    /// Delay before redial number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(self.initial_delay, self.max_delay, self.multiplier, attempt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_backoff(self.initial_delay, self.max_delay, self.multiplier)
    }
}

fn backoff(initial: Duration, max: Duration, multiplier: f32, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = initial.as_millis() as f64 * (multiplier as f64).powi(exponent);
    if !delay_ms.is_finite() || delay_ms >= max.as_millis() as f64 {
        return max;
    }
    Duration::from_millis(delay_ms as u64)
}

fn validate_backoff(initial: Duration, max: Duration, multiplier: f32) -> Result<(), ConfigError> {
    require_positive(initial, "initial_delay")?;
    if max < initial {
        return Err(ConfigError::InvalidRetryPolicy(
            "max_delay must not be smaller than initial_delay".to_string(),
        ));
    }
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::InvalidRetryPolicy(format!(
            "multiplier must be at least 1.0, got {}",
            multiplier
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Rotation and retry behavior of a perpetual channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Name used in logs
    pub name: String,
    /// Lifetime of a connection before a replacement is dialed
    pub shift_duration: Duration,
    /// Overlap between a replacement opening and older connections closing
    pub switch_duration: Duration,
    /// Timers applied to every connection of the channel
    pub connection: ConnectionConfig,
    /// Bound on channel-level send retries
    pub send_retry: SendRetryPolicy,
    /// Backoff between failed dials
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "perpetual".to_string(),
            shift_duration: Duration::from_secs(60 * 60),
            switch_duration: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
            send_retry: SendRetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChannelConfig {
    /// Default configuration under a given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Short rotation and timers for tests
    pub fn testing() -> Self {
        Self {
            name: "test".to_string(),
            shift_duration: Duration::from_millis(1000),
            switch_duration: Duration::from_millis(200),
            connection: ConnectionConfig::testing(),
            send_retry: SendRetryPolicy::testing(),
            reconnect: ReconnectPolicy::testing(),
        }
    }

    /// Builder-style name override
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder-style rotation override
    pub fn with_rotation(mut self, shift: Duration, switch: Duration) -> Self {
        self.shift_duration = shift;
        self.switch_duration = switch;
        self
    }

    /// Builder-style connection timers override
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Validate every nested setting
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Zero switch is allowed, zero shift would redial in a loop
        require_positive(self.shift_duration, "shift_duration")?;
        self.connection.validate()?;
        self.send_retry.validate()?;
        self.reconnect.validate()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ChannelConfig::default().validate().is_ok());
        assert!(ChannelConfig::testing().validate().is_ok());
        assert_eq!(ChannelConfig::default().shift_duration, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let config = ChannelConfig::default().with_rotation(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                field: "shift_duration"
            })
        );

        let mut config = ChannelConfig::default();
        config.reconnect.initial_delay = Duration::ZERO;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                field: "initial_delay"
            })
        );

        let mut config = ChannelConfig::default();
        config.send_retry.attempt_timeout = Duration::ZERO;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                field: "attempt_timeout"
            })
        );
    }

    #[test]
    fn test_zero_switch_and_timers_accepted() {
        let config = ChannelConfig::default()
            .with_rotation(Duration::from_secs(60), Duration::ZERO)
            .with_connection(ConnectionConfig {
                ping_interval: Duration::ZERO,
                read_timeout: Duration::ZERO,
                init_timeout: Duration::ZERO,
            });
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let mut config = ChannelConfig::default();
        config.send_retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryPolicy(_))
        ));

        let mut config = ChannelConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryPolicy(_))
        ));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = SendRetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(20), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }
}
