//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Pool Options
// ============================================================================

/// Connection pool configuration.
///
/// A zero duration disables the corresponding feature. Durations are
/// (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum number of physical connections, including those being created
    pub max_size: usize,
    /// Maximum number of queued waiters (negative = unbounded)
    pub max_wait_queue_size: i32,
    /// Close connections that stayed idle this long
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Close connections older than this, once they are idle
    #[serde(with = "millis")]
    pub max_lifetime: Duration,
    /// Period of the eviction sweeper
    #[serde(with = "millis")]
    pub cleaner_period: Duration,
    /// How long an acquire may wait for a connection
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    /// Default timeout applied by `Pool::execute`
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    /// Allow several in-flight commands per leased connection
    pub pipelined: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 4,
            max_wait_queue_size: -1,
            idle_timeout: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            cleaner_period: Duration::from_millis(1000),
            connection_timeout: Duration::from_secs(30),
            command_timeout: Duration::ZERO,
            pipelined: false,
        }
    }
}

impl PoolOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections.
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Set the wait queue bound (negative = unbounded).
    pub fn max_wait_queue_size(mut self, max: i32) -> Self {
        self.max_wait_queue_size = max;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum connection lifetime.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the eviction sweeper period.
    pub fn cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period = period;
        self
    }

    /// Set the acquire timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the default `execute` timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Enable or disable pipelining on leased connections.
    pub fn pipelined(mut self, pipelined: bool) -> Self {
        self.pipelined = pipelined;
        self
    }

    /// Check the options can build a pool.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("Pool max size must be > 0".to_string()));
        }
        Ok(())
    }

    /// The wait queue bound, `None` when unbounded.
    pub fn wait_queue_bound(&self) -> Option<usize> {
        usize::try_from(self.max_wait_queue_size).ok()
    }

    /// Whether the sweeper has anything to do.
    pub fn eviction_enabled(&self) -> bool {
        !self.cleaner_period.is_zero()
            && (!self.idle_timeout.is_zero() || !self.max_lifetime.is_zero())
    }

    pub(crate) fn idle_timeout_opt(&self) -> Option<Duration> {
        non_zero(self.idle_timeout)
    }

    pub(crate) fn max_lifetime_opt(&self) -> Option<Duration> {
        non_zero(self.max_lifetime)
    }

    pub(crate) fn connection_timeout_opt(&self) -> Option<Duration> {
        non_zero(self.connection_timeout)
    }

    pub(crate) fn command_timeout_opt(&self) -> Option<Duration> {
        non_zero(self.command_timeout)
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
