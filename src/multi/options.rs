//! Pool configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Health-check interval used by `ConnectionPool::connect`.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Discovery interval used when none (or zero) is configured.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Pool maintenance options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Interval between health checks; must be non-zero
    pub check_timeout: Duration,
    /// Stored function returning the current address list, if any
    pub discovery_function: Option<String>,
    /// Interval between discovery calls
    pub discovery_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            discovery_function: None,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// Enable discovery through the stored function `name`.
    ///
    /// The function takes no arguments and returns an array of address
    /// strings.
    pub fn discovery_function(mut self, name: &str) -> Self {
        self.discovery_function = Some(name.to_string());
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Reject options the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.check_timeout.is_zero() {
            return Err(Error::wrong_check_timeout());
        }
        Ok(())
    }

    /// Fill in defaults for unset values.
    pub fn normalized(mut self) -> Self {
        if self.discovery_interval.is_zero() {
            self.discovery_interval = DEFAULT_DISCOVERY_INTERVAL;
        }
        if matches!(self.discovery_function.as_deref(), Some("")) {
            self.discovery_function = None;
        }
        self
    }
}
