//! Reconnection backoff
//!
//! The delay grows by a fixed percentage after every failed attempt and wraps back to
//! the default once it passes the ceiling, so a client never waits longer than the
//! ceiling between attempts.

use std::time::Duration;
use tunnelforge_common::constants::{
    RECONNECT_CEILING_MS, RECONNECT_DEFAULT_INTERVAL_MS, RECONNECT_GROWTH_PERCENT,
};

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub default_interval: Duration,
    pub ceiling: Duration,
    pub growth_percent: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            default_interval: Duration::from_millis(RECONNECT_DEFAULT_INTERVAL_MS),
            ceiling: Duration::from_millis(RECONNECT_CEILING_MS),
            growth_percent: RECONNECT_GROWTH_PERCENT,
        }
    }
}

impl ReconnectConfig {
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            default_interval: interval,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectState {
    config: ReconnectConfig,
    interval: Duration,
    reconnecting: bool,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            interval: config.default_interval,
            config,
            reconnecting: false,
        }
    }

    /// Delay to wait before the next attempt; grows the interval for the one after
    pub fn next_delay(&mut self) -> Duration {
        self.reconnecting = true;
        let delay = self.interval;

        let millis = self.interval.as_millis() as u64;
        let grown = millis + millis * self.config.growth_percent / 100;
        self.interval = if grown > self.config.ceiling.as_millis() as u64 {
            self.config.default_interval
        } else {
            Duration::from_millis(grown)
        };

        delay
    }

    /// A connection succeeded
    pub fn reset(&mut self) {
        self.interval = self.config.default_interval;
        self.reconnecting = false;
    }

    /// Whether at least one attempt failed since the last successful connection
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    #[cfg(test)]
    fn current_interval(&self) -> Duration {
        self.interval
    }
}
