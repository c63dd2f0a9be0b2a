//! Fetcher configuration.
//!
//! All settings are explicit values constructed at program start and
//! passed down; the core keeps no ambient defaults or singletons.

use std::time::Duration;

use crate::scheduler::{Priority, RetryPolicy, DEFAULT_MAX_SIMULTANEOUS};

/// Configuration for a [`crate::fetch::Fetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Cap on simultaneous downloads.
    pub max_simultaneous_downloads: usize,

    /// HTTP request timeout.
    pub timeout: Duration,

    /// Retry schedule for transient network failures. Digest and size
    /// mismatches are never retried.
    pub retry: RetryPolicy,

    /// Priority of download jobs submitted by this fetcher.
    pub priority: Priority,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_downloads: DEFAULT_MAX_SIMULTANEOUS,
            timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            priority: Priority::FOREGROUND,
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_simultaneous_downloads(mut self, cap: usize) -> Self {
        self.max_simultaneous_downloads = cap.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FetcherConfig::default();
        assert_eq!(config.max_simultaneous_downloads, 2);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.priority, Priority::FOREGROUND);
        assert_eq!(config.retry.max_attempts(), 3);
    }

    #[test]
    fn test_builder_clamps_cap() {
        let config = FetcherConfig::new().with_max_simultaneous_downloads(0);
        assert_eq!(config.max_simultaneous_downloads, 1);
    }
}
