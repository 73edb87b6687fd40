//! Operation log configuration.

use std::time::Duration;

/// Configuration for an [`crate::OperationLog`].
#[derive(Debug, Clone)]
pub struct OplogConfig {
    /// Minimum age (since append) before a fully confirmed operation may be
    /// pruned.
    pub retention_grace: Duration,
    /// Devices unseen for longer than this stop blocking retention.
    pub device_stale_after: Duration,
    /// Payload size above which an operation counts as large for pulls that
    /// ignore large operations.
    pub large_operation_threshold: usize,
    /// Default for confirming pushed ids on the pushing device.
    pub auto_confirm: bool,
    /// Run a retention sweep for the user after every confirm.
    pub sweep_on_confirm: bool,
    /// Upper bound on search results.
    pub max_search_results: usize,
}

impl OplogConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            retention_grace: Duration::from_secs(7 * 24 * 60 * 60),
            device_stale_after: Duration::from_secs(90 * 24 * 60 * 60),
            large_operation_threshold: 256 * 1024,
            auto_confirm: true,
            sweep_on_confirm: true,
            max_search_results: 500,
        }
    }

    /// Sets the retention grace period.
    pub fn with_retention_grace(mut self, grace: Duration) -> Self {
        self.retention_grace = grace;
        self
    }

    /// Sets the stale-device cutoff.
    pub fn with_device_stale_after(mut self, after: Duration) -> Self {
        self.device_stale_after = after;
        self
    }

    /// Sets the large-operation threshold in bytes.
    pub fn with_large_operation_threshold(mut self, bytes: usize) -> Self {
        self.large_operation_threshold = bytes;
        self
    }

    /// Sets the auto-confirm default.
    pub fn with_auto_confirm(mut self, enabled: bool) -> Self {
        self.auto_confirm = enabled;
        self
    }

    /// Enables or disables sweeping after confirms.
    pub fn with_sweep_on_confirm(mut self, enabled: bool) -> Self {
        self.sweep_on_confirm = enabled;
        self
    }

    /// Sets the search result cap.
    pub fn with_max_search_results(mut self, max: usize) -> Self {
        self.max_search_results = max;
        self
    }
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OplogConfig::default();
        assert!(config.auto_confirm);
        assert!(config.sweep_on_confirm);
        assert_eq!(config.retention_grace, Duration::from_secs(604_800));
        assert!(config.device_stale_after > config.retention_grace);
    }

    #[test]
    fn builder() {
        let config = OplogConfig::new()
            .with_retention_grace(Duration::ZERO)
            .with_large_operation_threshold(16)
            .with_auto_confirm(false)
            .with_max_search_results(3);

        assert_eq!(config.retention_grace, Duration::ZERO);
        assert_eq!(config.large_operation_threshold, 16);
        assert!(!config.auto_confirm);
        assert_eq!(config.max_search_results, 3);
    }
}
