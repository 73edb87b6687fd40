//! Server configuration.

use opsync_core::journal::JOURNAL_FILE_NAME;
use opsync_core::OplogConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP layer binds to.
    pub bind_addr: SocketAddr,
    /// Deadline applied to each request.
    pub request_timeout: Duration,
    /// Maximum operations accepted in one push.
    pub max_push_batch: usize,
    /// Maximum operations returned by one pull.
    pub max_pull_operations: usize,
    /// Whether requests must carry a valid token.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
    /// Directory holding the journal file. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Fsync the journal after every commit group.
    pub sync_on_commit: bool,
    /// Period of the background retention sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
    /// Capacity of the notifier's callback queue.
    pub notifier_buffer: usize,
    /// Operation log settings.
    pub oplog: OplogConfig,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            request_timeout: Duration::from_secs(30),
            max_push_batch: 500,
            max_pull_operations: 1000,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
            data_dir: None,
            sync_on_commit: true,
            sweep_interval: Some(Duration::from_secs(60 * 60)),
            notifier_buffer: 1024,
            oplog: OplogConfig::default(),
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size;
        self
    }

    /// Sets the maximum number of operations per pull.
    pub fn with_max_pull_operations(mut self, size: usize) -> Self {
        self.max_pull_operations = size;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Stores the journal under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets whether every commit group is fsynced.
    pub fn with_sync_on_commit(mut self, enabled: bool) -> Self {
        self.sync_on_commit = enabled;
        self
    }

    /// Sets the retention sweep period. `None` disables the task.
    pub fn with_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the notifier queue capacity.
    pub fn with_notifier_buffer(mut self, capacity: usize) -> Self {
        self.notifier_buffer = capacity;
        self
    }

    /// Sets the operation log settings.
    pub fn with_oplog(mut self, oplog: OplogConfig) -> Self {
        self.oplog = oplog;
        self
    }

    /// Returns the journal path, if the server is file-backed.
    pub fn journal_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_deref()
            .map(|dir: &Path| dir.join(JOURNAL_FILE_NAME))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_push_batch, 500);
        assert!(!config.require_auth);
        assert!(config.journal_path().is_none());
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_pull_operations(50)
            .with_auth(vec![1, 2, 3, 4])
            .with_data_dir("/var/lib/opsync")
            .with_sweep_interval(None);

        assert_eq!(config.max_pull_operations, 50);
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
        assert_eq!(
            config.journal_path(),
            Some(PathBuf::from("/var/lib/opsync/oplog.journal"))
        );
        assert!(config.sweep_interval.is_none());
    }
}
