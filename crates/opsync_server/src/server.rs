//! Main sync server.

use crate::auth::{AuthConfig, AuthenticatedDevice, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use opsync_core::{BackendJournal, CallContext, OperationLog, RealtimeNotifier, UpdateSignal};
use opsync_protocol::{DeviceId, SyncMessage, UserId};
use opsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The sync server.
///
/// Owns the operation log, the realtime notifier and the retention task, and
/// exposes the sync operations to an HTTP layer. Requests can be handled
/// synchronously with [`SyncServer::handle_message`] or from async code with
/// [`SyncServer::call`], which enforces the configured request timeout.
///
/// # Example
///
/// ```
/// use opsync_protocol::{Operation, PullRequest, PushRequest, SyncMessage};
/// use opsync_server::{AuthenticatedDevice, ServerConfig, SyncServer};
///
/// let server = SyncServer::open(ServerConfig::default()).unwrap();
/// let phone = AuthenticatedDevice::trusted("alice", "phone");
/// let tablet = AuthenticatedDevice::trusted("alice", "tablet");
///
/// let op = Operation::new("op1", "alice", 1, "note", b"hello".to_vec());
/// server.handle_message(&phone, SyncMessage::PushRequest(PushRequest::from_operations([op])));
///
/// match server.handle_message(&tablet, SyncMessage::PullRequest(PullRequest::new())) {
///     SyncMessage::PullResponse(pulled) => assert_eq!(pulled.operations.len(), 1),
///     other => panic!("unexpected response: {other:?}"),
/// }
/// server.shutdown().unwrap();
/// ```
pub struct SyncServer {
    handler: Arc<RequestHandler>,
    context: Arc<HandlerContext>,
    validator: Option<TokenValidator>,
    retention: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SyncServer {
    /// Opens a server, replaying the journal under `data_dir` if configured
    /// and keeping everything in memory otherwise.
    ///
    /// # Errors
    ///
    /// Fails if the data directory cannot be created, the journal is locked
    /// by another process, or the journal is corrupted.
    pub fn open(config: ServerConfig) -> ServerResult<Self> {
        let backend: Box<dyn StorageBackend> = match config.journal_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                info!(path = %path.display(), "opening journal");
                Box::new(FileBackend::open(&path).map_err(opsync_core::OplogError::from)?)
            }
            None => {
                info!("using in-memory journal");
                Box::new(InMemoryBackend::new())
            }
        };
        let journal = BackendJournal::new(backend).with_sync_on_commit(config.sync_on_commit);

        let notifier = Arc::new(RealtimeNotifier::new(config.notifier_buffer)?);
        let oplog = OperationLog::open(config.oplog.clone(), Arc::new(journal), notifier.clone())?;
        Self::with_oplog(config, Arc::new(oplog), notifier)
    }

    /// Creates a sync server with an existing operation log.
    ///
    /// `notifier` must be the notifier `oplog` announces pushes through.
    ///
    /// # Errors
    ///
    /// Fails if authentication is required but no secret is configured.
    pub fn with_oplog(
        config: ServerConfig,
        oplog: Arc<OperationLog>,
        notifier: Arc<RealtimeNotifier>,
    ) -> ServerResult<Self> {
        let validator = match (&config.auth_secret, config.require_auth) {
            (Some(secret), _) => Some(TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )),
            (None, true) => {
                return Err(ServerError::InvalidRequest(
                    "authentication required but no secret configured".into(),
                ))
            }
            (None, false) => None,
        };

        let context = Arc::new(HandlerContext::new(config, oplog, notifier));
        let handler = Arc::new(RequestHandler::new(Arc::clone(&context)));

        Ok(Self {
            handler,
            context,
            validator,
            retention: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the operation log.
    pub fn oplog(&self) -> &Arc<OperationLog> {
        &self.context.oplog
    }

    /// Returns the realtime notifier.
    pub fn notifier(&self) -> &Arc<RealtimeNotifier> {
        &self.context.notifier
    }

    /// Issues a token for `device` of `user`.
    pub fn issue_token(&self, user: &UserId, device: &DeviceId) -> ServerResult<Vec<u8>> {
        self.validator()?.create_token(user, device)
    }

    /// Resolves a request token to the identity it was issued for.
    pub fn authenticate(&self, token: &[u8]) -> ServerResult<AuthenticatedDevice> {
        self.validator()?.validate_token(token)
    }

    fn validator(&self) -> ServerResult<&TokenValidator> {
        self.validator
            .as_ref()
            .ok_or_else(|| {
                ServerError::AuthenticationFailed("authentication is not configured".into())
            })
    }

    /// Handles a sync message for `caller` on the current thread.
    pub fn handle_message(
        &self,
        caller: &AuthenticatedDevice,
        message: SyncMessage,
    ) -> SyncMessage {
        if self.is_closed() {
            return SyncMessage::Error(ServerError::ShuttingDown.to_response());
        }
        let ctx = CallContext::with_timeout(self.context.config.request_timeout);
        self.handler.handle_message(&ctx, caller, message)
    }

    /// Handles a CBOR-encoded request carrying `token` and returns the
    /// CBOR-encoded response.
    ///
    /// Authentication and decoding failures are encoded as
    /// [`SyncMessage::Error`].
    ///
    /// # Errors
    ///
    /// Fails only if the response cannot be encoded.
    pub fn handle_bytes(&self, token: &[u8], request: &[u8]) -> ServerResult<Vec<u8>> {
        let response = match self
            .authenticate(token)
            .and_then(|caller| Ok((caller, SyncMessage::decode(request)?)))
        {
            Ok((caller, message)) => self.handle_message(&caller, message),
            Err(err) => {
                debug!(error = %err, "rejected encoded request");
                SyncMessage::Error(err.to_response())
            }
        };
        Ok(response.encode()?)
    }

    /// Handles a sync message on the blocking thread pool.
    ///
    /// If the request timeout elapses first, the call is cancelled and a
    /// timeout error is returned. A cancelled mutating call either committed
    /// before observing the cancellation or applied nothing.
    pub async fn call(&self, caller: AuthenticatedDevice, message: SyncMessage) -> SyncMessage {
        if self.is_closed() {
            return SyncMessage::Error(ServerError::ShuttingDown.to_response());
        }
        let timeout = self.context.config.request_timeout;
        let ctx = CallContext::with_timeout(timeout);
        let handler = Arc::clone(&self.handler);
        let task_ctx = ctx.clone();
        let task = tokio::task::spawn_blocking(move || {
            handler.handle_message(&task_ctx, &caller, message)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(join_error)) => {
                warn!(error = %join_error, "request task failed");
                SyncMessage::Error(ServerError::Internal(join_error.to_string()).to_response())
            }
            Err(_) => {
                ctx.cancel();
                SyncMessage::Error(ServerError::Timeout.to_response())
            }
        }
    }

    /// Waits until `caller` has something to pull or `timeout` passes.
    ///
    /// Returns true right away if the device already has pending
    /// operations. Otherwise waits for an update signal; a signal is a cue to
    /// pull, not a guarantee that the pull returns anything.
    pub async fn wait_for_update(
        &self,
        caller: &AuthenticatedDevice,
        timeout: Duration,
    ) -> ServerResult<bool> {
        if self.is_closed() {
            return Err(ServerError::ShuttingDown);
        }

        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let id = self.context.notifier.add_listener(
            caller.user.clone(),
            caller.device.clone(),
            Arc::new(move |_: &UpdateSignal| waker.notify_one()),
        );
        let _registration = ListenerGuard {
            notifier: &self.context.notifier,
            id,
        };

        if self.has_pending(caller) {
            return Ok(true);
        }
        Ok(tokio::time::timeout(timeout, notify.notified()).await.is_ok())
    }

    fn has_pending(&self, caller: &AuthenticatedDevice) -> bool {
        let Some(summary) = self.context.oplog.user_summary(&caller.user) else {
            return false;
        };
        summary
            .devices
            .iter()
            .find(|d| d.device == caller.device)
            .map_or(summary.live_operations > 0, |d| d.pending > 0)
    }

    /// Starts the periodic retention sweep on the current tokio runtime.
    ///
    /// Does nothing if the sweep interval is disabled or the task is already
    /// running.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn start_retention_task(&self) -> ServerResult<()> {
        let Some(period) = self.context.config.sweep_interval else {
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("no tokio runtime: {e}")))?;

        let mut slot = self.retention.lock();
        if slot.is_some() {
            return Ok(());
        }
        let oplog = Arc::clone(&self.context.oplog);
        *slot = Some(runtime.spawn(retention_loop(oplog, period)));
        info!(?period, "retention task started");
        Ok(())
    }

    /// Returns true once [`SyncServer::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the retention task, closes the notifier and flushes the journal.
    ///
    /// Requests arriving afterwards are refused. Calling it again only
    /// flushes.
    pub fn shutdown(&self) -> ServerResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(task) = self.retention.lock().take() {
                task.abort();
            }
            self.context.notifier.close();
            info!("sync server shut down");
        }
        self.context.oplog.sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.context.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

struct ListenerGuard<'a> {
    notifier: &'a RealtimeNotifier,
    id: opsync_core::ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.notifier.remove_listener(self.id);
    }
}

async fn retention_loop(oplog: Arc<OperationLog>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let oplog = Arc::clone(&oplog);
        let result =
            tokio::task::spawn_blocking(move || oplog.sweep(&CallContext::background())).await;
        match result {
            Ok(Ok(report)) if report.pruned > 0 || report.gapped_devices > 0 => {
                info!(
                    users = report.users,
                    pruned = report.pruned,
                    gapped_devices = report.gapped_devices,
                    "retention sweep"
                );
            }
            Ok(Ok(_)) => debug!("retention sweep found nothing to prune"),
            Ok(Err(err)) => warn!(error = %err, "retention sweep failed"),
            Err(err) => warn!(error = %err, "retention sweep task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{ConfirmRequest, Operation, PullRequest, PushRequest};

    fn note(id: &str) -> Operation {
        Operation::new(id, "alice", 1, "note", id.as_bytes().to_vec())
    }

    fn push(id: &str) -> SyncMessage {
        SyncMessage::PushRequest(PushRequest::from_operations([note(id)]))
    }

    #[test]
    fn in_memory_server_round_trip() {
        let server = SyncServer::open(ServerConfig::default()).unwrap();
        let phone = AuthenticatedDevice::trusted("alice", "phone");
        let tablet = AuthenticatedDevice::trusted("alice", "tablet");

        assert!(matches!(
            server.handle_message(&phone, push("op1")),
            SyncMessage::PushResponse(_)
        ));
        let SyncMessage::PullResponse(pulled) =
            server.handle_message(&tablet, SyncMessage::PullRequest(PullRequest::new()))
        else {
            panic!("expected pull response");
        };
        assert_eq!(pulled.operations.len(), 1);

        let confirm = ConfirmRequest::new(vec![pulled.operations[0].id.clone()]);
        assert!(matches!(
            server.handle_message(&tablet, SyncMessage::ConfirmRequest(confirm)),
            SyncMessage::ConfirmResponse(_)
        ));
    }

    #[test]
    fn auth_requires_a_secret() {
        let mut config = ServerConfig::default();
        config.require_auth = true;
        assert!(SyncServer::open(config).is_err());
    }

    #[test]
    fn authenticate_without_auth_is_refused() {
        let server = SyncServer::open(ServerConfig::default()).unwrap();
        assert!(matches!(
            server.authenticate(b"anything"),
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn encoded_requests_are_authenticated() {
        let server =
            SyncServer::open(ServerConfig::default().with_auth(b"server secret".to_vec())).unwrap();
        let token = server
            .issue_token(&UserId::from("alice"), &DeviceId::from("phone"))
            .unwrap();

        let response = server.handle_bytes(&token, &push("op1").encode().unwrap()).unwrap();
        assert!(matches!(
            SyncMessage::decode(&response).unwrap(),
            SyncMessage::PushResponse(_)
        ));

        let response = server.handle_bytes(b"forged", &push("op2").encode().unwrap()).unwrap();
        assert!(matches!(
            SyncMessage::decode(&response).unwrap(),
            SyncMessage::Error(_)
        ));

        let response = server.handle_bytes(&token, b"not cbor").unwrap();
        assert!(matches!(
            SyncMessage::decode(&response).unwrap(),
            SyncMessage::Error(_)
        ));
    }

    #[test]
    fn requests_after_shutdown_are_refused() {
        let server = SyncServer::open(ServerConfig::default()).unwrap();
        server.shutdown().unwrap();
        server.shutdown().unwrap();

        let caller = AuthenticatedDevice::trusted("alice", "phone");
        let response = server.handle_message(&caller, push("op1"));
        match response {
            SyncMessage::Error(error) => assert!(error.retryable),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
