//! Request handlers for sync endpoints.
//!
//! Every handler acts on behalf of an [`AuthenticatedDevice`]; the user and
//! device never come from the request body.

use crate::auth::AuthenticatedDevice;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use opsync_core::{CallContext, OperationLog, PullOptions, PushOptions, RealtimeNotifier};
use opsync_protocol::{
    ConfirmRequest, ConfirmResponse, GetRequest, OperationsResponse, PullRequest, PullResponse,
    PushRequest, PushResponse, SearchRequest, SyncMessage,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// State shared by all request handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The operation log (shared across all handlers).
    pub oplog: Arc<OperationLog>,
    /// Notifier the operation log announces pushes through.
    pub notifier: Arc<RealtimeNotifier>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        oplog: Arc<OperationLog>,
        notifier: Arc<RealtimeNotifier>,
    ) -> Self {
        Self {
            config,
            oplog,
            notifier,
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Returns the shared context.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Handles a push request.
    pub fn handle_push(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        request: PushRequest,
    ) -> ServerResult<PushResponse> {
        let max = self.context.config.max_push_batch;
        if request.operations.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "Too many operations: {} > {max}",
                request.operations.len()
            )));
        }

        let mut options = PushOptions::new();
        if let Some(auto_confirm) = request.auto_confirm {
            options = options.with_auto_confirm(auto_confirm);
        }

        let outcome = self.context.oplog.push(
            ctx,
            &caller.user,
            &caller.device,
            request.operations,
            options,
        )?;
        if !outcome.fanout_failures.is_empty() {
            warn!(
                user = %caller.user,
                failed = outcome.fanout_failures.len(),
                "counterparty copies were not written"
            );
        }
        Ok(outcome.into())
    }

    /// Handles a pull request.
    ///
    /// At most `max_pull_operations` operations are returned; the rest stay
    /// pending and `has_more` is set.
    pub fn handle_pull(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        request: PullRequest,
    ) -> ServerResult<PullResponse> {
        let mut options = PullOptions::new();
        if request.ignore_large_operations {
            options = options.ignoring_large_operations();
        }

        let outcome = self
            .context
            .oplog
            .pull(ctx, &caller.user, &caller.device, options)?;
        let limit = self.context.config.max_pull_operations;
        let has_more = outcome.operations.len() > limit;

        let mut response = PullResponse::from(outcome);
        if has_more {
            response.operations.truncate(limit);
            response.has_more = true;
        }
        Ok(response)
    }

    /// Handles a confirm request.
    pub fn handle_confirm(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        request: ConfirmRequest,
    ) -> ServerResult<ConfirmResponse> {
        let outcome =
            self.context
                .oplog
                .confirm(ctx, &caller.user, &caller.device, &request.operation_ids)?;
        Ok(outcome.into())
    }

    /// Handles an entity-scoped fetch within the caller's log.
    pub fn handle_get(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        request: GetRequest,
    ) -> ServerResult<OperationsResponse> {
        let operations = self
            .context
            .oplog
            .get(ctx, &caller.user, &request.entities)?;
        Ok(OperationsResponse { operations })
    }

    /// Handles a payload search within the caller's log.
    pub fn handle_search(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        request: SearchRequest,
    ) -> ServerResult<OperationsResponse> {
        let operations = self.context.oplog.search(
            ctx,
            &caller.user,
            &request.payload_type,
            &request.hint,
        )?;
        Ok(OperationsResponse { operations })
    }

    /// Handles a cursor reset of the calling device.
    pub fn handle_reset_cursor(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
    ) -> ServerResult<()> {
        self.context
            .oplog
            .reset_cursor(ctx, &caller.user, &caller.device)?;
        Ok(())
    }

    /// Dispatches a request message and returns the response message.
    ///
    /// Failures are returned as [`SyncMessage::Error`].
    pub fn handle_message(
        &self,
        ctx: &CallContext,
        caller: &AuthenticatedDevice,
        message: SyncMessage,
    ) -> SyncMessage {
        let type_code = message.type_code();
        let result = match message {
            SyncMessage::PushRequest(req) => self
                .handle_push(ctx, caller, req)
                .map(SyncMessage::PushResponse),
            SyncMessage::PullRequest(req) => self
                .handle_pull(ctx, caller, req)
                .map(SyncMessage::PullResponse),
            SyncMessage::ConfirmRequest(req) => self
                .handle_confirm(ctx, caller, req)
                .map(SyncMessage::ConfirmResponse),
            SyncMessage::GetRequest(req) => self
                .handle_get(ctx, caller, req)
                .map(SyncMessage::OperationsResponse),
            SyncMessage::SearchRequest(req) => self
                .handle_search(ctx, caller, req)
                .map(SyncMessage::OperationsResponse),
            SyncMessage::ResetCursorRequest => self
                .handle_reset_cursor(ctx, caller)
                .map(|()| SyncMessage::Ack),
            _ => Err(ServerError::InvalidRequest(format!(
                "Unexpected message type {type_code}"
            ))),
        };

        result.unwrap_or_else(|err| {
            if err.is_server_error() {
                warn!(
                    user = %caller.user,
                    device = %caller.device,
                    type_code,
                    error = %err,
                    "request failed"
                );
            } else {
                debug!(
                    user = %caller.user,
                    device = %caller.device,
                    type_code,
                    error = %err,
                    "request rejected"
                );
            }
            SyncMessage::Error(err.to_response())
        })
    }
}
