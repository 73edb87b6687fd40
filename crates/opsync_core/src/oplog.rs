//! The operation log engine.
//!
//! [`OperationLog`] composes the journal, the per-user logs and their indexes,
//! the device cursors, retention and the notifier.
//!
//! # Locking
//!
//! - each user has a state lock (log plus indexes) and a cursor map lock;
//!   each cursor has its own mutex
//! - locks are taken in the order state, cursor map, cursor
//! - push and sweep hold the state lock for writing across the journal commit
//!   and the in-memory apply, so readers see a batch entirely or not at all
//! - pull, confirm, reset, get and search hold it for reading
//! - compaction excludes every mutating call while it rewrites the journal
//! - notifications are sent after all user locks are released
//!
//! Every mutating call validates its input and checks its [`CallContext`]
//! before the journal commit. Nothing is applied in memory unless the commit
//! succeeded.

use crate::clock::{Clock, SystemClock};
use crate::config::OplogConfig;
use crate::context::CallContext;
use crate::cursor::DeviceCursor;
use crate::error::{OplogError, OplogResult};
use crate::index::{EntityIndex, HashEntityIndex};
use crate::journal::{BackendJournal, Journal, JournalRecord};
use crate::notifier::{Notifier, NullNotifier};
use crate::retention::{self, RetentionPolicy, SweepReport};
use crate::search::{SearchIndex, SubstringSearchIndex};
use crate::stats::{DeviceSummary, OplogStats, UserSummary};
use crate::store::{sort_by_order_key, StoredOperation, UserLog};
use opsync_protocol::{
    ConfirmResponse, DeviceId, Operation, OperationId, PullResponse, PushResponse,
    PushedOperation, TrackedEntity, UserId,
};
use opsync_storage::InMemoryBackend;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Per-call push policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Confirm the pushed ids for the pushing device. `None` uses
    /// [`OplogConfig::auto_confirm`].
    pub auto_confirm: Option<bool>,
}

impl PushOptions {
    /// Options using the configured defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the auto-confirm default.
    #[must_use]
    pub fn with_auto_confirm(mut self, enabled: bool) -> Self {
        self.auto_confirm = Some(enabled);
        self
    }
}

/// Per-call pull policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Withhold operations whose payload exceeds
    /// [`OplogConfig::large_operation_threshold`].
    pub ignore_large_operations: bool,
}

impl PullOptions {
    /// Options delivering everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Withholds large operations.
    #[must_use]
    pub fn ignoring_large_operations(mut self) -> Self {
        self.ignore_large_operations = true;
        self
    }
}

/// Result of [`OperationLog::push`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Ids appended to the caller's log, in batch order.
    pub appended: Vec<OperationId>,
    /// Ids that were already present or repeated within the batch.
    pub duplicates: Vec<OperationId>,
    /// Highest sequence of the caller's log after the push.
    pub head_sequence: u64,
    /// Copies appended to counterparties' logs.
    pub shared: usize,
    /// Counterparties whose copy could not be appended. Pushing the same
    /// batch again retries them.
    pub fanout_failures: Vec<UserId>,
}

impl From<PushOutcome> for PushResponse {
    fn from(outcome: PushOutcome) -> Self {
        PushResponse {
            appended: outcome.appended,
            duplicates: outcome.duplicates,
            head_sequence: outcome.head_sequence,
        }
    }
}

/// Result of [`OperationLog::pull`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullOutcome {
    /// Unconfirmed operations in log order.
    pub operations: Vec<Operation>,
    /// Unconfirmed operations withheld because of their size, in log order.
    pub skipped_large: Vec<OperationId>,
    /// The device may have missed pruned operations.
    pub history_gap: bool,
    /// Highest sequence of the log.
    pub head_sequence: u64,
}

impl From<PullOutcome> for PullResponse {
    fn from(outcome: PullOutcome) -> Self {
        PullResponse {
            operations: outcome.operations,
            skipped_large: outcome.skipped_large,
            history_gap: outcome.history_gap,
            head_sequence: outcome.head_sequence,
            has_more: false,
        }
    }
}

/// Result of [`OperationLog::confirm`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmOutcome {
    /// Ids that were not confirmed before.
    pub newly_confirmed: usize,
    /// Contiguous confirmation watermark of the device.
    pub confirmed_through: u64,
    /// Operations pruned by the sweep that followed.
    pub pruned: usize,
}

impl From<ConfirmOutcome> for ConfirmResponse {
    fn from(outcome: ConfirmOutcome) -> Self {
        ConfirmResponse {
            newly_confirmed: outcome.newly_confirmed,
            confirmed_through: outcome.confirmed_through,
            pruned: outcome.pruned,
        }
    }
}

/// Result of [`OperationLog::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Users written.
    pub users: usize,
    /// Live operations written.
    pub operations: usize,
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction.
    pub bytes_after: u64,
}

type CursorHandle = Arc<Mutex<DeviceCursor>>;

struct UserState<E, S> {
    log: UserLog,
    entities: E,
    search: S,
}

impl<E, S> UserState<E, S>
where
    E: EntityIndex + Default,
    S: SearchIndex + Default,
{
    fn new() -> Self {
        Self {
            log: UserLog::new(),
            entities: E::default(),
            search: S::default(),
        }
    }

    fn append(&mut self, sequence: u64, appended_at_ms: u64, operation: Arc<Operation>) {
        self.entities.insert(sequence, &operation);
        self.search.insert(sequence, &operation);
        self.log.insert(StoredOperation {
            sequence,
            appended_at_ms,
            operation,
        });
    }

    fn prune(&mut self, sequence: u64) {
        if let Some(stored) = self.log.prune(sequence) {
            self.entities.remove(sequence, &stored.operation);
            self.search.remove(sequence, &stored.operation);
        }
    }
}

struct UserEntry<E, S> {
    state: RwLock<UserState<E, S>>,
    cursors: RwLock<HashMap<DeviceId, CursorHandle>>,
}

enum CursorSlot {
    Existing(CursorHandle),
    New(DeviceCursor),
}

/// The operation-log synchronization engine.
///
/// `E` and `S` select the tracked-entity and search index implementations.
///
/// # Example
///
/// ```rust
/// use opsync_core::{CallContext, OperationLog, OplogConfig, PullOptions, PushOptions};
/// use opsync_protocol::{DeviceId, Operation, UserId};
///
/// let log = OperationLog::open_in_memory(OplogConfig::default()).unwrap();
/// let ctx = CallContext::background();
/// let alice = UserId::from("alice");
///
/// let op = Operation::new("op1", "alice", 100, "deal", b"{}".to_vec()).tracking("deal", "D1");
/// log.push(&ctx, &alice, &DeviceId::from("phone"), vec![op.into()], PushOptions::new())
///     .unwrap();
///
/// let pulled = log.pull(&ctx, &alice, &DeviceId::from("tablet"), PullOptions::new()).unwrap();
/// assert_eq!(pulled.operations.len(), 1);
/// ```
pub struct OperationLog<E = HashEntityIndex, S = SubstringSearchIndex> {
    config: OplogConfig,
    journal: Arc<dyn Journal>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    users: RwLock<HashMap<UserId, Arc<UserEntry<E, S>>>>,
    /// Held for reading by mutating calls and for writing by compaction.
    compaction: RwLock<()>,
    stats: OplogStats,
}

impl OperationLog {
    /// Opens a log over `journal` with the default indexes, replaying every
    /// committed group.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupted or cannot be read.
    pub fn open(
        config: OplogConfig,
        journal: Arc<dyn Journal>,
        notifier: Arc<dyn Notifier>,
    ) -> OplogResult<Self> {
        Self::open_with_indexes(config, journal, notifier)
    }

    /// Opens an empty log journaled in memory, without notifications.
    pub fn open_in_memory(config: OplogConfig) -> OplogResult<Self> {
        let journal = BackendJournal::new(Box::new(InMemoryBackend::new()));
        Self::open(config, Arc::new(journal), Arc::new(NullNotifier))
    }
}

impl<E, S> OperationLog<E, S>
where
    E: EntityIndex + Default,
    S: SearchIndex + Default,
{
    /// Opens a log with custom index implementations.
    ///
    /// # Errors
    ///
    /// Fails if the journal is corrupted or cannot be read.
    pub fn open_with_indexes(
        config: OplogConfig,
        journal: Arc<dyn Journal>,
        notifier: Arc<dyn Notifier>,
    ) -> OplogResult<Self> {
        let replay = journal.replay()?;
        let mut replayed: HashMap<UserId, Replayed<E, S>> = HashMap::new();
        for record in replay.records {
            replay_record(&mut replayed, record)?;
        }

        let operations: usize = replayed.values().map(|(state, _)| state.log.len()).sum();
        let users: HashMap<UserId, Arc<UserEntry<E, S>>> = replayed
            .into_iter()
            .map(|(user, (state, cursors))| {
                let cursors = cursors
                    .into_iter()
                    .map(|(device, cursor)| (device, Arc::new(Mutex::new(cursor))))
                    .collect();
                let entry = UserEntry {
                    state: RwLock::new(state),
                    cursors: RwLock::new(cursors),
                };
                (user, Arc::new(entry))
            })
            .collect();

        tracing::info!(
            users = users.len(),
            operations,
            groups = replay.groups,
            discarded_bytes = replay.discarded_bytes,
            "operation log opened"
        );

        Ok(Self {
            config,
            journal,
            notifier,
            clock: Arc::new(SystemClock),
            users: RwLock::new(users),
            compaction: RwLock::new(()),
            stats: OplogStats::new(),
        })
    }

    /// Replaces the wall clock used for retention and device liveness.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OplogConfig {
        &self.config
    }

    /// Returns the call counters.
    pub fn stats(&self) -> &OplogStats {
        &self.stats
    }

    /// Appends `operations` to `user`'s log on behalf of `device`.
    ///
    /// Ids already present (or pruned) are duplicates and skipped. New
    /// operations are written as one commit group together with the device
    /// registration and auto-confirmation, then indexed, then announced to
    /// the user's other devices. Operations with `share_with` are copied into
    /// each counterparty's log afterwards, one commit per counterparty.
    ///
    /// # Errors
    ///
    /// - [`OplogError::InvalidArgument`] for malformed ids, operations
    ///   authored by another user, empty payload types or malformed entities
    /// - [`OplogError::StorageUnavailable`] if the commit failed; nothing
    ///   was appended
    /// - [`OplogError::Cancelled`] / [`OplogError::Timeout`] from `ctx`
    pub fn push(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        operations: Vec<PushedOperation>,
        options: PushOptions,
    ) -> OplogResult<PushOutcome> {
        let result = self.push_inner(ctx, user, device, operations, options);
        self.observe(result)
    }

    /// Returns every live operation `device` has not confirmed, in log order.
    ///
    /// Pulling does not confirm anything; pulling twice returns the same
    /// operations.
    pub fn pull(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        options: PullOptions,
    ) -> OplogResult<PullOutcome> {
        let result = self.pull_inner(ctx, user, device, options);
        self.observe(result)
    }

    /// Marks `ids` confirmed for `device`.
    ///
    /// Unknown and already confirmed ids are ignored. Confirms may arrive in
    /// any order and before the ids were pulled.
    pub fn confirm(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        ids: &[OperationId],
    ) -> OplogResult<ConfirmOutcome> {
        let result = self.confirm_inner(ctx, user, device, ids);
        self.observe(result)
    }

    /// Clears `device`'s confirmations and history gap so the next pull
    /// returns the whole live log.
    pub fn reset_cursor(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
    ) -> OplogResult<()> {
        let result = self.reset_inner(ctx, user, device);
        self.observe(result)
    }

    /// Returns every live operation of `user` affecting any of `entities`,
    /// in log order, regardless of delivery state.
    pub fn get(
        &self,
        ctx: &CallContext,
        user: &UserId,
        entities: &[TrackedEntity],
    ) -> OplogResult<Vec<Operation>> {
        let result = self.get_inner(ctx, user, entities);
        self.observe(result)
    }

    /// Returns live operations of `user` with `payload_type` whose payload
    /// contains `hint` case-insensitively, in log order.
    pub fn search(
        &self,
        ctx: &CallContext,
        user: &UserId,
        payload_type: &str,
        hint: &str,
    ) -> OplogResult<Vec<Operation>> {
        let result = self.search_inner(ctx, user, payload_type, hint);
        self.observe(result)
    }

    /// Runs a retention sweep over every user.
    pub fn sweep(&self, ctx: &CallContext) -> OplogResult<SweepReport> {
        let _compaction = self.compaction.read();
        let mut entries: Vec<(UserId, Arc<UserEntry<E, S>>)> = self
            .users
            .read()
            .iter()
            .map(|(user, entry)| (user.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = SweepReport::default();
        for (user, entry) in entries {
            ctx.check()?;
            report.merge(self.sweep_entry(&user, &entry)?);
        }

        if report.pruned > 0 {
            tracing::info!(
                users = report.users,
                pruned = report.pruned,
                gapped_devices = report.gapped_devices,
                "retention sweep finished"
            );
        } else {
            tracing::debug!(users = report.users, "retention sweep found nothing to prune");
        }
        Ok(report)
    }

    /// Runs a retention sweep over one user's log.
    pub fn sweep_user(&self, ctx: &CallContext, user: &UserId) -> OplogResult<SweepReport> {
        ctx.check()?;
        let _compaction = self.compaction.read();
        match self.entry(user) {
            Some(entry) => self.sweep_entry(user, &entry),
            None => Ok(SweepReport::default()),
        }
    }

    /// Rewrites the journal as a snapshot of the current state.
    ///
    /// Mutating calls wait while compaction runs.
    pub fn compact(&self, ctx: &CallContext) -> OplogResult<CompactionReport> {
        ctx.check()?;
        let _exclusive = self.compaction.write();
        let bytes_before = self.journal.size()?;

        let mut entries: Vec<(UserId, Arc<UserEntry<E, S>>)> = self
            .users
            .read()
            .iter()
            .map(|(user, entry)| (user.clone(), Arc::clone(entry)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut records = Vec::new();
        let mut operations = 0;
        for (user, entry) in &entries {
            let state = entry.state.read();
            let mut pruned_ids: Vec<OperationId> = state.log.pruned_ids().cloned().collect();
            pruned_ids.sort();
            records.push(JournalRecord::LogHead {
                user: user.clone(),
                head: state.log.head(),
                pruned_total: state.log.pruned_total(),
                pruned_ids,
            });
            for stored in state.log.iter() {
                records.push(JournalRecord::Append {
                    user: user.clone(),
                    sequence: stored.sequence,
                    appended_at_ms: stored.appended_at_ms,
                    operation: (*stored.operation).clone(),
                });
                operations += 1;
            }

            let cursors = entry.cursors.read();
            let mut devices: Vec<(&DeviceId, &CursorHandle)> = cursors.iter().collect();
            devices.sort_by(|a, b| a.0.cmp(b.0));
            for (device, handle) in devices {
                records.push(JournalRecord::CursorState {
                    user: user.clone(),
                    device: device.clone(),
                    cursor: handle.lock().clone(),
                });
            }
        }

        self.journal.rewrite(records)?;
        self.stats.record_commit();
        let bytes_after = self.journal.size()?;

        let report = CompactionReport {
            users: entries.len(),
            operations,
            bytes_before,
            bytes_after,
        };
        tracing::info!(
            users = report.users,
            operations = report.operations,
            bytes_before,
            bytes_after,
            "journal compacted"
        );
        Ok(report)
    }

    /// Flushes the journal to durable media.
    pub fn sync(&self) -> OplogResult<()> {
        self.journal.sync()
    }

    /// Returns the journal size in bytes.
    pub fn journal_size(&self) -> OplogResult<u64> {
        self.journal.size()
    }

    /// Users with a log, sorted.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.read().keys().cloned().collect();
        users.sort();
        users
    }

    /// Returns a copy of `device`'s cursor, if the device is registered.
    pub fn cursor(&self, user: &UserId, device: &DeviceId) -> Option<DeviceCursor> {
        let entry = self.entry(user)?;
        let cursors = entry.cursors.read();
        let cursor = cursors.get(device)?.lock().clone();
        Some(cursor)
    }

    /// Summarizes `user`'s log and devices.
    pub fn user_summary(&self, user: &UserId) -> Option<UserSummary> {
        let entry = self.entry(user)?;
        let state = entry.state.read();
        let cursors = entry.cursors.read();

        let mut devices: Vec<DeviceSummary> = cursors
            .iter()
            .map(|(device, handle)| {
                let cursor = handle.lock();
                DeviceSummary {
                    device: device.clone(),
                    confirmed_through: cursor.confirmed_through,
                    pending: state
                        .log
                        .iter()
                        .filter(|stored| !cursor.is_confirmed(stored.sequence))
                        .count(),
                    last_pulled: cursor.last_pulled,
                    last_seen_ms: cursor.last_seen_ms,
                    history_gap: cursor.history_gap,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.device.cmp(&b.device));

        Some(UserSummary {
            user: user.clone(),
            head: state.log.head(),
            live_operations: state.log.len(),
            pruned_total: state.log.pruned_total(),
            devices,
        })
    }

    fn push_inner(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        operations: Vec<PushedOperation>,
        options: PushOptions,
    ) -> OplogResult<PushOutcome> {
        validate_caller(user, device)?;
        let mut batch: Vec<(Arc<Operation>, Vec<UserId>)> = Vec::with_capacity(operations.len());
        for pushed in operations {
            let PushedOperation {
                mut operation,
                share_with,
            } = pushed;
            operation.dedup_tracked_entities();
            validate_operation(&operation, user)?;
            if let Some(bad) = share_with.iter().find(|counterparty| !counterparty.is_valid()) {
                return Err(OplogError::invalid_argument(format!(
                    "operation {}: invalid share_with user id {bad:?}",
                    operation.id
                )));
            }
            batch.push((Arc::new(operation), share_with));
        }

        ctx.check()?;
        let _compaction = self.compaction.read();
        let entry = self.entry_or_create(user);
        let now = self.clock.now_ms();
        let auto_confirm = options.auto_confirm.unwrap_or(self.config.auto_confirm);

        let mut state = entry.state.write();

        let mut appended: Vec<(u64, Arc<Operation>)> = Vec::new();
        let mut duplicates: Vec<OperationId> = Vec::new();
        let mut seen: HashMap<&OperationId, &Operation> = HashMap::new();
        for (operation, _) in &batch {
            if let Some(first) = seen.get(&operation.id) {
                if **first != **operation {
                    tracing::warn!(
                        %user,
                        id = %operation.id,
                        "batch repeats an id with different content; keeping the first"
                    );
                }
                duplicates.push(operation.id.clone());
                continue;
            }
            seen.insert(&operation.id, operation);

            if state.log.is_known(&operation.id) {
                if let Some(stored) = state.log.get_by_id(&operation.id) {
                    if *stored.operation != **operation {
                        tracing::warn!(
                            %user,
                            id = %operation.id,
                            "re-pushed operation differs from the stored copy; keeping it"
                        );
                    }
                }
                duplicates.push(operation.id.clone());
                continue;
            }

            let sequence = state.log.sequence_after(appended.len())?;
            appended.push((sequence, Arc::clone(operation)));
        }

        let mut records = Vec::new();
        let existing = entry.cursors.read().get(device).cloned();
        let slot = match existing {
            Some(handle) => CursorSlot::Existing(handle),
            None => {
                let head = state.log.head();
                let history_gap = state.log.pruned_total() > 0;
                records.push(JournalRecord::Register {
                    user: user.clone(),
                    device: device.clone(),
                    registered_at: head,
                    seen_ms: now,
                    history_gap,
                });
                CursorSlot::New(registration_cursor(&state.log, head, now, history_gap))
            }
        };

        for (sequence, operation) in &appended {
            records.push(JournalRecord::Append {
                user: user.clone(),
                sequence: *sequence,
                appended_at_ms: now,
                operation: (**operation).clone(),
            });
        }

        let mut to_confirm = Vec::new();
        if auto_confirm {
            let mut candidates: Vec<u64> = appended.iter().map(|(seq, _)| *seq).collect();
            candidates.extend(
                duplicates
                    .iter()
                    .filter_map(|id| state.log.get_by_id(id))
                    .map(|stored| stored.sequence),
            );
            to_confirm = match &slot {
                CursorSlot::Existing(handle) => unconfirmed(&handle.lock(), candidates),
                CursorSlot::New(cursor) => unconfirmed(cursor, candidates),
            };
            if !to_confirm.is_empty() {
                records.push(JournalRecord::Confirm {
                    user: user.clone(),
                    device: device.clone(),
                    sequences: to_confirm.clone(),
                    seen_ms: now,
                });
            }
        }

        if !records.is_empty() {
            ctx.check()?;
            self.commit(records)?;
        }

        for (sequence, operation) in &appended {
            state.append(*sequence, now, Arc::clone(operation));
        }
        let handle = match slot {
            CursorSlot::Existing(handle) => handle,
            CursorSlot::New(cursor) => {
                let handle = Arc::new(Mutex::new(cursor));
                entry
                    .cursors
                    .write()
                    .insert(device.clone(), Arc::clone(&handle));
                tracing::info!(%user, %device, "device registered");
                handle
            }
        };
        {
            let mut cursor = handle.lock();
            cursor.confirm_sequences(to_confirm);
            cursor.touch(now);
        }
        let head_sequence = state.log.head();
        drop(state);

        self.stats.record_push(appended.len(), duplicates.len());
        tracing::debug!(
            %user,
            %device,
            appended = appended.len(),
            duplicates = duplicates.len(),
            head_sequence,
            "push applied"
        );

        if !appended.is_empty() {
            self.notifier
                .notify_update(user, std::slice::from_ref(device));
        }

        let mut shares: BTreeMap<UserId, Vec<Arc<Operation>>> = BTreeMap::new();
        for (operation, share_with) in &batch {
            for counterparty in share_with {
                if counterparty != user {
                    shares
                        .entry(counterparty.clone())
                        .or_default()
                        .push(Arc::clone(operation));
                }
            }
        }

        let mut shared = 0;
        let mut fanout_failures = Vec::new();
        for (counterparty, operations) in shares {
            match self.append_shared(&counterparty, operations) {
                Ok(0) => {}
                Ok(count) => {
                    shared += count;
                    self.notifier.notify_update(&counterparty, &[]);
                }
                Err(err) => {
                    tracing::warn!(%user, %counterparty, error = %err, "fan-out append failed");
                    fanout_failures.push(counterparty);
                }
            }
        }

        Ok(PushOutcome {
            appended: appended.into_iter().map(|(_, op)| op.id.clone()).collect(),
            duplicates,
            head_sequence,
            shared,
            fanout_failures,
        })
    }

    /// Appends copies to a counterparty's log. The caller holds the
    /// compaction lock.
    fn append_shared(
        &self,
        counterparty: &UserId,
        operations: Vec<Arc<Operation>>,
    ) -> OplogResult<usize> {
        let entry = self.entry_or_create(counterparty);
        let now = self.clock.now_ms();
        let mut state = entry.state.write();

        let mut seen = HashSet::new();
        let mut appended: Vec<(u64, Arc<Operation>)> = Vec::new();
        for operation in operations {
            if !seen.insert(operation.id.clone()) || state.log.is_known(&operation.id) {
                continue;
            }
            let sequence = state.log.sequence_after(appended.len())?;
            appended.push((sequence, operation));
        }
        if appended.is_empty() {
            return Ok(0);
        }

        let records = appended
            .iter()
            .map(|(sequence, operation)| JournalRecord::Append {
                user: counterparty.clone(),
                sequence: *sequence,
                appended_at_ms: now,
                operation: (**operation).clone(),
            })
            .collect();
        self.commit(records)?;

        let count = appended.len();
        for (sequence, operation) in appended {
            state.append(sequence, now, operation);
        }
        self.stats.record_shared(count);
        tracing::debug!(%counterparty, appended = count, "shared operations appended");
        Ok(count)
    }

    fn pull_inner(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        options: PullOptions,
    ) -> OplogResult<PullOutcome> {
        validate_caller(user, device)?;
        ctx.check()?;
        let _compaction = self.compaction.read();
        let entry = self.entry_or_create(user);
        let now = self.clock.now_ms();

        let state = entry.state.read();
        let handle = self.ensure_cursor(&entry, &state.log, user, device, now)?;
        let mut cursor = handle.lock();

        let mut pending: Vec<&StoredOperation> = state
            .log
            .iter()
            .filter(|stored| !cursor.is_confirmed(stored.sequence))
            .collect();
        sort_by_order_key(&mut pending);

        let threshold = self.config.large_operation_threshold;
        let mut operations = Vec::with_capacity(pending.len());
        let mut skipped_large = Vec::new();
        let mut delivered = 0;
        for stored in pending {
            if options.ignore_large_operations && stored.operation.payload_size() > threshold {
                skipped_large.push(stored.operation.id.clone());
                continue;
            }
            delivered = delivered.max(stored.sequence);
            operations.push((*stored.operation).clone());
        }

        cursor.mark_pulled(delivered);
        cursor.touch(now);
        self.stats.record_pull();
        tracing::debug!(
            %user,
            %device,
            operations = operations.len(),
            skipped_large = skipped_large.len(),
            "pull served"
        );

        Ok(PullOutcome {
            operations,
            skipped_large,
            history_gap: cursor.history_gap,
            head_sequence: state.log.head(),
        })
    }

    fn confirm_inner(
        &self,
        ctx: &CallContext,
        user: &UserId,
        device: &DeviceId,
        ids: &[OperationId],
    ) -> OplogResult<ConfirmOutcome> {
        validate_caller(user, device)?;
        if let Some(bad) = ids.iter().find(|id| !id.is_valid()) {
            return Err(OplogError::invalid_argument(format!(
                "invalid operation id {bad:?}"
            )));
        }
        ctx.check()?;
        let _compaction = self.compaction.read();
        let entry = self.entry_or_create(user);
        let now = self.clock.now_ms();

        let (newly_confirmed, confirmed_through) = {
            let state = entry.state.read();
            let handle = self.ensure_cursor(&entry, &state.log, user, device, now)?;
            let mut cursor = handle.lock();

            let known: Vec<u64> = ids
                .iter()
                .filter_map(|id| state.log.get_by_id(id))
                .map(|stored| stored.sequence)
                .collect();
            let unknown = ids.len() - known.len();
            let newly = unconfirmed(&cursor, known);

            if !newly.is_empty() {
                ctx.check()?;
                self.commit(vec![JournalRecord::Confirm {
                    user: user.clone(),
                    device: device.clone(),
                    sequences: newly.clone(),
                    seen_ms: now,
                }])?;
                cursor.confirm_sequences(newly.iter().copied());
            }
            cursor.touch(now);

            tracing::debug!(
                %user,
                %device,
                newly = newly.len(),
                unknown,
                confirmed_through = cursor.confirmed_through,
                "confirm applied"
            );
            (newly.len(), cursor.confirmed_through)
        };
        self.stats.record_confirm();

        let mut pruned = 0;
        if self.config.sweep_on_confirm && newly_confirmed > 0 {
            match self.sweep_entry(user, &entry) {
                Ok(report) => pruned = report.pruned,
                Err(err) => {
                    tracing::warn!(%user, error = %err, "retention sweep after confirm failed");
                }
            }
        }

        Ok(ConfirmOutcome {
            newly_confirmed,
            confirmed_through,
            pruned,
        })
    }

    fn reset_inner(&self, ctx: &CallContext, user: &UserId, device: &DeviceId) -> OplogResult<()> {
        validate_caller(user, device)?;
        ctx.check()?;
        let _compaction = self.compaction.read();
        let entry = self.entry_or_create(user);
        let now = self.clock.now_ms();

        let state = entry.state.read();
        let handle = self.ensure_cursor(&entry, &state.log, user, device, now)?;
        let mut cursor = handle.lock();

        ctx.check()?;
        self.commit(vec![JournalRecord::ResetCursor {
            user: user.clone(),
            device: device.clone(),
            seen_ms: now,
        }])?;
        reset_cursor_state(&mut cursor, &state.log, now);

        tracing::info!(%user, %device, "cursor reset");
        Ok(())
    }

    fn get_inner(
        &self,
        ctx: &CallContext,
        user: &UserId,
        entities: &[TrackedEntity],
    ) -> OplogResult<Vec<Operation>> {
        if !user.is_valid() {
            return Err(OplogError::invalid_argument("invalid user id"));
        }
        if let Some(bad) = entities.iter().find(|entity| !entity.is_valid()) {
            return Err(OplogError::invalid_argument(format!(
                "malformed tracked entity {bad:?}"
            )));
        }
        ctx.check()?;
        self.stats.record_get();

        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let Some(entry) = self.entry(user) else {
            return Ok(Vec::new());
        };

        let state = entry.state.read();
        let sequences = state.entities.lookup(entities);
        Ok(state
            .log
            .ordered(sequences)
            .into_iter()
            .map(|stored| (*stored.operation).clone())
            .collect())
    }

    fn search_inner(
        &self,
        ctx: &CallContext,
        user: &UserId,
        payload_type: &str,
        hint: &str,
    ) -> OplogResult<Vec<Operation>> {
        if !user.is_valid() {
            return Err(OplogError::invalid_argument("invalid user id"));
        }
        if payload_type.is_empty() {
            return Err(OplogError::invalid_argument("payload type must not be empty"));
        }
        ctx.check()?;
        self.stats.record_search();

        let Some(entry) = self.entry(user) else {
            return Ok(Vec::new());
        };

        let state = entry.state.read();
        let sequences = state.search.search(payload_type, hint);
        Ok(state
            .log
            .ordered(sequences)
            .into_iter()
            .take(self.config.max_search_results)
            .map(|stored| (*stored.operation).clone())
            .collect())
    }

    /// Prunes what retention allows from one user's log. The caller holds
    /// the compaction lock and no lock of this user.
    ///
    /// A first plan runs under the shared state lock against cursor copies.
    /// Exclusive locks are only taken when that plan prunes something, and
    /// the plan is then recomputed under them.
    fn sweep_entry(&self, user: &UserId, entry: &UserEntry<E, S>) -> OplogResult<SweepReport> {
        let now = self.clock.now_ms();
        let policy = RetentionPolicy::from_config(&self.config);
        let idle = SweepReport {
            users: 1,
            ..SweepReport::default()
        };

        {
            let state = entry.state.read();
            if !retention::any_due(policy, now, &state.log) {
                return Ok(idle);
            }
            let snapshot: Vec<(DeviceId, DeviceCursor)> = entry
                .cursors
                .read()
                .iter()
                .map(|(device, handle)| (device.clone(), handle.lock().clone()))
                .collect();
            let plan = retention::plan(
                policy,
                now,
                &state.log,
                snapshot.iter().map(|(device, cursor)| (device, cursor)),
            );
            if plan.is_empty() {
                return Ok(idle);
            }
        }

        let mut state = entry.state.write();
        let cursors = entry.cursors.read();
        let mut guards: Vec<(&DeviceId, MutexGuard<'_, DeviceCursor>)> = cursors
            .iter()
            .map(|(device, handle)| (device, handle.lock()))
            .collect();

        let plan = retention::plan(
            policy,
            now,
            &state.log,
            guards.iter().map(|(device, cursor)| (*device, &**cursor)),
        );
        if plan.is_empty() {
            return Ok(idle);
        }

        self.commit(vec![JournalRecord::Prune {
            user: user.clone(),
            sequences: plan.sequences.clone(),
            gapped: plan.gapped.clone(),
        }])?;

        let gapped_devices = apply_prune(
            &mut *state,
            guards.iter_mut().map(|(device, cursor)| (*device, &mut **cursor)),
            &plan.sequences,
            &plan.gapped,
        );
        self.stats.record_pruned(plan.sequences.len());
        tracing::info!(
            %user,
            pruned = plan.sequences.len(),
            gapped_devices,
            "operations pruned"
        );

        Ok(SweepReport {
            users: 1,
            pruned: plan.sequences.len(),
            gapped_devices,
        })
    }

    /// Returns the cursor of `device`, registering the device on first
    /// contact. The caller holds `user`'s state lock.
    fn ensure_cursor(
        &self,
        entry: &UserEntry<E, S>,
        log: &UserLog,
        user: &UserId,
        device: &DeviceId,
        now: u64,
    ) -> OplogResult<CursorHandle> {
        if let Some(handle) = entry.cursors.read().get(device) {
            return Ok(Arc::clone(handle));
        }

        let mut cursors = entry.cursors.write();
        if let Some(handle) = cursors.get(device) {
            return Ok(Arc::clone(handle));
        }

        let head = log.head();
        let history_gap = log.pruned_total() > 0;
        self.commit(vec![JournalRecord::Register {
            user: user.clone(),
            device: device.clone(),
            registered_at: head,
            seen_ms: now,
            history_gap,
        }])?;

        let handle = Arc::new(Mutex::new(registration_cursor(log, head, now, history_gap)));
        cursors.insert(device.clone(), Arc::clone(&handle));
        tracing::info!(%user, %device, history_gap, "device registered");
        Ok(handle)
    }

    fn entry(&self, user: &UserId) -> Option<Arc<UserEntry<E, S>>> {
        self.users.read().get(user).cloned()
    }

    fn entry_or_create(&self, user: &UserId) -> Arc<UserEntry<E, S>> {
        if let Some(entry) = self.entry(user) {
            return entry;
        }
        let mut users = self.users.write();
        Arc::clone(users.entry(user.clone()).or_insert_with(|| {
            Arc::new(UserEntry {
                state: RwLock::new(UserState::new()),
                cursors: RwLock::new(HashMap::new()),
            })
        }))
    }

    fn commit(&self, records: Vec<JournalRecord>) -> OplogResult<u64> {
        let group = self.journal.commit(records)?;
        self.stats.record_commit();
        Ok(group)
    }

    fn observe<T>(&self, result: OplogResult<T>) -> OplogResult<T> {
        if let Err(err) = &result {
            self.stats.record_error();
            if err.is_client_error() {
                tracing::debug!(error = %err, "call rejected");
            }
        }
        result
    }
}

impl<E, S> std::fmt::Debug for OperationLog<E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("config", &self.config)
            .field("users", &self.users.read().len())
            .finish_non_exhaustive()
    }
}

type Replayed<E, S> = (UserState<E, S>, HashMap<DeviceId, DeviceCursor>);

fn replay_record<E, S>(
    users: &mut HashMap<UserId, Replayed<E, S>>,
    record: JournalRecord,
) -> OplogResult<()>
where
    E: EntityIndex + Default,
    S: SearchIndex + Default,
{
    let Some(user) = record.user().cloned() else {
        return Ok(());
    };
    let (state, cursors) = users
        .entry(user.clone())
        .or_insert_with(|| (UserState::new(), HashMap::new()));

    match record {
        JournalRecord::Append {
            sequence,
            appended_at_ms,
            operation,
            ..
        } => {
            if let Some(stored) = state.log.get(sequence) {
                if *stored.operation == operation {
                    tracing::warn!(%user, id = %operation.id, sequence, "skipping repeated append");
                    return Ok(());
                }
            }
            if state.log.contains_id(&operation.id) || state.log.get(sequence).is_some() {
                return Err(OplogError::JournalCorrupted(format!(
                    "append of {} at sequence {sequence} collides in the log of {user}",
                    operation.id
                )));
            }
            state.append(sequence, appended_at_ms, Arc::new(operation));
        }
        JournalRecord::Register {
            device,
            registered_at,
            seen_ms,
            history_gap,
            ..
        } => {
            if cursors.contains_key(&device) {
                tracing::warn!(%user, %device, "device registered twice in journal");
            } else {
                let cursor = registration_cursor(&state.log, registered_at, seen_ms, history_gap);
                cursors.insert(device, cursor);
            }
        }
        JournalRecord::Confirm {
            device,
            sequences,
            seen_ms,
            ..
        } => {
            let cursor = registered(cursors, &user, &device)?;
            cursor.confirm_sequences(sequences);
            cursor.touch(seen_ms);
        }
        JournalRecord::ResetCursor {
            device, seen_ms, ..
        } => {
            let cursor = registered(cursors, &user, &device)?;
            reset_cursor_state(cursor, &state.log, seen_ms);
        }
        JournalRecord::Prune {
            sequences, gapped, ..
        } => {
            if let Some(missing) = sequences.iter().find(|&&seq| state.log.get(seq).is_none()) {
                return Err(OplogError::JournalCorrupted(format!(
                    "prune of missing sequence {missing} in the log of {user}"
                )));
            }
            apply_prune(state, cursors.iter_mut(), &sequences, &gapped);
        }
        JournalRecord::CursorState { device, cursor, .. } => {
            cursors.insert(device, cursor);
        }
        JournalRecord::LogHead {
            head,
            pruned_total,
            pruned_ids,
            ..
        } => {
            state.log.restore_pruned(head, pruned_total, pruned_ids);
        }
        JournalRecord::Begin { .. } | JournalRecord::Commit { .. } => {}
    }
    Ok(())
}

fn registered<'a>(
    cursors: &'a mut HashMap<DeviceId, DeviceCursor>,
    user: &UserId,
    device: &DeviceId,
) -> OplogResult<&'a mut DeviceCursor> {
    cursors.get_mut(device).ok_or_else(|| {
        OplogError::JournalCorrupted(format!("record for unregistered device {device} of {user}"))
    })
}

fn registration_cursor(
    log: &UserLog,
    registered_at: u64,
    seen_ms: u64,
    history_gap: bool,
) -> DeviceCursor {
    let mut cursor = DeviceCursor::new(registered_at, seen_ms, history_gap);
    cursor.settle_through(log.gone_through());
    cursor
}

fn reset_cursor_state(cursor: &mut DeviceCursor, log: &UserLog, seen_ms: u64) {
    cursor.reset();
    cursor.settle_through(log.gone_through());
    cursor.touch(seen_ms);
}

/// Removes `sequences` from the log and indexes and settles them on every
/// cursor. Returns how many devices newly got a history gap.
fn apply_prune<'a, E, S, I>(
    state: &mut UserState<E, S>,
    cursors: I,
    sequences: &[u64],
    gapped: &[DeviceId],
) -> usize
where
    E: EntityIndex + Default,
    S: SearchIndex + Default,
    I: IntoIterator<Item = (&'a DeviceId, &'a mut DeviceCursor)>,
{
    for &sequence in sequences {
        state.prune(sequence);
    }

    let floor = state.log.gone_through();
    let mut newly_gapped = 0;
    for (device, cursor) in cursors {
        cursor.settle(sequences.iter().copied());
        cursor.settle_through(floor);
        if gapped.contains(device) && !cursor.history_gap {
            cursor.history_gap = true;
            newly_gapped += 1;
        }
    }
    newly_gapped
}

fn unconfirmed(cursor: &DeviceCursor, candidates: Vec<u64>) -> Vec<u64> {
    let mut pending: Vec<u64> = candidates
        .into_iter()
        .filter(|&seq| !cursor.is_confirmed(seq))
        .collect();
    pending.sort_unstable();
    pending.dedup();
    pending
}

fn validate_caller(user: &UserId, device: &DeviceId) -> OplogResult<()> {
    if !user.is_valid() {
        return Err(OplogError::invalid_argument("invalid user id"));
    }
    if !device.is_valid() {
        return Err(OplogError::invalid_argument("invalid device id"));
    }
    Ok(())
}

fn validate_operation(operation: &Operation, user: &UserId) -> OplogResult<()> {
    if !operation.id.is_valid() {
        return Err(OplogError::invalid_argument(format!(
            "invalid operation id {:?}",
            operation.id
        )));
    }
    if operation.author != *user {
        return Err(OplogError::invalid_argument(format!(
            "operation {} is authored by {}, not the caller",
            operation.id, operation.author
        )));
    }
    if operation.payload_type.is_empty() {
        return Err(OplogError::invalid_argument(format!(
            "operation {} has an empty payload type",
            operation.id
        )));
    }
    if let Some(bad) = operation.tracked_entities.iter().find(|e| !e.is_valid()) {
        return Err(OplogError::invalid_argument(format!(
            "operation {} tracks malformed entity {bad:?}",
            operation.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(UserId, Vec<DeviceId>)>>,
    }

    impl Notifier for Recorder {
        fn notify_update(&self, user: &UserId, ignoring_devices: &[DeviceId]) {
            self.calls.lock().push((user.clone(), ignoring_devices.to_vec()));
        }
    }

    fn ctx() -> CallContext {
        CallContext::background()
    }

    fn alice() -> UserId {
        UserId::from("alice")
    }

    fn device(name: &str) -> DeviceId {
        DeviceId::from(name)
    }

    fn op(id: &str, created_at: u64) -> Operation {
        Operation::new(id, "alice", created_at, "deal", format!("deal {id}").into_bytes())
    }

    fn ids(operations: &[Operation]) -> Vec<&str> {
        operations.iter().map(|op| op.id.as_str()).collect()
    }

    fn open(config: OplogConfig) -> (OperationLog, Arc<Recorder>, Arc<ManualClock>) {
        let recorder = Arc::new(Recorder::default());
        let clock = Arc::new(ManualClock::new(1_000));
        let journal = Arc::new(BackendJournal::new(Box::new(InMemoryBackend::new())));
        let log = OperationLog::open(config, journal, recorder.clone())
            .unwrap()
            .with_clock(clock.clone());
        (log, recorder, clock)
    }

    fn push(log: &OperationLog, dev: &str, ops: Vec<Operation>) -> PushOutcome {
        let pushed = ops.into_iter().map(PushedOperation::from).collect();
        log.push(&ctx(), &alice(), &device(dev), pushed, PushOptions::new())
            .unwrap()
    }

    fn pull(log: &OperationLog, dev: &str) -> PullOutcome {
        log.pull(&ctx(), &alice(), &device(dev), PullOptions::new())
            .unwrap()
    }

    #[test]
    fn push_is_idempotent_by_id() {
        let (log, _, _) = open(OplogConfig::default());
        let first = push(&log, "phone", vec![op("op1", 100)]);
        let second = push(&log, "phone", vec![op("op1", 100), op("op1", 100)]);

        assert_eq!(first.appended, vec![OperationId::from("op1")]);
        assert!(second.appended.is_empty());
        assert_eq!(second.duplicates.len(), 2);
        assert_eq!(second.head_sequence, 1);
        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["op1"]);
    }

    #[test]
    fn pull_orders_by_created_at_then_id() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("b", 200), op("z", 100), op("a", 200)]);

        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["z", "a", "b"]);
        assert_eq!(ids(&pull(&log, "laptop").operations), vec!["z", "a", "b"]);
    }

    #[test]
    fn pushing_device_is_excluded_from_notification() {
        let (log, recorder, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1)]);
        push(&log, "phone", vec![op("op1", 1)]);

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1, "duplicates do not notify");
        assert_eq!(calls[0], (alice(), vec![device("phone")]));
    }

    #[test]
    fn auto_confirm_hides_own_operations() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1)]);
        assert!(pull(&log, "phone").operations.is_empty());

        let pushed = vec![op("op2", 2).into()];
        log.push(
            &ctx(),
            &alice(),
            &device("phone"),
            pushed,
            PushOptions::new().with_auto_confirm(false),
        )
        .unwrap();
        assert_eq!(ids(&pull(&log, "phone").operations), vec!["op2"]);
    }

    #[test]
    fn confirm_hides_operations_until_reset() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1), op("op2", 2)]);
        pull(&log, "tablet");

        let confirmed = [OperationId::from("op1"), OperationId::from("nope")];
        let outcome = log
            .confirm(&ctx(), &alice(), &device("tablet"), &confirmed)
            .unwrap();
        assert_eq!(outcome.newly_confirmed, 1);
        assert_eq!(outcome.confirmed_through, 1);
        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["op2"]);

        log.reset_cursor(&ctx(), &alice(), &device("tablet")).unwrap();
        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["op1", "op2"]);
    }

    #[test]
    fn out_of_order_confirms() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1), op("op2", 2), op("op3", 3)]);

        log.confirm(&ctx(), &alice(), &device("tablet"), &[OperationId::from("op3")])
            .unwrap();
        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["op1", "op2"]);

        let rest = [OperationId::from("op2"), OperationId::from("op1")];
        let outcome = log
            .confirm(&ctx(), &alice(), &device("tablet"), &rest)
            .unwrap();
        assert_eq!(outcome.confirmed_through, 3);
        assert!(pull(&log, "tablet").operations.is_empty());
    }

    #[test]
    fn large_operations_are_withheld() {
        let (log, _, _) = open(OplogConfig::default().with_large_operation_threshold(8));
        let big = Operation::new("big", "alice", 2, "image", vec![0u8; 64]);
        push(&log, "phone", vec![op("op1", 1), big]);

        let options = PullOptions::new().ignoring_large_operations();
        let pulled = log
            .pull(&ctx(), &alice(), &device("tablet"), options)
            .unwrap();
        assert_eq!(ids(&pulled.operations), vec!["op1"]);
        assert_eq!(pulled.skipped_large, vec![OperationId::from("big")]);

        assert_eq!(ids(&pull(&log, "tablet").operations), vec!["op1", "big"]);
    }

    #[test]
    fn get_and_search_are_scoped_to_the_user() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1).tracking("deal", "D1")]);
        let bob_op =
            Operation::new("bob1", "bob", 1, "deal", b"deal bob1".to_vec()).tracking("deal", "D1");
        log.push(
            &ctx(),
            &UserId::from("bob"),
            &device("phone"),
            vec![bob_op.into()],
            PushOptions::new(),
        )
        .unwrap();

        let found = log
            .get(&ctx(), &alice(), &[TrackedEntity::new("deal", "D1")])
            .unwrap();
        assert_eq!(ids(&found), vec!["op1"]);

        let found = log.search(&ctx(), &alice(), "deal", "DEAL").unwrap();
        assert_eq!(ids(&found), vec!["op1"]);
    }

    #[test]
    fn invalid_arguments_are_rejected_before_storage() {
        let (log, _, _) = open(OplogConfig::default());
        assert!(log.search(&ctx(), &alice(), "", "x").unwrap_err().is_client_error());
        assert!(log
            .get(&ctx(), &alice(), &[TrackedEntity::new("deal", "")])
            .unwrap_err()
            .is_client_error());

        let foreign = Operation::new("op1", "mallory", 1, "deal", Vec::new());
        let err = log
            .push(&ctx(), &alice(), &device("phone"), vec![foreign.into()], PushOptions::new())
            .unwrap_err();
        assert!(err.is_client_error());
        assert!(log.users().is_empty());
        assert_eq!(log.journal_size().unwrap(), 0);
    }

    #[test]
    fn cancelled_push_applies_nothing() {
        let (log, recorder, _) = open(OplogConfig::default());
        let cancelled = CallContext::background();
        cancelled.cancel();

        let err = log
            .push(
                &cancelled,
                &alice(),
                &device("phone"),
                vec![op("op1", 1).into()],
                PushOptions::new(),
            )
            .unwrap_err();
        assert!(matches!(err, OplogError::Cancelled));
        assert!(pull(&log, "tablet").operations.is_empty());
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn retention_needs_every_active_device() {
        let config = OplogConfig::default().with_retention_grace(Duration::ZERO);
        let (log, _, _) = open(config);
        push(&log, "phone", vec![op("op1", 1)]);
        pull(&log, "tablet");

        // The phone auto-confirmed; the tablet has not.
        assert_eq!(log.sweep(&ctx()).unwrap().pruned, 0);

        let outcome = log
            .confirm(&ctx(), &alice(), &device("tablet"), &[OperationId::from("op1")])
            .unwrap();
        assert_eq!(outcome.pruned, 1);
        assert!(log.search(&ctx(), &alice(), "deal", "").unwrap().is_empty());

        // A pruned id stays a duplicate.
        let again = push(&log, "phone", vec![op("op1", 1)]);
        assert!(again.appended.is_empty());
    }

    #[test]
    fn confirm_without_prunable_operations_leaves_user_locks_shared() {
        let config = OplogConfig::default().with_retention_grace(Duration::ZERO);
        let (log, _, _) = open(config);
        push(&log, "phone", vec![op("op1", 1)]);
        pull(&log, "tablet");
        pull(&log, "laptop");

        let log = Arc::new(log);
        let entry = log.entry(&alice()).unwrap();
        let reader = entry.state.read();

        let (tx, rx) = mpsc::channel();
        let confirming = Arc::clone(&log);
        let handle = thread::spawn(move || {
            let outcome = confirming.confirm(
                &ctx(),
                &alice(),
                &device("tablet"),
                &[OperationId::from("op1")],
            );
            let _ = tx.send(outcome.ok().map(|o| (o.newly_confirmed, o.pruned)));
        });

        // The laptop has not confirmed, so the sweep has nothing to do and
        // must not queue behind the reader for exclusive access.
        let received = rx.recv_timeout(Duration::from_secs(5));
        drop(reader);
        handle.join().unwrap();
        assert_eq!(received.unwrap(), Some((1, 0)));
        assert_eq!(ids(&pull(&log, "laptop").operations), vec!["op1"]);
    }

    #[test]
    fn devices_registered_after_a_prune_start_past_it() {
        let config = OplogConfig::default().with_retention_grace(Duration::ZERO);
        let (log, _, _) = open(config);
        push(&log, "phone", vec![op("op1", 1), op("op2", 2), op("op3", 3)]);
        pull(&log, "tablet");
        log.confirm(&ctx(), &alice(), &device("tablet"), &[OperationId::from("op1")])
            .unwrap();

        let newcomer = pull(&log, "laptop");
        assert_eq!(ids(&newcomer.operations), vec!["op2", "op3"]);
        let cursor = log.cursor(&alice(), &device("laptop")).unwrap();
        assert_eq!(cursor.confirmed_through, 1);
        assert!(cursor.confirmed_ahead.is_empty());
    }

    #[test]
    fn stale_devices_get_a_history_gap() {
        let config = OplogConfig::default()
            .with_retention_grace(Duration::ZERO)
            .with_device_stale_after(Duration::from_secs(60));
        let (log, _, clock) = open(config);
        pull(&log, "old-tablet");
        clock.advance(Duration::from_secs(120));

        push(&log, "phone", vec![op("op1", 1)]);
        assert_eq!(log.sweep(&ctx()).unwrap().pruned, 1);

        let pulled = pull(&log, "old-tablet");
        assert!(pulled.operations.is_empty());
        assert!(pulled.history_gap);

        let newcomer = pull(&log, "laptop");
        assert!(newcomer.history_gap);

        log.reset_cursor(&ctx(), &alice(), &device("old-tablet")).unwrap();
        assert!(!pull(&log, "old-tablet").history_gap);
    }

    #[test]
    fn share_with_copies_into_counterparty_log() {
        let (log, recorder, _) = open(OplogConfig::default());
        let shared = PushedOperation::from(op("deal1", 1).tracking("deal", "D1")).share_with("bob");
        let outcome = log
            .push(&ctx(), &alice(), &device("phone"), vec![shared.clone()], PushOptions::new())
            .unwrap();
        assert_eq!(outcome.shared, 1);

        let bob = UserId::from("bob");
        let pulled = log.pull(&ctx(), &bob, &device("bob-phone"), PullOptions::new()).unwrap();
        assert_eq!(ids(&pulled.operations), vec!["deal1"]);
        assert_eq!(pulled.operations[0].author, alice());
        assert!(recorder.calls.lock().contains(&(bob.clone(), Vec::new())));

        let retry = log
            .push(&ctx(), &alice(), &device("phone"), vec![shared], PushOptions::new())
            .unwrap();
        assert_eq!(retry.shared, 0);
    }

    #[test]
    fn summaries_report_pending_counts() {
        let (log, _, _) = open(OplogConfig::default());
        push(&log, "phone", vec![op("op1", 1), op("op2", 2)]);
        pull(&log, "tablet");

        let summary = log.user_summary(&alice()).unwrap();
        assert_eq!(summary.head, 2);
        assert_eq!(summary.devices.len(), 2);
        assert_eq!(summary.devices[0].device, device("phone"));
        assert_eq!(summary.devices[0].pending, 0);
        assert_eq!(summary.devices[1].pending, 2);
        assert_eq!(summary.devices[1].last_pulled, 2);
    }
}
