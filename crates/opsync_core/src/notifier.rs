//! Realtime update notifications.
//!
//! After a push commits, the operation log tells the [`Notifier`] which user
//! changed and which devices caused the change. The notifier wakes every
//! other listener of that user with an [`UpdateSignal`]. Signals carry no
//! data; they are a cue to pull and may be dropped.
//!
//! # Usage
//!
//! ```rust
//! use opsync_core::{Notifier, RealtimeNotifier};
//! use opsync_protocol::{DeviceId, UserId};
//! use std::time::Duration;
//!
//! let notifier = RealtimeNotifier::new(64).unwrap();
//! let alice = UserId::from("alice");
//! let tablet = notifier.subscribe(alice.clone(), DeviceId::from("tablet"), 4);
//!
//! notifier.notify_update(&alice, &[DeviceId::from("phone")]);
//! assert!(tablet.recv_timeout(Duration::from_secs(1)).is_some());
//! notifier.close();
//! ```

use crate::error::{OplogError, OplogResult};
use opsync_protocol::{DeviceId, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Wake-up cue delivered to one device's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSignal {
    /// User whose log changed.
    pub user: UserId,
    /// Device the listener was registered for.
    pub device: DeviceId,
}

/// Receives update signals.
///
/// Callbacks run on the notifier's dispatch thread and should return quickly;
/// a slow callback delays other callbacks, never a push.
pub trait UpdateListener: Send + Sync {
    /// Called once per signal.
    fn on_update(&self, signal: &UpdateSignal);
}

impl<F> UpdateListener for F
where
    F: Fn(&UpdateSignal) + Send + Sync,
{
    fn on_update(&self, signal: &UpdateSignal) {
        self(signal);
    }
}

/// Fan-out of "your data changed" signals.
pub trait Notifier: Send + Sync {
    /// Signals every listener of `user` except those of `ignoring_devices`.
    ///
    /// Never blocks and never fails.
    fn notify_update(&self, user: &UserId, ignoring_devices: &[DeviceId]);
}

/// Notifier that drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_update(&self, _user: &UserId, _ignoring_devices: &[DeviceId]) {}
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Returns the raw id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Channel-backed listener returned by [`RealtimeNotifier::subscribe`].
///
/// Dropping the subscription unregisters it on the next notify.
#[derive(Debug)]
pub struct Subscription {
    id: ListenerId,
    receiver: Receiver<UpdateSignal>,
}

impl Subscription {
    /// Returns the listener id.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns a pending signal without waiting.
    pub fn try_recv(&self) -> Option<UpdateSignal> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for a signal. Returns `None` on timeout or
    /// after the notifier closed.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<UpdateSignal> {
        match self.receiver.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discards pending signals and returns how many there were.
    pub fn drain(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

/// Delivery counters of a [`RealtimeNotifier`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    /// Registered listeners.
    pub listeners: usize,
    /// Signals handed to a listener or its buffer.
    pub delivered: u64,
    /// Signals dropped because a buffer was full.
    pub dropped: u64,
}

enum Sink {
    Callback(Arc<dyn UpdateListener>),
    Channel(SyncSender<UpdateSignal>),
}

struct Registration {
    id: ListenerId,
    device: DeviceId,
    sink: Sink,
}

struct Dispatch {
    listener: Arc<dyn UpdateListener>,
    signal: UpdateSignal,
}

/// In-process [`Notifier`] with per-device listeners.
///
/// Channel subscribers receive signals through a bounded buffer; callback
/// listeners are invoked on a dedicated dispatch thread fed by a bounded
/// queue. A full buffer or queue drops the signal.
///
/// The notifier is constructed once per server, shared as
/// `Arc<dyn Notifier>`, and closed at shutdown.
pub struct RealtimeNotifier {
    listeners: RwLock<HashMap<UserId, Vec<Registration>>>,
    dispatch: RwLock<Option<SyncSender<Dispatch>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl RealtimeNotifier {
    /// Starts a notifier whose callback queue holds `dispatch_capacity`
    /// signals.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatch thread cannot be spawned.
    pub fn new(dispatch_capacity: usize) -> OplogResult<Self> {
        let (tx, rx) = mpsc::sync_channel::<Dispatch>(dispatch_capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("opsync-notifier".into())
            .spawn(move || dispatch_loop(rx))
            .map_err(|e| OplogError::internal(format!("failed to spawn notifier thread: {e}")))?;

        Ok(Self {
            listeners: RwLock::new(HashMap::new()),
            dispatch: RwLock::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Registers a callback for `device` of `user`.
    pub fn add_listener(
        &self,
        user: UserId,
        device: DeviceId,
        listener: Arc<dyn UpdateListener>,
    ) -> ListenerId {
        self.register(user, device, Sink::Callback(listener))
    }

    /// Registers a channel listener with a buffer of `capacity` signals.
    pub fn subscribe(&self, user: UserId, device: DeviceId, capacity: usize) -> Subscription {
        let (tx, receiver) = mpsc::sync_channel(capacity.max(1));
        let id = self.register(user, device, Sink::Channel(tx));
        Subscription { id, receiver }
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
            !registrations.is_empty()
        });
        removed
    }

    /// Number of listeners registered for `user`.
    pub fn listener_count(&self, user: &UserId) -> usize {
        self.listeners.read().get(user).map_or(0, Vec::len)
    }

    /// Returns delivery counters.
    pub fn stats(&self) -> NotifierStats {
        NotifierStats {
            listeners: self.listeners.read().values().map(Vec::len).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Returns true once [`RealtimeNotifier::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops all listeners and stops the dispatch thread.
    ///
    /// Subscriptions observe the close as a disconnect. Later notifications
    /// are ignored. Calling `close` again has no effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count: usize = {
            let mut listeners = self.listeners.write();
            let count = listeners.values().map(Vec::len).sum();
            listeners.clear();
            count
        };
        self.dispatch.write().take();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                tracing::warn!("notifier dispatch thread panicked");
            }
        }
        tracing::debug!(listeners = count, "notifier closed");
    }

    fn register(&self, user: UserId, device: DeviceId, sink: Sink) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.is_closed() {
            tracing::warn!(%user, %device, "listener added after notifier closed");
            return id;
        }
        tracing::trace!(%user, %device, listener = id.0, "listener registered");
        self.listeners
            .write()
            .entry(user)
            .or_default()
            .push(Registration { id, device, sink });
        id
    }

    fn deliver(&self, registration: &Registration, signal: UpdateSignal) -> bool {
        match &registration.sink {
            Sink::Channel(tx) => match tx.try_send(signal) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        listener = registration.id.0,
                        "subscriber buffer full, signal dropped"
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            Sink::Callback(listener) => {
                let dispatch = self.dispatch.read();
                let Some(tx) = dispatch.as_ref() else {
                    return true;
                };
                let job = Dispatch {
                    listener: Arc::clone(listener),
                    signal,
                };
                match tx.try_send(job) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            listener = registration.id.0,
                            "dispatch queue full, signal dropped"
                        );
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
                true
            }
        }
    }
}

impl Notifier for RealtimeNotifier {
    fn notify_update(&self, user: &UserId, ignoring_devices: &[DeviceId]) {
        if self.is_closed() {
            return;
        }

        let mut dead = Vec::new();
        {
            let listeners = self.listeners.read();
            let Some(registrations) = listeners.get(user) else {
                return;
            };
            for registration in registrations {
                if ignoring_devices.contains(&registration.device) {
                    continue;
                }
                let signal = UpdateSignal {
                    user: user.clone(),
                    device: registration.device.clone(),
                };
                if !self.deliver(registration, signal) {
                    dead.push(registration.id);
                }
            }
        }

        for id in dead {
            self.remove_listener(id);
        }
    }
}

impl Drop for RealtimeNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RealtimeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeNotifier")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn dispatch_loop(rx: Receiver<Dispatch>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(|| job.listener.on_update(&job.signal))).is_err() {
            tracing::warn!(user = %job.signal.user, "update listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    fn user() -> UserId {
        UserId::from("alice")
    }

    #[test]
    fn originating_device_is_excluded() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let phone = notifier.subscribe(user(), DeviceId::from("phone"), 4);
        let tablet = notifier.subscribe(user(), DeviceId::from("tablet"), 4);

        notifier.notify_update(&user(), &[DeviceId::from("phone")]);

        let signal = tablet.recv_timeout(WAIT).unwrap();
        assert_eq!(signal.device, DeviceId::from("tablet"));
        assert!(phone.try_recv().is_none());
    }

    #[test]
    fn other_users_are_not_signalled() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let bob = notifier.subscribe(UserId::from("bob"), DeviceId::from("phone"), 4);

        notifier.notify_update(&user(), &[]);
        assert!(bob.try_recv().is_none());
    }

    #[test]
    fn full_buffer_drops_signals() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let slow = notifier.subscribe(user(), DeviceId::from("tablet"), 1);

        notifier.notify_update(&user(), &[]);
        notifier.notify_update(&user(), &[]);
        notifier.notify_update(&user(), &[]);

        assert_eq!(slow.drain(), 1);
        let stats = notifier.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let sub = notifier.subscribe(user(), DeviceId::from("tablet"), 1);
        assert_eq!(notifier.listener_count(&user()), 1);

        drop(sub);
        notifier.notify_update(&user(), &[]);
        assert_eq!(notifier.listener_count(&user()), 0);
    }

    #[test]
    fn callbacks_run_on_dispatch_thread() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        notifier.add_listener(
            user(),
            DeviceId::from("tablet"),
            Arc::new(move |signal: &UpdateSignal| {
                let _ = tx.lock().send(signal.clone());
            }),
        );

        notifier.notify_update(&user(), &[DeviceId::from("phone")]);
        let signal = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(signal.user, user());
    }

    #[test]
    fn panicking_callback_does_not_stop_dispatch() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        notifier.add_listener(
            user(),
            DeviceId::from("bad"),
            Arc::new(|_: &UpdateSignal| panic!("listener bug")),
        );
        let counter = Arc::clone(&calls);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        notifier.add_listener(
            user(),
            DeviceId::from("good"),
            Arc::new(move |_: &UpdateSignal| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.lock().send(());
            }),
        );

        notifier.notify_update(&user(), &[]);
        notifier.notify_update(&user(), &[]);
        rx.recv_timeout(WAIT).unwrap();
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_listener() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let sub = notifier.subscribe(user(), DeviceId::from("tablet"), 4);
        assert!(notifier.remove_listener(sub.id()));
        assert!(!notifier.remove_listener(sub.id()));

        notifier.notify_update(&user(), &[]);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn close_disconnects_subscribers() {
        let notifier = RealtimeNotifier::new(16).unwrap();
        let sub = notifier.subscribe(user(), DeviceId::from("tablet"), 4);

        notifier.close();
        notifier.close();
        assert!(notifier.is_closed());
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(notifier.stats().listeners, 0);

        notifier.notify_update(&user(), &[]);
        let _late = notifier.subscribe(user(), DeviceId::from("late"), 1);
        assert_eq!(notifier.listener_count(&user()), 0);
    }
}
