//! Observer registry with ordered, isolated fan-out
//!
//! Notifications are queued on an unbounded channel and delivered by a single
//! dispatcher task, so observers run off the notifying task and in the order
//! the notifications were queued. A panicking observer is logged and skipped.
//! Subscriptions travel through the same queue, so a new observer never sees
//! a notification that was queued before it subscribed.

use crate::types::{ScanFailure, ScanResult};
use async_channel::{Receiver, Sender};
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

/// Observer for result-set changes
pub type ResultsObserver = Arc<dyn Fn(&[ScanResult]) + Send + Sync>;

/// Observer for scanning-state changes
pub type StateObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Observer for failure events
pub type FailureObserver = Arc<dyn Fn(ScanFailure) + Send + Sync>;

/// Opaque subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Results,
    State,
    Failures,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Results => "scan_results",
            Channel::State => "scan_state",
            Channel::Failures => "scan_fail",
        }
    }
}

#[derive(Default)]
struct ObserverSets {
    results: DashMap<SubscriptionId, ResultsObserver>,
    state: DashMap<SubscriptionId, StateObserver>,
    failures: DashMap<SubscriptionId, FailureObserver>,
}

impl ObserverSets {
    fn remove(&self, channel: Channel, id: &SubscriptionId) -> bool {
        match channel {
            Channel::Results => self.results.remove(id).is_some(),
            Channel::State => self.state.remove(id).is_some(),
            Channel::Failures => self.failures.remove(id).is_some(),
        }
    }
}

/// Identity of a registration travelling through the queue. `removed` is
/// shared with the handle so a removal that races the registration wins.
#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    removed: Arc<AtomicBool>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            id: SubscriptionId::new(),
            removed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

enum Notification {
    Results(Vec<ScanResult>),
    State(bool),
    Failure(ScanFailure),
    SubscribeResults {
        subscription: Subscription,
        observer: ResultsObserver,
        replay: Vec<ScanResult>,
    },
    SubscribeState {
        subscription: Subscription,
        observer: StateObserver,
        current: bool,
    },
    SubscribeFailures {
        subscription: Subscription,
        observer: FailureObserver,
    },
    Flush(oneshot::Sender<()>),
}

/// Disposable handle returned by every `listen_*` call
pub struct ListenerHandle {
    id: SubscriptionId,
    channel: Channel,
    removed: Arc<AtomicBool>,
    sets: Weak<ObserverSets>,
}

impl ListenerHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Unregisters the observer. Calling it again is a no-op.
    ///
    /// Takes effect immediately, even if the dispatcher has not yet processed
    /// the registration.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sets) = self.sets.upgrade() {
            sets.remove(self.channel, &self.id);
        }
        debug!(channel = self.channel.as_str(), id = %self.id, "Listener removed");
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// Three independent observer sets sharing one dispatcher
///
/// Registrations go through the same queue as notifications. An observer
/// therefore sees only what was queued after it subscribed, and its replay
/// arrives before any of that.
pub struct ListenerRegistry {
    sets: Arc<ObserverSets>,
    queue: Sender<Notification>,
}

impl ListenerRegistry {
    /// Creates the registry and spawns its dispatcher on `runtime`
    pub fn new(runtime: &Handle) -> Self {
        let sets = Arc::new(ObserverSets::default());
        let (queue, inbox) = async_channel::unbounded();
        runtime.spawn(dispatch(Arc::clone(&sets), inbox));
        Self { sets, queue }
    }

    /// Registers a result observer; `replay` is delivered to it exactly once
    pub fn listen_results(
        &self,
        observer: ResultsObserver,
        replay: Vec<ScanResult>,
    ) -> ListenerHandle {
        let subscription = Subscription::new();
        let handle = self.handle(&subscription, Channel::Results);
        self.enqueue(Notification::SubscribeResults {
            subscription,
            observer,
            replay,
        });
        handle
    }

    /// Registers a state observer; `current` is delivered to it once
    pub fn listen_state(&self, observer: StateObserver, current: bool) -> ListenerHandle {
        let subscription = Subscription::new();
        let handle = self.handle(&subscription, Channel::State);
        self.enqueue(Notification::SubscribeState {
            subscription,
            observer,
            current,
        });
        handle
    }

    /// Registers a failure observer. Failures are not replayed.
    pub fn listen_failures(&self, observer: FailureObserver) -> ListenerHandle {
        let subscription = Subscription::new();
        let handle = self.handle(&subscription, Channel::Failures);
        self.enqueue(Notification::SubscribeFailures {
            subscription,
            observer,
        });
        handle
    }

    pub fn notify_results(&self, results: Vec<ScanResult>) {
        self.enqueue(Notification::Results(results));
    }

    pub fn notify_state(&self, scanning: bool) {
        self.enqueue(Notification::State(scanning));
    }

    pub fn notify_failure(&self, failure: ScanFailure) {
        self.enqueue(Notification::Failure(failure));
    }

    /// Waits until every notification queued before this call was delivered
    pub async fn flush(&self) {
        let (done, delivered) = oneshot::channel();
        self.enqueue(Notification::Flush(done));
        let _ = delivered.await;
    }

    /// Number of observers the dispatcher has registered across all three sets
    pub fn listener_count(&self) -> usize {
        self.sets.results.len() + self.sets.state.len() + self.sets.failures.len()
    }

    fn handle(&self, subscription: &Subscription, channel: Channel) -> ListenerHandle {
        debug!(channel = channel.as_str(), id = %subscription.id, "Listener registered");
        ListenerHandle {
            id: subscription.id,
            channel,
            removed: Arc::clone(&subscription.removed),
            sets: Arc::downgrade(&self.sets),
        }
    }

    fn enqueue(&self, notification: Notification) {
        if self.queue.try_send(notification).is_err() {
            debug!("Listener dispatcher has shut down, dropping notification");
        }
    }
}

async fn dispatch(sets: Arc<ObserverSets>, inbox: Receiver<Notification>) {
    while let Ok(notification) = inbox.recv().await {
        match notification {
            Notification::Results(results) => {
                for observer in snapshot(&sets.results) {
                    invoke(Channel::Results, || observer(results.as_slice()));
                }
            }
            Notification::State(scanning) => {
                for observer in snapshot(&sets.state) {
                    invoke(Channel::State, || observer(scanning));
                }
            }
            Notification::Failure(failure) => {
                for observer in snapshot(&sets.failures) {
                    invoke(Channel::Failures, || observer(failure));
                }
            }
            Notification::SubscribeResults {
                subscription,
                observer,
                replay,
            } => {
                if register(&sets.results, &subscription, Arc::clone(&observer)) {
                    invoke(Channel::Results, || observer(replay.as_slice()));
                }
            }
            Notification::SubscribeState {
                subscription,
                observer,
                current,
            } => {
                if register(&sets.state, &subscription, Arc::clone(&observer)) {
                    invoke(Channel::State, || observer(current));
                }
            }
            Notification::SubscribeFailures {
                subscription,
                observer,
            } => {
                register(&sets.failures, &subscription, observer);
            }
            Notification::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Listener dispatcher stopped");
}

// Inserts first and checks the flag after, so either this sees a concurrent
// `remove()` or that `remove()` sees the entry.
fn register<T: ?Sized>(
    set: &DashMap<SubscriptionId, Arc<T>>,
    subscription: &Subscription,
    observer: Arc<T>,
) -> bool {
    set.insert(subscription.id, observer);
    if subscription.is_removed() {
        set.remove(&subscription.id);
        return false;
    }
    true
}

// Observers are cloned out first so one may remove itself while running.
fn snapshot<T: ?Sized>(set: &DashMap<SubscriptionId, Arc<T>>) -> Vec<Arc<T>> {
    set.iter().map(|entry| Arc::clone(entry.value())).collect()
}

fn invoke(channel: Channel, call: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(call)) {
        error!(
            channel = channel.as_str(),
            reason = %panic_message(panic.as_ref()),
            "Listener panicked during notification"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
