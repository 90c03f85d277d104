//! Shared Connection Cache
//!
//! Wraps the supervisor so that every consumer in the process shares one
//! activation. The activation starts with the first subscriber, survives
//! while any subscriber is attached, and is released a grace period after
//! the last one detaches. New subscribers immediately see the most recent
//! handle-or-absent value.

use crate::supervisor::{
    lock, ActivationGuard, ConnectionState, ConnectionSupervisor, SupervisorState,
};
use car_service::ServiceHandle;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A running supervisor activation and the task forwarding its signal
struct ActiveConnection {
    pump: JoinHandle<()>,
    _guard: ActivationGuard,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Default)]
struct ShareState {
    /// Attached subscribers
    subscribers: usize,
    /// The single live activation, if any
    active: Option<ActiveConnection>,
    /// Delayed teardown scheduled after the last detach
    pending_stop: Option<JoinHandle<()>>,
    /// Bumped on every attach; a pending stop only fires for its generation
    generation: u64,
    /// Activations started so far
    activations: u64,
}

struct SharedInner {
    supervisor: ConnectionSupervisor,
    grace_period: Duration,
    latest: Arc<watch::Sender<Option<ServiceHandle>>>,
    state: Mutex<ShareState>,
}

impl SharedInner {
    fn start(&self) -> ActiveConnection {
        let (mut signals, guard) = self.supervisor.observe_connection().into_parts();
        let latest = self.latest.clone();
        let pump = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                latest.send_replace(signal);
            }
        });
        ActiveConnection {
            pump,
            _guard: guard,
        }
    }

    fn release(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        state.subscribers = state.subscribers.saturating_sub(1);
        if state.subscribers > 0 {
            return;
        }

        let runtime = tokio::runtime::Handle::try_current();
        match runtime {
            Ok(runtime) if !self.grace_period.is_zero() => {
                debug!(
                    "Last subscriber detached, releasing connection in {:?}",
                    self.grace_period
                );
                let generation = state.generation;
                let grace_period = self.grace_period;
                let weak: Weak<Self> = Arc::downgrade(self);
                state.pending_stop = Some(runtime.spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.stop_if_idle(generation);
                    }
                }));
            }
            _ => Self::stop_locked(&self.latest, &mut state),
        }
    }

    fn stop_if_idle(&self, generation: u64) {
        let mut state = lock(&self.state);
        if state.subscribers > 0 || state.generation != generation {
            return;
        }
        state.pending_stop = None;
        Self::stop_locked(&self.latest, &mut state);
    }

    /// Teardown happens under the lock so a new activation cannot overlap it
    fn stop_locked(latest: &watch::Sender<Option<ServiceHandle>>, state: &mut ShareState) {
        if let Some(active) = state.active.take() {
            info!("Releasing shared car service connection");
            drop(active);
        }
        latest.send_replace(None);
    }
}

/// Reference-counted, lazily started shared connection
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<SharedInner>,
}

impl SharedConnection {
    /// Create a shared connection over a supervisor
    pub fn new(supervisor: ConnectionSupervisor, grace_period: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            inner: Arc::new(SharedInner {
                supervisor,
                grace_period,
                latest: Arc::new(latest),
                state: Mutex::new(ShareState::default()),
            }),
        }
    }

    /// Attach a subscriber, starting the supervisor if needed
    ///
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self) -> ConnectionSubscriber {
        let mut state = lock(&self.inner.state);
        state.subscribers += 1;
        state.generation += 1;

        if let Some(pending) = state.pending_stop.take() {
            pending.abort();
            debug!("Subscriber attached within grace period, keeping connection");
        }
        if state.active.is_none() {
            state.active = Some(self.inner.start());
            state.activations += 1;
            debug!("Started shared connection activation #{}", state.activations);
        }

        let rx = self.inner.latest.subscribe();
        drop(state);

        ConnectionSubscriber {
            rx,
            replayed: false,
            inner: self.inner.clone(),
        }
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers
    }

    /// Whether a supervisor activation is live
    pub fn is_active(&self) -> bool {
        lock(&self.inner.state).active.is_some()
    }

    /// Total number of activations started
    pub fn activation_count(&self) -> u64 {
        lock(&self.inner.state).activations
    }

    /// Most recent handle-or-absent value
    pub fn current(&self) -> Option<ServiceHandle> {
        self.inner.latest.borrow().clone()
    }

    /// Observe the supervisor lifecycle state
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.supervisor.state()
    }

    /// Whether a live handle currently exists
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.current_state().connection_state()
    }
}

/// One consumer's view of the shared connection
///
/// Dropping the subscriber detaches it.
pub struct ConnectionSubscriber {
    rx: watch::Receiver<Option<ServiceHandle>>,
    replayed: bool,
    inner: Arc<SharedInner>,
}

impl ConnectionSubscriber {
    /// Most recent handle-or-absent value
    pub fn current(&self) -> Option<ServiceHandle> {
        self.rx.borrow().clone()
    }

    /// Next handle-or-absent value; the first call replays the latest one
    ///
    /// Returns `None` only if the shared connection is gone.
    pub async fn next(&mut self) -> Option<Option<ServiceHandle>> {
        if !self.replayed {
            self.replayed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until a live handle is available
    pub async fn wait_for_handle(&mut self) -> Option<ServiceHandle> {
        loop {
            if let Some(handle) = self.next().await? {
                return Some(handle);
            }
        }
    }
}

impl Drop for ConnectionSubscriber {
    fn drop(&mut self) {
        self.inner.release();
    }
}
