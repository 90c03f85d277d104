//! Connection Supervisor
//!
//! Owns the lifecycle of the service handle for one activation: acquiring
//! it through the platform's modern or legacy connect path, signalling
//! readiness, detecting drops, reconnecting on the legacy path, and tearing
//! the handle down when the activation is dropped.

use crate::config::ReconnectPolicy;
use car_service::{
    supports_async_connect, CarPlatform, ConnectionCallback, ReadinessListener, ServiceError,
    ServiceHandle,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Whether a live handle currently exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Lifecycle of a supervisor activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No activation is running
    Unstarted,
    /// Waiting for the service to become ready
    Connecting,
    /// A live handle is available
    Connected,
    /// The service dropped the connection
    Disconnected,
}

impl SupervisorState {
    /// Collapse the lifecycle into connected/disconnected
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            SupervisorState::Connected => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Supervises connections to the vehicle property service
pub struct ConnectionSupervisor {
    /// Platform entry point
    platform: Arc<dyn CarPlatform>,
    /// Legacy reconnect policy
    policy: ReconnectPolicy,
    /// Lifecycle state, written only by activations
    state: Arc<watch::Sender<SupervisorState>>,
}

impl ConnectionSupervisor {
    /// Create a new supervisor
    pub fn new(platform: Arc<dyn CarPlatform>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SupervisorState::Unstarted);
        Self {
            platform,
            policy,
            state: Arc::new(state),
        }
    }

    /// Observe lifecycle state changes
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Current lifecycle state
    pub fn current_state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Start an activation and observe its handle-or-absent signal
    ///
    /// The connection is acquired immediately and released when the
    /// returned stream is dropped. Must be called within a Tokio runtime.
    pub fn observe_connection(&self) -> ConnectionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let activation = Arc::new(Activation::new(tx, self.state.clone()));
        activation.set_state(SupervisorState::Connecting);

        let api_level = self.platform.api_level();
        let reconnect_task = if supports_async_connect(api_level) {
            info!("Connecting to car service (async connect, api level {})", api_level);
            self.start_modern(&activation);
            None
        } else {
            info!("Binding to car service (legacy bind, api level {})", api_level);
            self.start_legacy(&activation)
        };

        ConnectionStream {
            rx,
            guard: ActivationGuard {
                activation,
                reconnect_task,
            },
        }
    }

    fn start_modern(&self, activation: &Arc<Activation>) {
        let bridge = Arc::new(ReadinessBridge {
            activation: Arc::downgrade(activation),
        });
        match self.platform.connect_async(bridge) {
            Ok(handle) => activation.adopt_initial(&handle),
            Err(e) => {
                error!("Car service connect failed: {}", e);
                activation.emit(None);
            }
        }
    }

    fn start_legacy(&self, activation: &Arc<Activation>) -> Option<JoinHandle<()>> {
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(BindBridge {
            activation: Arc::downgrade(activation),
            reconnect_tx,
        });

        match self.platform.bind(bridge) {
            Ok(handle) => {
                activation.adopt_initial(&handle);
                if handle.is_connected() {
                    activation.emit(Some(handle));
                }
            }
            Err(e) => {
                error!("Car service bind failed: {}", e);
                activation.emit(None);
                return None;
            }
        }

        Some(tokio::spawn(reconnect_loop(
            activation.clone(),
            reconnect_rx,
            self.policy.clone(),
        )))
    }
}

/// State of a single activation, shared with the platform callbacks
struct Activation {
    /// Handle-or-absent signal
    tx: mpsc::UnboundedSender<Option<ServiceHandle>>,
    /// Identity of the last emitted value
    last: Mutex<Option<Option<usize>>>,
    /// The handle owned by this activation
    handle: Mutex<Option<ServiceHandle>>,
    /// Set once teardown has started
    stopped: AtomicBool,
    state: Arc<watch::Sender<SupervisorState>>,
}

impl Activation {
    fn new(
        tx: mpsc::UnboundedSender<Option<ServiceHandle>>,
        state: Arc<watch::Sender<SupervisorState>>,
    ) -> Self {
        Self {
            tx,
            last: Mutex::new(None),
            handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
            state,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SupervisorState) {
        if !self.is_stopped() {
            self.state.send_replace(state);
        }
    }

    fn current_handle(&self) -> Option<ServiceHandle> {
        lock(&self.handle).clone()
    }

    /// Take ownership of the handle returned by the connect call
    ///
    /// A handle already reported through a callback wins.
    fn adopt_initial(&self, handle: &ServiceHandle) {
        let mut slot = lock(&self.handle);
        if self.is_stopped() {
            return;
        }
        slot.get_or_insert_with(|| handle.clone());
    }

    /// Take ownership of a handle reported by the platform
    ///
    /// A different handle replaces the owned one, which is disconnected.
    fn adopt(&self, handle: &ServiceHandle) {
        let previous = {
            let mut slot = lock(&self.handle);
            if self.is_stopped() {
                return;
            }
            if slot.as_ref() == Some(handle) {
                return;
            }
            slot.replace(handle.clone())
        };
        if let Some(previous) = previous {
            info!("Car service handle replaced, disconnecting {:?}", previous);
            previous.disconnect();
        }
    }

    /// Emit a handle-or-absent signal, skipping repeats
    fn emit(&self, handle: Option<ServiceHandle>) {
        if self.is_stopped() {
            return;
        }
        let id = handle.as_ref().map(ServiceHandle::id);
        {
            let mut last = lock(&self.last);
            if *last == Some(id) {
                return;
            }
            *last = Some(id);
        }

        self.set_state(if handle.is_some() {
            SupervisorState::Connected
        } else {
            SupervisorState::Disconnected
        });
        let _ = self.tx.send(handle);
    }

    fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            info!("Disconnecting car service handle {:?}", handle);
            handle.disconnect();
        }
        self.state.send_replace(SupervisorState::Unstarted);
    }
}

struct ReadinessBridge {
    activation: Weak<Activation>,
}

impl ReadinessListener for ReadinessBridge {
    fn on_lifecycle_changed(&self, handle: ServiceHandle, ready: bool) {
        let Some(activation) = self.activation.upgrade() else {
            return;
        };
        activation.adopt(&handle);
        if ready {
            info!("Car service ready");
            activation.emit(Some(handle));
        } else {
            warn!("Car service not ready, connection lost");
            activation.emit(None);
        }
    }
}

struct BindBridge {
    activation: Weak<Activation>,
    reconnect_tx: mpsc::UnboundedSender<()>,
}

impl ConnectionCallback for BindBridge {
    fn on_service_connected(&self) {
        let Some(activation) = self.activation.upgrade() else {
            return;
        };
        info!("Car service connected");
        if let Some(handle) = activation.current_handle() {
            activation.emit(Some(handle));
        }
    }

    fn on_service_disconnected(&self) {
        let Some(activation) = self.activation.upgrade() else {
            return;
        };
        warn!("Car service disconnected unexpectedly");
        activation.emit(None);
        if !activation.is_stopped() {
            let _ = self.reconnect_tx.send(());
        }
    }
}

async fn reconnect_loop(
    activation: Arc<Activation>,
    mut requests: mpsc::UnboundedReceiver<()>,
    policy: ReconnectPolicy,
) {
    while requests.recv().await.is_some() {
        let mut attempts = 0u32;
        loop {
            if activation.is_stopped() {
                return;
            }
            let Some(handle) = activation.current_handle() else {
                return;
            };
            if handle.is_connected() {
                break;
            }

            let delay = policy.backoff(attempts);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
                if activation.is_stopped() {
                    return;
                }
            }

            activation.set_state(SupervisorState::Connecting);
            attempts += 1;
            match handle.connect() {
                Ok(()) => {
                    debug!("Reconnect requested (attempt {})", attempts);
                    break;
                }
                Err(ServiceError::InvalidArgument(reason)) => {
                    warn!("Reconnect attempt {} rejected: {}", attempts, reason);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempts, e);
                }
            }

            if policy.exhausted(attempts) {
                error!("Giving up on car service after {} reconnect attempts", attempts);
                activation.set_state(SupervisorState::Disconnected);
                break;
            }
        }
    }
}

/// Tears an activation down when dropped
pub(crate) struct ActivationGuard {
    activation: Arc<Activation>,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        self.activation.teardown();
    }
}

/// Handle-or-absent signal of one supervisor activation
///
/// Yields `Some(handle)` when the service is ready and `None` when it is
/// gone. Consecutive duplicates are suppressed. Dropping the stream
/// disconnects the handle.
pub struct ConnectionStream {
    rx: mpsc::UnboundedReceiver<Option<ServiceHandle>>,
    guard: ActivationGuard,
}

impl ConnectionStream {
    /// Wait for the next signal
    pub async fn next_signal(&mut self) -> Option<Option<ServiceHandle>> {
        self.rx.recv().await
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<Option<ServiceHandle>>,
        ActivationGuard,
    ) {
        (self.rx, self.guard)
    }
}

impl Stream for ConnectionStream {
    type Item = Option<ServiceHandle>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use car_service::MockCarPlatform;
    use futures::StreamExt;
    use std::time::Duration;

    fn supervisor(mock: &MockCarPlatform, policy: ReconnectPolicy) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Arc::new(mock.clone()), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_modern_ready_then_revoked() {
        let mock = MockCarPlatform::modern();
        let supervisor = supervisor(&mock, ReconnectPolicy::default());
        assert_eq!(supervisor.current_state(), SupervisorState::Unstarted);

        let mut stream = supervisor.observe_connection();
        let handle = stream.next().await.unwrap().expect("handle");
        assert!(handle.is_connected());
        assert_eq!(supervisor.current_state(), SupervisorState::Connected);
        assert_eq!(
            supervisor.current_state().connection_state(),
            ConnectionState::Connected
        );

        mock.revoke();
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(supervisor.current_state(), SupervisorState::Disconnected);

        // No retry on the modern path
        let retry = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(retry.is_err());
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modern_readiness_delay() {
        let mock = MockCarPlatform::modern();
        mock.update(|s| s.readiness_delay = Duration::from_secs(1));
        let supervisor = supervisor(&mock, ReconnectPolicy::default());

        let mut stream = supervisor.observe_connection();
        assert_eq!(supervisor.current_state(), SupervisorState::Connecting);

        let started = tokio::time::Instant::now();
        let handle = stream.next_signal().await.unwrap();
        assert!(handle.is_some());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_tears_down_handle() {
        let mock = MockCarPlatform::modern();
        let supervisor = supervisor(&mock, ReconnectPolicy::default());

        let mut stream = supervisor.observe_connection();
        stream.next().await.unwrap().expect("handle");
        assert_eq!(mock.open_handles(), 1);

        drop(stream);
        assert_eq!(mock.disconnect_count(), 1);
        assert_eq!(mock.open_handles(), 0);
        assert_eq!(supervisor.current_state(), SupervisorState::Unstarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_before_ready_tears_down() {
        let mock = MockCarPlatform::modern();
        mock.update(|s| s.readiness_delay = Duration::from_secs(5));
        let supervisor = supervisor(&mock, ReconnectPolicy::default());

        let stream = supervisor.observe_connection();
        drop(stream);
        assert_eq!(mock.open_handles(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(supervisor.current_state(), SupervisorState::Unstarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_reconnects_same_handle() {
        let mock = MockCarPlatform::legacy();
        mock.update(|s| s.reconnect_delay = Duration::from_secs(2));
        let supervisor = supervisor(&mock, ReconnectPolicy::default());

        let mut stream = supervisor.observe_connection();
        let first = stream.next().await.unwrap().expect("handle");

        mock.drop_connection();
        assert_eq!(stream.next().await.unwrap(), None);

        let second = stream.next().await.unwrap().expect("reconnected handle");
        assert_eq!(first, second);
        assert_eq!(mock.reconnect_attempts(), 1);
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_retries_invalid_argument() {
        let mock = MockCarPlatform::legacy();
        let supervisor = supervisor(&mock, ReconnectPolicy::default());

        let mut stream = supervisor.observe_connection();
        stream.next().await.unwrap().expect("handle");

        mock.update(|s| s.reconnect_failures = 2);
        mock.drop_connection();
        assert_eq!(stream.next().await.unwrap(), None);
        assert!(stream.next().await.unwrap().is_some());
        assert_eq!(mock.reconnect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_gives_up_after_max_retries() {
        let mock = MockCarPlatform::legacy();
        let policy = ReconnectPolicy {
            max_retries: Some(3),
            retry_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let supervisor = supervisor(&mock, policy);

        let mut stream = supervisor.observe_connection();
        stream.next().await.unwrap().expect("handle");

        mock.update(|s| s.reconnect_failures = 100);
        mock.drop_connection();
        assert_eq!(stream.next().await.unwrap(), None);

        let more = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(more.is_err());
        assert_eq!(mock.reconnect_attempts(), 3);
        assert_eq!(supervisor.current_state(), SupervisorState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_stop_halts_reconnect() {
        let mock = MockCarPlatform::legacy();
        let supervisor = supervisor(&mock, ReconnectPolicy::unbounded());

        let mut stream = supervisor.observe_connection();
        stream.next().await.unwrap().expect("handle");

        mock.update(|s| s.reconnect_failures = u32::MAX);
        mock.drop_connection();
        assert_eq!(stream.next().await.unwrap(), None);
        tokio::time::sleep(Duration::from_secs(1)).await;

        drop(stream);
        let attempts = mock.reconnect_attempts();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(mock.reconnect_attempts(), attempts);
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_signals_suppressed() {
        let mock = MockCarPlatform::modern();
        let supervisor = supervisor(&mock, ReconnectPolicy::default());
        let mut stream = supervisor.observe_connection();
        let handle = stream.next().await.unwrap().expect("handle");

        stream.guard.activation.emit(Some(handle.clone()));
        stream.guard.activation.emit(None);
        stream.guard.activation.emit(None);
        stream.guard.activation.emit(Some(handle));

        assert_eq!(stream.next().await.unwrap(), None);
        assert!(stream.next().await.unwrap().is_some());
        let extra = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(extra.is_err());
    }

    /// Mock platform that keeps the readiness listener for later reports
    struct RelayPlatform {
        mock: MockCarPlatform,
        listener: Mutex<Option<Arc<dyn ReadinessListener>>>,
    }

    impl CarPlatform for RelayPlatform {
        fn api_level(&self) -> u32 {
            self.mock.api_level()
        }

        fn connect_async(
            &self,
            listener: Arc<dyn ReadinessListener>,
        ) -> Result<ServiceHandle, ServiceError> {
            *lock(&self.listener) = Some(listener.clone());
            self.mock.connect_async(listener)
        }

        fn bind(&self, callback: Arc<dyn ConnectionCallback>) -> Result<ServiceHandle, ServiceError> {
            self.mock.bind(callback)
        }
    }

    struct Unobserved;

    impl ReadinessListener for Unobserved {
        fn on_lifecycle_changed(&self, _handle: ServiceHandle, _ready: bool) {}
    }

    #[tokio::test]
    async fn test_replacement_handle_is_owned() {
        let mock = MockCarPlatform::modern();
        let relay = Arc::new(RelayPlatform {
            mock: mock.clone(),
            listener: Mutex::new(None),
        });
        let supervisor = ConnectionSupervisor::new(relay.clone(), ReconnectPolicy::default());

        let mut stream = supervisor.observe_connection();
        let first = stream.next().await.unwrap().expect("first handle");
        mock.revoke();
        assert_eq!(stream.next().await.unwrap(), None);

        let second = mock.connect_async(Arc::new(Unobserved)).unwrap();
        let listener = lock(&relay.listener).clone().expect("listener");
        listener.on_lifecycle_changed(second.clone(), true);

        assert_eq!(stream.next().await.unwrap(), Some(second.clone()));
        assert_ne!(first, second);
        assert_eq!(mock.open_handles(), 1);
        assert_eq!(mock.disconnect_count(), 1);

        drop(stream);
        assert_eq!(mock.open_handles(), 0);
        assert!(!second.is_connected());
    }
}
