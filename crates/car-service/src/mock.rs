//! Mock Vehicle Property Service
//!
//! Scriptable in-process implementation of [`CarPlatform`] for tests and
//! demos without a vehicle. Connection readiness, service death, legacy
//! disconnect/reconnect, subscription results and read latency can all be
//! driven from the test side.

use crate::error::ServiceError;
use crate::platform::{
    same_listener, CarHandle, CarPlatform, ConnectionCallback, PropertyListener,
    ReadinessListener, ServiceHandle, ASYNC_CONNECT_MIN_API_LEVEL, SUBSCRIBE_EVENTS_MIN_API_LEVEL,
};
use crate::property::{PropertyEvent, PropertyIdentity, PropertyValue, RawPropertyValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::debug;

/// Behavior knobs of the mock service
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Delay before the readiness callback fires (zero = inside `connect_async`)
    pub readiness_delay: Duration,
    /// Readiness reported by `connect_async`
    pub ready_on_connect: bool,
    /// Delay between a successful `connect()` and the connected callback
    pub reconnect_delay: Duration,
    /// Number of upcoming `connect()` calls that fail with InvalidArgument
    pub reconnect_failures: u32,
    /// Result of explicit `subscribe_events`
    pub subscribe_result: bool,
    /// Blocking latency of `read_property`
    pub read_delay: Duration,
    /// Error returned by `read_property` instead of a value
    pub read_error: Option<ServiceError>,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            readiness_delay: Duration::ZERO,
            ready_on_connect: true,
            reconnect_delay: Duration::ZERO,
            reconnect_failures: 0,
            subscribe_result: true,
            read_delay: Duration::ZERO,
            read_error: None,
        }
    }
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    reconnect_attempts: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    reads: AtomicUsize,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
}

struct MockState {
    api_level: u32,
    settings: Mutex<MockSettings>,
    values: Mutex<HashMap<PropertyIdentity, RawPropertyValue>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock platform; clones share the same simulated service
#[derive(Clone)]
pub struct MockCarPlatform {
    state: Arc<MockState>,
}

impl MockCarPlatform {
    /// Create a mock reporting the given API level
    pub fn new(api_level: u32) -> Self {
        Self {
            state: Arc::new(MockState {
                api_level,
                settings: Mutex::new(MockSettings::default()),
                values: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Platform with async connect and explicit subscribe
    pub fn modern() -> Self {
        Self::new(SUBSCRIBE_EVENTS_MIN_API_LEVEL)
    }

    /// Platform with bind/reconnect and callback registration
    pub fn legacy() -> Self {
        Self::new(ASYNC_CONNECT_MIN_API_LEVEL - 1)
    }

    /// Replace the behavior settings
    pub fn configure(&self, settings: MockSettings) {
        *lock(&self.state.settings) = settings;
    }

    /// Adjust a subset of the behavior settings
    pub fn update(&self, f: impl FnOnce(&mut MockSettings)) {
        f(&mut lock(&self.state.settings));
    }

    /// Store the current value of a property
    pub fn set_value(&self, identity: PropertyIdentity, value: PropertyValue, timestamp_nanos: i64) {
        lock(&self.state.values).insert(
            identity,
            RawPropertyValue::new(identity, value, timestamp_nanos),
        );
    }

    /// Deliver an event to every listener registered for its property
    ///
    /// Delivery is by property id only, so listeners also see other areas.
    pub fn emit(&self, event: PropertyEvent) {
        let property_id = match &event {
            PropertyEvent::Changed(raw) => {
                lock(&self.state.values).insert(raw.identity(), raw.clone());
                raw.property_id
            }
            PropertyEvent::Error { property_id, .. } => *property_id,
        };

        let listeners: Vec<Arc<dyn PropertyListener>> = lock(&self.state.handles)
            .iter()
            .filter(|h| h.connected.load(Ordering::SeqCst))
            .flat_map(|h| {
                lock(&h.registrations)
                    .iter()
                    .filter(|r| r.property_id == property_id)
                    .map(|r| r.listener.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        debug!("Mock delivering event to {} listeners", listeners.len());
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    /// Change a value and deliver the change event
    pub fn emit_change(&self, identity: PropertyIdentity, value: PropertyValue, timestamp_nanos: i64) {
        self.emit(PropertyEvent::Changed(RawPropertyValue::new(
            identity,
            value,
            timestamp_nanos,
        )));
    }

    /// Service death on the modern path: readiness goes false
    pub fn revoke(&self) {
        if let Some(handle) = self.current_handle() {
            handle.drop_link();
            let listener = lock(&handle.readiness).clone();
            if let Some(listener) = listener {
                listener.on_lifecycle_changed(handle.service_handle(), false);
            }
        }
    }

    /// Unexpected disconnect on the legacy path
    pub fn drop_connection(&self) {
        if let Some(handle) = self.current_handle() {
            handle.drop_link();
            let callback = lock(&handle.callback).clone();
            if let Some(callback) = callback {
                callback.on_service_disconnected();
            }
        }
    }

    /// Most recently created handle
    pub fn current_handle(&self) -> Option<Arc<MockHandle>> {
        lock(&self.state.handles).last().cloned()
    }

    /// Number of `connect_async`/`bind` calls
    pub fn connect_count(&self) -> usize {
        self.state.counters.connects.load(Ordering::SeqCst)
    }

    /// Number of explicit handle teardowns
    pub fn disconnect_count(&self) -> usize {
        self.state.counters.disconnects.load(Ordering::SeqCst)
    }

    /// Number of legacy `connect()` calls
    pub fn reconnect_attempts(&self) -> usize {
        self.state.counters.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of subscribe/register calls
    pub fn subscribe_calls(&self) -> usize {
        self.state.counters.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe/unregister calls
    pub fn unsubscribe_calls(&self) -> usize {
        self.state.counters.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `read_property` calls
    pub fn read_count(&self) -> usize {
        self.state.counters.reads.load(Ordering::SeqCst)
    }

    /// Handles created and not yet torn down
    pub fn open_handles(&self) -> usize {
        self.state.counters.open_handles.load(Ordering::SeqCst)
    }

    /// Peak of concurrently open handles
    pub fn max_open_handles(&self) -> usize {
        self.state.counters.max_open_handles.load(Ordering::SeqCst)
    }

    /// Registered listeners across all handles
    pub fn listener_count(&self) -> usize {
        lock(&self.state.handles)
            .iter()
            .map(|h| lock(&h.registrations).len())
            .sum()
    }

    fn settings(&self) -> MockSettings {
        lock(&self.state.settings).clone()
    }

    fn new_handle(&self) -> Arc<MockHandle> {
        let counters = &self.state.counters;
        counters.connects.fetch_add(1, Ordering::SeqCst);
        let open = counters.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_open_handles.fetch_max(open, Ordering::SeqCst);

        let handle = Arc::new_cyclic(|me| MockHandle {
            me: me.clone(),
            state: self.state.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            callback: Mutex::new(None),
            readiness: Mutex::new(None),
            registrations: Mutex::new(Vec::new()),
        });
        lock(&self.state.handles).push(handle.clone());
        handle
    }
}

impl CarPlatform for MockCarPlatform {
    fn api_level(&self) -> u32 {
        self.state.api_level
    }

    fn connect_async(
        &self,
        listener: Arc<dyn ReadinessListener>,
    ) -> Result<ServiceHandle, ServiceError> {
        let settings = self.settings();
        let handle = self.new_handle();
        *lock(&handle.readiness) = Some(listener.clone());

        let ready = settings.ready_on_connect;
        if settings.readiness_delay.is_zero() {
            handle.connected.store(ready, Ordering::SeqCst);
            listener.on_lifecycle_changed(handle.service_handle(), ready);
        } else {
            let pending = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(settings.readiness_delay).await;
                if pending.closed.load(Ordering::SeqCst) {
                    return;
                }
                pending.connected.store(ready, Ordering::SeqCst);
                listener.on_lifecycle_changed(pending.service_handle(), ready);
            });
        }
        Ok(handle.service_handle())
    }

    fn bind(&self, callback: Arc<dyn ConnectionCallback>) -> Result<ServiceHandle, ServiceError> {
        let handle = self.new_handle();
        *lock(&handle.callback) = Some(callback);
        handle.schedule_connected(Duration::ZERO);
        Ok(handle.service_handle())
    }
}

struct Registration {
    listener: Arc<dyn PropertyListener>,
    property_id: i32,
}

/// Simulated connection handle
pub struct MockHandle {
    me: Weak<MockHandle>,
    state: Arc<MockState>,
    connected: AtomicBool,
    closed: AtomicBool,
    callback: Mutex<Option<Arc<dyn ConnectionCallback>>>,
    readiness: Mutex<Option<Arc<dyn ReadinessListener>>>,
    registrations: Mutex<Vec<Registration>>,
}

impl MockHandle {
    /// Wrap this mock as a [`ServiceHandle`]
    pub fn service_handle(self: &Arc<Self>) -> ServiceHandle {
        ServiceHandle::new(self.clone())
    }

    /// Whether `disconnect()` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.registrations).clear();
    }

    fn schedule_connected(&self, delay: Duration) {
        let Some(handle) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if handle.closed.load(Ordering::SeqCst) {
                return;
            }
            handle.connected.store(true, Ordering::SeqCst);
            let callback = lock(&handle.callback).clone();
            if let Some(callback) = callback {
                callback.on_service_connected();
            }
        });
    }

    fn ensure_connected(&self) -> Result<(), ServiceError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ServiceError::Disconnected)
        }
    }

    fn remove_listener(&self, listener: &Arc<dyn PropertyListener>) -> Result<(), ServiceError> {
        self.state
            .counters
            .unsubscribe_calls
            .fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        lock(&self.registrations).retain(|r| !same_listener(&r.listener, listener));
        Ok(())
    }
}

impl CarHandle for MockHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&self) -> Result<(), ServiceError> {
        self.state
            .counters
            .reconnect_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServiceError::Disconnected);
        }

        let delay = {
            let mut settings = lock(&self.state.settings);
            if settings.reconnect_failures > 0 {
                settings.reconnect_failures -= 1;
                return Err(ServiceError::InvalidArgument(
                    "service connection already in progress".to_string(),
                ));
            }
            settings.reconnect_delay
        };
        self.schedule_connected(delay);
        Ok(())
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drop_link();
        let counters = &self.state.counters;
        counters.disconnects.fetch_add(1, Ordering::SeqCst);
        counters.open_handles.fetch_sub(1, Ordering::SeqCst);
    }

    fn read_property(
        &self,
        property_id: i32,
        area_id: i32,
    ) -> Result<Option<RawPropertyValue>, ServiceError> {
        self.state.counters.reads.fetch_add(1, Ordering::SeqCst);
        let (delay, error) = {
            let settings = lock(&self.state.settings);
            (settings.read_delay, settings.read_error.clone())
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.ensure_connected()?;
        if let Some(err) = error {
            return Err(err);
        }
        Ok(lock(&self.state.values)
            .get(&PropertyIdentity::new(property_id, area_id))
            .cloned())
    }

    fn subscribe_events(
        &self,
        property_id: i32,
        area_id: i32,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<bool, ServiceError> {
        self.state
            .counters
            .subscribe_calls
            .fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        if rate_hz < 0.0 {
            return Err(ServiceError::InvalidArgument(format!(
                "negative update rate {} for {:#x}@{:#x}",
                rate_hz, property_id, area_id
            )));
        }
        if !lock(&self.state.settings).subscribe_result {
            return Ok(false);
        }
        lock(&self.registrations).push(Registration {
            listener,
            property_id,
        });
        Ok(true)
    }

    fn unsubscribe_events(&self, listener: &Arc<dyn PropertyListener>) -> Result<(), ServiceError> {
        self.remove_listener(listener)
    }

    fn register_callback(
        &self,
        listener: Arc<dyn PropertyListener>,
        property_id: i32,
        rate_hz: f32,
    ) -> Result<(), ServiceError> {
        self.state
            .counters
            .subscribe_calls
            .fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;
        if rate_hz < 0.0 {
            return Err(ServiceError::InvalidArgument(format!(
                "negative update rate {} for {:#x}",
                rate_hz, property_id
            )));
        }
        lock(&self.registrations).push(Registration {
            listener,
            property_id,
        });
        Ok(())
    }

    fn unregister_callback(&self, listener: &Arc<dyn PropertyListener>) -> Result<(), ServiceError> {
        self.remove_listener(listener)
    }
}
