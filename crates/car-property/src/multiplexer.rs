//! Subscription Multiplexer
//!
//! Turns listener registrations into cancellable, filtered streams of
//! samples. Each stream follows the shared connection: whenever the handle
//! is replaced, the registration is dropped and recreated against the new
//! handle and the current value is re-read.

use crate::compat::SubscriptionShim;
use crate::query::read_blocking;
use car_connection::{ConnectionSubscriber, SharedConnection};
use car_service::{
    PropertyError, PropertyEvent, PropertyIdentity, PropertyListener, PropertySample,
    RawPropertyValue, ServiceError, ServiceHandle,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keep only events for exactly `identity`
///
/// Matching error events become error samples.
pub(crate) fn filter_event(identity: PropertyIdentity, event: PropertyEvent) -> Option<PropertySample> {
    match event {
        PropertyEvent::Changed(raw) if identity.matches(raw.property_id, raw.area_id) => {
            Some(PropertySample::from_raw(raw))
        }
        PropertyEvent::Error {
            property_id,
            area_id,
            error_code,
        } if identity.matches(property_id, area_id) => {
            warn!("Service reported error {} for {}", error_code, identity);
            Some(PropertySample::error(identity))
        }
        _ => None,
    }
}

/// Listener forwarding service callbacks into a bounded channel
struct ChannelListener {
    identity: PropertyIdentity,
    tx: mpsc::Sender<PropertyEvent>,
}

impl ChannelListener {
    fn forward(&self, event: PropertyEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event buffer full for {}, dropping event", self.identity);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl PropertyListener for ChannelListener {
    fn on_change_event(&self, value: RawPropertyValue) {
        self.forward(PropertyEvent::Changed(value));
    }

    fn on_error_event(&self, property_id: i32, area_id: i32, error_code: i32) {
        self.forward(PropertyEvent::Error {
            property_id,
            area_id,
            error_code,
        });
    }
}

/// A live listener registration
struct Registration {
    handle: ServiceHandle,
    listener: Arc<dyn PropertyListener>,
}

#[derive(Default)]
struct Slot {
    /// Set once the stream is dropped; no further registrations
    closed: bool,
    active: Option<Registration>,
}

enum Registered {
    Subscribed,
    Refused,
    Closed,
}

/// Registration bookkeeping shared by a stream and its driver task
struct StreamState {
    identity: PropertyIdentity,
    shim: Arc<dyn SubscriptionShim>,
    slot: Mutex<Slot>,
}

impl StreamState {
    fn register(
        &self,
        handle: &ServiceHandle,
        rate_hz: f32,
        listener: Arc<dyn PropertyListener>,
    ) -> Result<Registered, PropertyError> {
        let mut slot = lock(&self.slot);
        if slot.closed {
            return Ok(Registered::Closed);
        }
        if !self
            .shim
            .subscribe(handle, self.identity, rate_hz, listener.clone())?
        {
            return Ok(Registered::Refused);
        }
        slot.active = Some(Registration {
            handle: handle.clone(),
            listener,
        });
        Ok(Registered::Subscribed)
    }

    fn unregister(&self) {
        let registration = lock(&self.slot).active.take();
        self.release(registration);
    }

    fn close(&self) {
        let registration = {
            let mut slot = lock(&self.slot);
            slot.closed = true;
            slot.active.take()
        };
        self.release(registration);
    }

    fn release(&self, registration: Option<Registration>) {
        let Some(registration) = registration else {
            return;
        };
        match self
            .shim
            .unsubscribe(&registration.handle, &registration.listener)
        {
            Ok(()) => debug!("Unsubscribed {}", self.identity),
            // The handle died underneath us; the next handle gets a fresh registration
            Err(e) => debug!("Ignoring unsubscribe failure for {}: {}", self.identity, e),
        }
    }
}

/// Stream of samples for one property/area
///
/// Yields `Err` at most once, after which the stream ends. Dropping the
/// stream unregisters its listener before `drop` returns.
pub struct PropertyStream {
    identity: PropertyIdentity,
    rx: mpsc::Receiver<Result<PropertySample, PropertyError>>,
    state: Arc<StreamState>,
    driver: JoinHandle<()>,
}

impl PropertyStream {
    /// Identity observed by this stream
    pub fn identity(&self) -> PropertyIdentity {
        self.identity
    }

    /// Wait for the next sample
    pub async fn next_sample(&mut self) -> Option<Result<PropertySample, PropertyError>> {
        self.rx.recv().await
    }
}

impl Stream for PropertyStream {
    type Item = Result<PropertySample, PropertyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PropertyStream {
    fn drop(&mut self) {
        self.state.close();
        self.driver.abort();
    }
}

/// Creates property streams over the shared connection
pub struct SubscriptionMultiplexer {
    connection: SharedConnection,
    shim: Arc<dyn SubscriptionShim>,
    /// Capacity of per-stream event and sample channels
    event_buffer: usize,
}

impl SubscriptionMultiplexer {
    /// Create a new multiplexer
    pub fn new(
        connection: SharedConnection,
        shim: Arc<dyn SubscriptionShim>,
        event_buffer: usize,
    ) -> Self {
        Self {
            connection,
            shim,
            event_buffer: event_buffer.max(1),
        }
    }

    /// Observe a property/area at the requested update rate
    ///
    /// Every call gets its own registration, even for identical requests.
    /// Must be called within a Tokio runtime.
    pub fn observe_property(&self, property_id: i32, area_id: i32, rate_hz: f32) -> PropertyStream {
        let identity = PropertyIdentity::new(property_id, area_id);
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let state = Arc::new(StreamState {
            identity,
            shim: self.shim.clone(),
            slot: Mutex::new(Slot::default()),
        });

        info!("Observing {} at {} Hz via {}", identity, rate_hz, self.shim.name());
        let driver = tokio::spawn(drive(
            self.connection.subscribe(),
            state.clone(),
            rate_hz,
            self.event_buffer,
            tx,
        ));

        PropertyStream {
            identity,
            rx,
            state,
            driver,
        }
    }
}

async fn drive(
    mut connection: ConnectionSubscriber,
    state: Arc<StreamState>,
    rate_hz: f32,
    event_buffer: usize,
    out: mpsc::Sender<Result<PropertySample, PropertyError>>,
) {
    let identity = state.identity;
    let mut signal = connection.next().await;

    loop {
        let handle = match signal {
            None => return,
            Some(None) => {
                signal = connection.next().await;
                continue;
            }
            Some(Some(handle)) => handle,
        };
        debug!("Subscribing {} on {:?}", identity, handle);

        match read_blocking(&handle, identity).await {
            Ok(Some(raw)) => {
                if out.send(Ok(PropertySample::from_raw(raw))).await.is_err() {
                    return;
                }
            }
            Ok(None) => debug!("No current value for {}", identity),
            Err(ServiceError::Disconnected) => {
                debug!("Handle died before {} was subscribed, waiting for the next one", identity);
                signal = connection.next().await;
                continue;
            }
            Err(e) => {
                warn!("Initial read of {} failed: {}", identity, e);
                if out.send(Ok(PropertySample::error(identity))).await.is_err() {
                    return;
                }
            }
        }

        let (event_tx, mut events) = mpsc::channel(event_buffer);
        let listener: Arc<dyn PropertyListener> = Arc::new(ChannelListener {
            identity,
            tx: event_tx,
        });

        match state.register(&handle, rate_hz, listener) {
            Ok(Registered::Subscribed) => {}
            Ok(Registered::Closed) => return,
            Ok(Registered::Refused) => {
                warn!("Service refused subscription for {}", identity);
                let _ = out
                    .send(Err(PropertyError::SubscriptionUnsuccessful {
                        property_id: identity.property_id,
                        area_id: identity.area_id,
                    }))
                    .await;
                return;
            }
            Err(PropertyError::ServiceDisconnected(_)) => {
                debug!("Handle died while subscribing {}, waiting for the next one", identity);
                signal = connection.next().await;
                continue;
            }
            Err(e) => {
                error!("Subscribing {} failed: {}", identity, e);
                let _ = out.send(Err(e)).await;
                return;
            }
        }

        loop {
            tokio::select! {
                next = connection.next() => {
                    debug!("Connection changed, dropping registration for {}", identity);
                    state.unregister();
                    signal = next;
                    break;
                }
                Some(event) = events.recv() => {
                    if let Some(sample) = filter_event(identity, event) {
                        if out.send(Ok(sample)).await.is_err() {
                            state.unregister();
                            return;
                        }
                    }
                }
                _ = out.closed() => {
                    state.unregister();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compat::select_shim;
    use car_connection::{connect_shared, ConnectionConfig};
    use car_service::{
        area_id, property_id, Availability, CarPlatform, MockCarPlatform, PropertyStatus,
        PropertyValue,
    };
    use futures::StreamExt;
    use proptest::prelude::*;
    use std::time::Duration;

    const SPEED: PropertyIdentity = PropertyIdentity {
        property_id: property_id::PERF_VEHICLE_SPEED,
        area_id: area_id::GLOBAL,
    };

    fn multiplexer(mock: &MockCarPlatform) -> SubscriptionMultiplexer {
        let connection = connect_shared(Arc::new(mock.clone()), &ConnectionConfig::default());
        SubscriptionMultiplexer::new(connection, select_shim(mock.api_level()), 16)
    }

    async fn next_sample(stream: &mut PropertyStream) -> PropertySample {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("sample in time")
            .expect("stream open")
            .expect("sample")
    }

    async fn wait_for_listeners(mock: &MockCarPlatform, count: usize) {
        for _ in 0..400 {
            if mock.listener_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} listeners, found {}", count, mock.listener_count());
    }

    #[tokio::test]
    async fn test_initial_value_then_changes() {
        let mock = MockCarPlatform::modern();
        mock.set_value(SPEED, PropertyValue::Float(10.0), 100);
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        let initial = next_sample(&mut stream).await;
        assert_eq!(initial.value, Some(PropertyValue::Float(10.0)));
        assert_eq!(initial.timestamp_nanos, 100);

        wait_for_listeners(&mock, 1).await;
        mock.emit_change(SPEED, PropertyValue::Float(12.5), 200);
        let changed = next_sample(&mut stream).await;
        assert_eq!(changed.value, Some(PropertyValue::Float(12.5)));
        assert_eq!(changed.availability, Availability::Available);
    }

    #[tokio::test]
    async fn test_other_area_is_filtered() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 1).await;

        let driver_side = PropertyIdentity::new(SPEED.property_id, area_id::DRIVER);
        mock.emit_change(driver_side, PropertyValue::Float(99.0), 1);
        let nothing = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(nothing.is_err());

        mock.emit_change(SPEED, PropertyValue::Float(5.0), 2);
        let sample = next_sample(&mut stream).await;
        assert_eq!(sample.identity, SPEED);
        assert_eq!(sample.value, Some(PropertyValue::Float(5.0)));
    }

    #[tokio::test]
    async fn test_refused_subscription_closes_stream() {
        let mock = MockCarPlatform::modern();
        mock.update(|s| s.subscribe_result = false);
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(Err(PropertyError::SubscriptionUnsuccessful { .. }))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(mock.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_rate_closes_stream() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, -1.0);
        let first = stream.next().await;
        assert!(matches!(first, Some(Err(PropertyError::InvalidArgument(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_event_is_in_band() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 1).await;

        mock.emit(PropertyEvent::Error {
            property_id: SPEED.property_id,
            area_id: SPEED.area_id,
            error_code: 1,
        });
        let errored = next_sample(&mut stream).await;
        assert_eq!(errored.availability, Availability::Error);
        assert_eq!(errored.value, None);

        mock.emit_change(SPEED, PropertyValue::Float(3.0), 3);
        let recovered = next_sample(&mut stream).await;
        assert!(recovered.is_available());
    }

    #[tokio::test]
    async fn test_unavailable_status_maps_to_availability() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 1).await;

        mock.emit(PropertyEvent::Changed(RawPropertyValue {
            property_id: SPEED.property_id,
            area_id: SPEED.area_id,
            status: PropertyStatus::Unavailable,
            timestamp_nanos: 7,
            value: PropertyValue::Float(0.0),
        }));
        let sample = next_sample(&mut stream).await;
        assert_eq!(sample.availability, Availability::Unavailable);
    }

    #[tokio::test]
    async fn test_drop_unregisters_synchronously() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 1).await;

        drop(stream);
        assert_eq!(mock.listener_count(), 0);
        assert_eq!(mock.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_identical_requests_register_separately() {
        let mock = MockCarPlatform::modern();
        let mux = multiplexer(&mock);

        let first = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        let second = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 2).await;
        assert_eq!(mock.open_handles(), 1);

        drop(first);
        assert_eq!(mock.listener_count(), 1);
        drop(second);
        assert_eq!(mock.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_legacy_resubscribes_after_reconnect() {
        let mock = MockCarPlatform::legacy();
        mock.update(|s| s.reconnect_delay = Duration::from_millis(200));
        mock.set_value(SPEED, PropertyValue::Float(20.0), 1);
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        assert_eq!(next_sample(&mut stream).await.timestamp_nanos, 1);
        wait_for_listeners(&mock, 1).await;

        mock.drop_connection();
        assert_eq!(mock.listener_count(), 0);

        let reemitted = next_sample(&mut stream).await;
        assert_eq!(reemitted.value, Some(PropertyValue::Float(20.0)));
        wait_for_listeners(&mock, 1).await;
        assert_eq!(mock.subscribe_calls(), 2);
        assert_eq!(mock.connect_count(), 1);

        mock.emit_change(SPEED, PropertyValue::Float(21.0), 2);
        assert_eq!(
            next_sample(&mut stream).await.value,
            Some(PropertyValue::Float(21.0))
        );
    }

    #[tokio::test]
    async fn test_drop_after_connection_loss_is_quiet() {
        let mock = MockCarPlatform::legacy();
        mock.update(|s| s.reconnect_failures = u32::MAX);
        let mux = multiplexer(&mock);

        let stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        wait_for_listeners(&mock, 1).await;
        mock.drop_connection();

        drop(stream);
        assert_eq!(mock.listener_count(), 0);
        assert_eq!(mock.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_connection_lost_during_initial_read_resubscribes() {
        let mock = MockCarPlatform::legacy();
        mock.update(|s| {
            s.read_delay = Duration::from_millis(300);
            s.reconnect_delay = Duration::from_millis(500);
        });
        mock.set_value(SPEED, PropertyValue::Float(33.0), 4);
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        for _ in 0..400 {
            if mock.read_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mock.read_count(), 1);
        mock.drop_connection();

        let sample = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("sample in time")
            .expect("stream open")
            .expect("stream survives the dead handle");
        assert_eq!(sample.value, Some(PropertyValue::Float(33.0)));
        wait_for_listeners(&mock, 1).await;

        mock.emit_change(SPEED, PropertyValue::Float(34.0), 5);
        assert_eq!(
            next_sample(&mut stream).await.value,
            Some(PropertyValue::Float(34.0))
        );
    }

    #[tokio::test]
    async fn test_failed_initial_read_emits_error_sample() {
        let mock = MockCarPlatform::modern();
        mock.update(|s| s.read_error = Some(ServiceError::TryAgain("warming up".into())));
        let mux = multiplexer(&mock);

        let mut stream = mux.observe_property(SPEED.property_id, SPEED.area_id, 10.0);
        let errored = next_sample(&mut stream).await;
        assert_eq!(errored.identity, SPEED);
        assert_eq!(errored.availability, Availability::Error);
        assert_eq!(errored.value, None);

        wait_for_listeners(&mock, 1).await;
        mock.emit_change(SPEED, PropertyValue::Float(8.0), 9);
        assert!(next_sample(&mut stream).await.is_available());
    }

    proptest! {
        #[test]
        fn prop_filter_requires_exact_area(area in any::<i32>(), value in any::<i32>()) {
            let event = PropertyEvent::Changed(RawPropertyValue::new(
                PropertyIdentity::new(SPEED.property_id, area),
                PropertyValue::Int32(value),
                0,
            ));
            let sample = filter_event(SPEED, event);
            prop_assert_eq!(sample.is_some(), area == SPEED.area_id);
        }

        #[test]
        fn prop_filter_requires_exact_property(prop in any::<i32>()) {
            let event = PropertyEvent::Error {
                property_id: prop,
                area_id: SPEED.area_id,
                error_code: 0,
            };
            let sample = filter_event(SPEED, event);
            prop_assert_eq!(sample.is_some(), prop == SPEED.property_id);
        }
    }
}
