use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::{trace, warn};
use tokio::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::device::{Device, DeviceState};
use crate::dispatch::{DeliveryContext, Dispatcher, TokioDelivery};
use crate::fake;
use crate::handle::{CharacteristicHandle, DescriptorHandle};
use crate::operation::Operation;
use crate::{AdapterState, Address, BondState, CharacteristicId, CharacteristicProperties,
            ConnectionState, DescriptorId, DeviceId, DeviceProperty, DisconnectReason, Error,
            Event, GattError, Result, ServiceId, WriteType};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// One GATT object as reported by the backend during discovery. The order
/// of the returned `Vec` is the discovery order and determines structural
/// handle indices.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub id: ServiceId,
    pub uuid: Uuid,
    pub primary: bool,
}

#[derive(Clone, Debug)]
pub struct CharacteristicInfo {
    pub id: CharacteristicId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Clone, Debug)]
pub struct DescriptorInfo {
    pub id: DescriptorId,
    pub uuid: Uuid,
}

/// Events a backend feeds into the session's backend bus.
///
/// The session owns all state tracking; backends just report what the
/// transport tells them and are never expected to track relationships
/// between attributes themselves.
#[derive(Clone, Debug)]
pub enum BackendEvent {
    AdapterStateChanged {
        state: AdapterState,
    },
    DeviceFound {
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        state_change_only: bool,
    },
    DeviceConnected {
        id: DeviceId,
    },
    /// A locally requested disconnect completed.
    DeviceDisconnected {
        id: DeviceId,
    },
    /// The peripheral dropped the connection.
    DeviceConnectionLost {
        id: DeviceId,
    },
    /// A previously initiated connect failed natively.
    DeviceConnectFailed {
        id: DeviceId,
        error: String,
    },
    /// The platform put the connection into a constrained state.
    DeviceLimited {
        id: DeviceId,
    },
    DeviceBondChanged {
        id: DeviceId,
        bond: BondState,
    },
    DeviceRssi {
        id: DeviceId,
        rssi: i16,
    },
    DeviceName {
        id: DeviceId,
        name: String,
    },
    CharacteristicValueChanged {
        id: DeviceId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
}

/// The capability contract a radio transport implements to back a
/// [`Session`].
///
/// Connects and disconnects are initiation-only: the outcome is reported
/// asynchronously through the backend bus ([`BackendEvent`]). GATT discovery
/// must return attributes in the order the transport reports them since
/// that order is what structural handle indices are derived from.
#[async_trait]
pub trait BackendSession: Send + Sync + std::fmt::Debug {
    /// Probed once at session start; later changes arrive as
    /// [`BackendEvent::AdapterStateChanged`].
    fn adapter_state(&self) -> AdapterState;

    fn start_scanning(&self, filter: &Filter) -> Result<()>;
    fn stop_scanning(&self) -> Result<()>;

    async fn device_connect(&self, device: &DeviceId) -> Result<()>;
    async fn device_disconnect(&self, device: &DeviceId) -> Result<()>;

    async fn gatt_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>>;
    async fn gatt_characteristics(&self, device: &DeviceId, service: ServiceId)
                                  -> Result<Vec<CharacteristicInfo>>;
    async fn gatt_descriptors(&self, device: &DeviceId, characteristic: CharacteristicId)
                              -> Result<Vec<DescriptorInfo>>;

    async fn characteristic_read(&self, device: &DeviceId, characteristic: CharacteristicId)
                                 -> Result<Vec<u8>>;
    /// Returns the transport's native response code; `0` for
    /// write-without-response paths, which have no acknowledgement.
    async fn characteristic_write(&self, device: &DeviceId, characteristic: CharacteristicId,
                                  write_type: WriteType, value: &[u8])
                                  -> Result<i32>;
    async fn characteristic_subscribe(&self, device: &DeviceId,
                                      characteristic: CharacteristicId)
                                      -> Result<()>;
    async fn characteristic_unsubscribe(&self, device: &DeviceId,
                                        characteristic: CharacteristicId)
                                        -> Result<()>;

    async fn descriptor_read(&self, device: &DeviceId, descriptor: DescriptorId)
                             -> Result<Vec<u8>>;
    async fn descriptor_write(&self, device: &DeviceId, descriptor: DescriptorId, value: &[u8])
                              -> Result<()>;
}

pub struct Filter {
    pub(crate) service_uuids: HashSet<Uuid>,
}
impl Filter {
    pub fn new() -> Self {
        Self { service_uuids: HashSet::new() }
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);
        self
    }
}
impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

type BackendFactory =
    Box<dyn FnOnce(mpsc::UnboundedSender<BackendEvent>) -> Result<Arc<dyn BackendSession>>
            + Send>;

enum BackendConfig {
    Fake(fake::FakeHost),
    Custom(BackendFactory),
}

pub struct SessionConfig {
    backend: BackendConfig,
    delivery: Option<Arc<dyn DeliveryContext>>,
    connect_timeout: Duration,
    resolve_timeout: Duration,
}

impl SessionConfig {
    /// A session driven by a scriptable in-process fake transport.
    pub fn fake(host: fake::FakeHost) -> Self {
        Self { backend: BackendConfig::Fake(host),
               delivery: None,
               connect_timeout: DEFAULT_CONNECT_TIMEOUT,
               resolve_timeout: DEFAULT_RESOLVE_TIMEOUT }
    }

    /// A session driven by an external [`BackendSession`] implementation.
    /// The factory receives the TX end of the backend bus.
    pub fn with_backend<F>(factory: F) -> Self
        where F: FnOnce(mpsc::UnboundedSender<BackendEvent>) -> Result<Arc<dyn BackendSession>>
                  + Send
                  + 'static
    {
        Self { backend: BackendConfig::Custom(Box::new(factory)),
               delivery: None,
               connect_timeout: DEFAULT_CONNECT_TIMEOUT,
               resolve_timeout: DEFAULT_RESOLVE_TIMEOUT }
    }

    /// Overrides where listener callbacks (operation completions, observer
    /// notifications) are run. Defaults to a dedicated tokio task that runs
    /// them in submission order.
    pub fn set_delivery_context(&mut self, delivery: Arc<dyn DeliveryContext>) -> &mut Self {
        self.delivery = Some(delivery);
        self
    }

    /// How long a connect may stay pending before it's failed and torn down.
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// How long the post-connect GATT discovery may take before the
    /// connection is failed and torn down.
    pub fn set_resolve_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.resolve_timeout = timeout;
        self
    }

    pub async fn start(self) -> Result<Session> {
        Session::start(self).await
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for SessionInner
// we don't really leak anything
#[derive(Debug)]
pub struct SessionInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,

    backend: Arc<dyn BackendSession>,

    // There is also a 'backend_bus' that serves as a stream of events from
    // the backend and a task associated with this frontend which gets
    // spawned during `start()`. One end is handed directly to the backend
    // and the other is passed into the task that will process backend
    // events, so we don't actually store the RX end here.

    adapter_state: StdRwLock<AdapterState>,

    // Note: we have a (tokio) mutex here to synchronize while starting/stopping
    // scanning, not just for maintaining this is_scanning itself, so this can't
    // just be an AtomicBool
    is_scanning: Mutex<bool>,

    // All the state tracking for devices, keyed by their stable id
    devices: DashMap<DeviceId, DeviceState>,

    dispatcher: Dispatcher,

    connect_timeout: Duration,
    resolve_timeout: Duration,
}

impl Session {
    // In situations where we need to pass around a reference to a Session
    // internally but need to avoid creating a circular reference (such as for
    // the task spawned to process backend events) we instead share a Weak<>
    // reference to the SessionInner and then on-demand we can `upgrade` the
    // reference to an `Arc` and use this api to re`wrap()` the SessionInner
    // into a bona fide `Session`.
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig) -> Result<Self> {
        let (broadcast_sender, _) = broadcast::channel(16);

        // The backend is responsible for feeding the backend event bus and
        // then we handle state tracking and forwarding corresponding events
        // to the application as necessary
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        let backend: Arc<dyn BackendSession> = match config.backend {
            BackendConfig::Fake(host) => {
                Arc::new(fake::session::FakeSession::new(host, backend_bus_tx))
            }
            BackendConfig::Custom(factory) => factory(backend_bus_tx)?,
        };

        let delivery = match config.delivery {
            Some(delivery) => delivery,
            None => TokioDelivery::spawn(),
        };

        let adapter_state = backend.adapter_state();
        let session =
            Session { inner: Arc::new(SessionInner { event_bus: broadcast_sender,
                                                     backend,
                                                     adapter_state:
                                                         StdRwLock::new(adapter_state),
                                                     is_scanning: Mutex::new(false),
                                                     devices: DashMap::new(),
                                                     dispatcher: Dispatcher::new(delivery),
                                                     connect_timeout: config.connect_timeout,
                                                     resolve_timeout: config.resolve_timeout }) };

        // XXX: This task (which will be responsible for processing all backend
        // events) is only given a Weak reference to the session, otherwise
        // it would introduce a circular reference and it wouldn't be possible
        // to drop a Session. The task will temporarily upgrade this to a
        // strong reference only while actually processing a backend event,
        // and the task will also be able to recognise when the TX end of the
        // backend_bus closes.
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_backend_task(weak_session, backend_bus_rx).await });

        Ok(session)
    }

    pub(crate) fn ensure_device_state(&self, id: &DeviceId) -> DeviceState {
        // entry() makes the lookup-or-insert atomic so concurrent first
        // references to a device can't clobber each other's state
        self.devices
            .entry(id.clone())
            .or_insert_with(|| DeviceState::new(id.clone()))
            .clone()
    }

    pub(crate) fn get_device_state(&self, id: &DeviceId) -> DeviceState {
        self.ensure_device_state(id)
    }

    fn device_for(&self, id: &DeviceId) -> Device {
        Device::new(self.clone(), id.clone())
    }

    pub(crate) fn new_operation<T, F, Fut>(&self, action: F) -> Operation<T>
        where T: Send + 'static,
              F: FnOnce(Operation<T>) -> Fut + Send + 'static,
              Fut: Future<Output = ()> + Send + 'static
    {
        let op = Operation::create(self.dispatcher.clone(), action);
        op.start();
        op
    }

    /// Returns a stream of session events, including device discovery
    /// notifications, property change notifications and connect/disconnect
    /// events. Also see [`device_events`][Self::device_events] which may be
    /// convenient when you are only interested in a single device.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             if let Ok(x) = x {
                                                 Some(x)
                                             } else {
                                                 None
                                             }
                                         }))
    }

    /// As a convenience this provides a filtered stream of events that
    /// guarantees any device events will only relate to the specified
    /// device. Other events unrelated to devices are delivered, unfiltered.
    pub fn device_events(&self, device: &Device) -> Result<impl Stream<Item = Event>> {
        let filter_id = device.id.clone();
        Ok(self.events()?.filter_map(move |event| {
                             let filter_id = filter_id.clone();
                             async move {
                                 let matches = match &event {
                                     Event::DeviceFound { device, .. }
                                     | Event::DeviceConnected { device }
                                     | Event::DeviceDisconnected { device, .. }
                                     | Event::DevicePropertyChanged { device, .. } => {
                                         device.id == filter_id
                                     }
                                     _ => true,
                                 };
                                 if matches {
                                     Some(event)
                                 } else {
                                     None
                                 }
                             }
                         }))
    }

    pub fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter_state.read().unwrap()
    }

    /// Starts scanning for devices according to the given filter.
    ///
    /// It's an error to try and initiate multiple scans in parallel
    /// considering the varied ways different backends handle such requests.
    pub fn start_scanning(&self, filter: Filter) -> Operation<()> {
        let session = self.clone();
        self.new_operation(move |op| async move {
            if session.adapter_state() != AdapterState::PoweredOn {
                op.fail(Error::AdapterUnavailable.to_string());
                return;
            }
            let mut is_scanning_guard = session.is_scanning.lock().await;
            if *is_scanning_guard {
                op.fail("Already scanning");
                return;
            }
            match session.backend.start_scanning(&filter) {
                Ok(()) => {
                    *is_scanning_guard = true;
                    drop(is_scanning_guard);
                    let _ = session.event_bus.send(Event::ScanStarted);
                    op.succeed(());
                }
                Err(err) => op.fail(format!("Failed to start scanning: {}", err)),
            }
        })
    }

    /// Stops scanning. Stopping while not scanning is a no-op that succeeds.
    pub fn stop_scanning(&self) -> Operation<()> {
        let session = self.clone();
        self.new_operation(move |op| async move {
            let mut is_scanning_guard = session.is_scanning.lock().await;
            if !*is_scanning_guard {
                op.succeed(());
                return;
            }
            match session.backend.stop_scanning() {
                Ok(()) => {
                    *is_scanning_guard = false;
                    drop(is_scanning_guard);
                    let _ = session.event_bus.send(Event::ScanStopped);
                    op.succeed(());
                }
                Err(err) => op.fail(format!("Failed to stop scanning: {}", err)),
            }
        })
    }

    /// Returns a [`Device`] for a known transport address without scanning,
    /// so applications can reconnect to a previously saved device.
    pub fn declare_device(&self, address: Address) -> Device {
        let id = DeviceId::from(address);
        self.ensure_device_state(&id);
        self.device_for(&id)
    }

    /// All devices the session currently tracks (discovered or declared).
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|item| self.device_for(item.key()))
            .collect()
    }

    //
    // Connection lifecycle
    //

    pub(crate) fn connect_device(&self, id: &DeviceId) -> Operation<()> {
        let state = self.ensure_device_state(id);

        let mut op_guard = state.connect_op.lock().unwrap();
        if let Some(op) = op_guard.as_ref() {
            if !op.is_done() {
                trace!("Returning in-flight connect operation for {}", id);
                return op.clone();
            }
        }

        let session = self.clone();
        let device_id = id.clone();
        let op = Operation::create(self.dispatcher.clone(), move |op| async move {
            session.drive_connect(device_id, op).await;
        });
        *op_guard = Some(op.clone());
        drop(op_guard);

        op.start();
        op
    }

    async fn drive_connect(&self, id: DeviceId, op: Operation<()>) {
        if self.adapter_state() == AdapterState::Unavailable {
            op.fail(Error::AdapterUnavailable.to_string());
            return;
        }

        let state = self.get_device_state(&id);
        {
            let mut guard = state.props.write().unwrap();
            match guard.state {
                ConnectionState::Connected if guard.ready => {
                    drop(guard);
                    op.succeed(());
                    return;
                }
                ConnectionState::Connected | ConnectionState::Connecting => {
                    drop(guard);
                    op.fail("A connection attempt is already in progress");
                    return;
                }
                ConnectionState::Disconnected | ConnectionState::Limited => {
                    guard.state = ConnectionState::Connecting;
                    guard.ready = false;
                    guard.pending_reason = None;
                }
            }
        }

        let timer_session = self.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timer_session.connect_timeout).await;
            timer_session.on_connect_timeout(&timer_id).await;
        });
        *state.connect_timer.lock().unwrap() = Some(timer);

        if let Err(err) = self.backend.device_connect(&id).await {
            self.fail_connect_attempt(&id, format!("Connect failed: {}", err));
        }
    }

    async fn on_connect_timeout(&self, id: &DeviceId) {
        let state = self.get_device_state(id);
        {
            let guard = state.props.read().unwrap();
            if guard.state != ConnectionState::Connecting {
                return;
            }
        }
        self.fail_connect_attempt(id, "Timed out waiting for connection");
        if let Err(err) = self.backend.device_disconnect(id).await {
            trace!("Backend disconnect after connect timeout: {}", err);
        }
    }

    /// Tears down a failed connection attempt: fails the pending connect
    /// operation and reports the transition with reason `ConnectError`.
    fn fail_connect_attempt(&self, id: &DeviceId, message: impl Into<String>) {
        let state = self.get_device_state(id);
        state.abort_connect_timer();
        state.cache.clear();
        {
            let mut guard = state.props.write().unwrap();
            guard.state = ConnectionState::Disconnected;
            guard.ready = false;
            guard.pending_reason = None;
        }

        let connect_op = state.connect_op.lock().unwrap().clone();
        if let Some(op) = connect_op {
            if !op.is_done() {
                op.fail(message);
            }
        }

        let _ = self.event_bus.send(Event::DeviceDisconnected {
            device: self.device_for(id),
            reason: DisconnectReason::ConnectError,
        });
    }

    fn on_device_connected(&self, id: DeviceId) {
        let state = self.get_device_state(&id);
        state.abort_connect_timer();
        {
            let mut guard = state.props.write().unwrap();
            if guard.state == ConnectionState::Connected {
                warn!("Spurious, redundant connect notification from backend");
                return;
            }
            guard.state = ConnectionState::Connected;
            guard.ready = false;
        }

        // The connection isn't usable (or announced) until the GATT cache
        // has been rebuilt
        let session = self.clone();
        tokio::spawn(async move { session.complete_connection(id).await });
    }

    async fn complete_connection(&self, id: DeviceId) {
        let state = self.get_device_state(&id);

        let rebuild = state.cache.rebuild(self.backend.as_ref(), &id);
        let result = tokio::time::timeout(self.resolve_timeout, rebuild).await;

        match result {
            Ok(Ok(())) => {
                {
                    let mut guard = state.props.write().unwrap();
                    if guard.state != ConnectionState::Connected {
                        // Lost the connection while resolving; the disconnect
                        // path already reported it
                        return;
                    }
                    guard.ready = true;
                }
                let connect_op = state.connect_op.lock().unwrap().clone();
                if let Some(op) = connect_op {
                    op.succeed(());
                }
                let _ = self.event_bus.send(Event::DeviceConnected {
                    device: self.device_for(&id),
                });
            }
            Ok(Err(err)) => {
                self.abort_connection(&id, format!("Failed to resolve GATT services: {}", err))
                    .await;
            }
            Err(_) => {
                self.abort_connection(&id, "Timed out resolving GATT services").await;
            }
        }
    }

    async fn abort_connection(&self, id: &DeviceId, message: impl Into<String>) {
        self.fail_connect_attempt(id, message);
        if let Err(err) = self.backend.device_disconnect(id).await {
            trace!("Backend disconnect after failed connection completion: {}", err);
        }
    }

    pub(crate) fn disconnect_device(&self, id: &DeviceId) -> Operation<()> {
        let session = self.clone();
        let device_id = id.clone();
        self.new_operation(move |op| async move {
            session.drive_disconnect(device_id, op).await;
        })
    }

    async fn drive_disconnect(&self, id: DeviceId, op: Operation<()>) {
        enum Plan {
            Noop,
            CancelConnect,
            Disconnect,
        }

        let state = self.get_device_state(&id);
        let plan = {
            let mut guard = state.props.write().unwrap();
            match guard.state {
                ConnectionState::Disconnected | ConnectionState::Limited => Plan::Noop,
                ConnectionState::Connecting => {
                    guard.pending_reason = Some(DisconnectReason::Disconnected);
                    Plan::CancelConnect
                }
                ConnectionState::Connected => {
                    guard.pending_reason = Some(DisconnectReason::Disconnected);
                    Plan::Disconnect
                }
            }
        };

        match plan {
            Plan::Noop => op.succeed(()),
            Plan::CancelConnect => {
                state.abort_connect_timer();
                let connect_op = state.connect_op.lock().unwrap().clone();
                if let Some(connect_op) = connect_op {
                    if !connect_op.is_done() {
                        connect_op.fail("Connect cancelled by disconnect request");
                    }
                }
                *state.disconnect_op.lock().unwrap() = Some(op.clone());
                if let Err(err) = self.backend.device_disconnect(&id).await {
                    // Nothing to tear down backend-side; complete locally
                    trace!("Backend disconnect while cancelling connect: {}", err);
                    self.on_device_disconnected(id, DisconnectReason::Disconnected);
                }
            }
            Plan::Disconnect => {
                *state.disconnect_op.lock().unwrap() = Some(op.clone());
                if let Err(err) = self.backend.device_disconnect(&id).await {
                    *state.disconnect_op.lock().unwrap() = None;
                    state.props.write().unwrap().pending_reason = None;
                    op.fail(format!("Disconnect failed: {}", err));
                }
            }
        }
    }

    fn on_device_disconnected(&self, id: DeviceId, default_reason: DisconnectReason) {
        let state = self.get_device_state(&id);
        state.abort_connect_timer();

        let reason = {
            let mut guard = state.props.write().unwrap();
            if guard.state == ConnectionState::Disconnected {
                guard.pending_reason = None;
                drop(guard);
                // XXX: it's possible that the backend could send redundant
                // disconnect events if it has multiple orthogonal indicators
                // of a disconnect happening (e.g. explicit disconnect
                // callback from OS vs observed IO failure) so we try to
                // normalize this for the application...
                warn!("Spurious, unbalanced/redundant disconnect notification from backend");
                let disconnect_op = state.disconnect_op.lock().unwrap().take();
                if let Some(op) = disconnect_op {
                    op.succeed(());
                }
                return;
            }
            guard.state = ConnectionState::Disconnected;
            guard.ready = false;
            guard.pending_reason.take().unwrap_or(default_reason)
        };

        // Structural handles no longer resolve; the value cache and observer
        // registrations deliberately survive for the next connection
        state.cache.clear();

        let connect_op = state.connect_op.lock().unwrap().clone();
        if let Some(op) = connect_op {
            if !op.is_done() {
                op.fail(format!("Disconnected: {}", reason.as_str()));
            }
        }
        let disconnect_op = state.disconnect_op.lock().unwrap().take();
        if let Some(op) = disconnect_op {
            op.succeed(());
        }

        trace!("Notifying device {} disconnected ({})", id, reason.as_str());
        let _ = self.event_bus.send(Event::DeviceDisconnected {
            device: self.device_for(&id),
            reason,
        });
    }

    fn on_device_connect_failed(&self, id: DeviceId, error: String) {
        let state = self.get_device_state(&id);
        {
            let guard = state.props.read().unwrap();
            if guard.state != ConnectionState::Connecting {
                warn!("Spurious connect failure notification from backend");
                return;
            }
        }
        self.fail_connect_attempt(&id, format!("Connect failed: {}", error));
    }

    fn on_device_limited(&self, id: DeviceId) {
        let state = self.get_device_state(&id);
        {
            let mut guard = state.props.write().unwrap();
            guard.state = ConnectionState::Limited;
            guard.ready = false;
        }
        // Limited counts as connectable; handles stop resolving until the
        // next full connection
        state.cache.clear();
    }

    fn on_device_found(&self,
                       id: DeviceId,
                       name: Option<String>,
                       rssi: Option<i16>,
                       state_change_only: bool) {
        let state = self.ensure_device_state(&id);
        let mut changed_props = Vec::new();
        {
            let mut guard = state.props.write().unwrap();
            if let Some(name) = name {
                if guard.name.as_deref() != Some(name.as_str()) {
                    guard.name = Some(name);
                    changed_props.push(DeviceProperty::Name);
                }
            }
            if let Some(rssi) = rssi {
                if guard.rssi != Some(rssi) {
                    guard.rssi = Some(rssi);
                    changed_props.push(DeviceProperty::Rssi);
                }
            }
        }

        let device = self.device_for(&id);
        let _ = self.event_bus.send(Event::DeviceFound { device: device.clone(),
                                                         state_change_only });
        for property in changed_props {
            let _ = self.event_bus.send(Event::DevicePropertyChanged {
                device: device.clone(),
                property,
            });
        }
    }

    fn on_device_property(&self, id: DeviceId, property: DeviceProperty,
                          update: impl FnOnce(&mut crate::device::DeviceProps) -> bool) {
        let state = self.ensure_device_state(&id);
        let changed = {
            let mut guard = state.props.write().unwrap();
            update(&mut guard)
        };
        if changed {
            let _ = self.event_bus.send(Event::DevicePropertyChanged {
                device: self.device_for(&id),
                property,
            });
        }
    }

    fn on_characteristic_value_changed(&self,
                                       id: DeviceId,
                                       characteristic: CharacteristicId,
                                       value: Vec<u8>) {
        let state = self.get_device_state(&id);
        match state.cache.characteristic_by_id(characteristic) {
            Some(handle) => {
                state.store_value(handle.value_handle(), value, &self.dispatcher);
            }
            None => {
                trace!("Dropping value notification for unknown characteristic {:?}",
                       characteristic);
            }
        }
    }

    fn on_adapter_state_changed(&self, adapter_state: AdapterState) {
        *self.inner.adapter_state.write().unwrap() = adapter_state;
        let _ = self.event_bus.send(Event::AdapterStateChanged { state: adapter_state });
    }

    async fn run_backend_task(weak_session_inner: Weak<SessionInner>,
                              backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Starting task to process backend events from the backend_bus...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // We only hold a strong reference back to the Session while we're
            // processing a backend event otherwise we would be holding a
            // circular reference...
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting backend event processor task since Session has been dropped");
                    break;
                }
            };

            match event {
                BackendEvent::AdapterStateChanged { state } => {
                    session.on_adapter_state_changed(state);
                }
                BackendEvent::DeviceFound { id, name, rssi, state_change_only } => {
                    session.on_device_found(id, name, rssi, state_change_only);
                }
                BackendEvent::DeviceConnected { id } => {
                    session.on_device_connected(id);
                }
                BackendEvent::DeviceDisconnected { id } => {
                    session.on_device_disconnected(id, DisconnectReason::Disconnected);
                }
                BackendEvent::DeviceConnectionLost { id } => {
                    session.on_device_disconnected(id, DisconnectReason::ConnectionLost);
                }
                BackendEvent::DeviceConnectFailed { id, error } => {
                    session.on_device_connect_failed(id, error);
                }
                BackendEvent::DeviceLimited { id } => {
                    session.on_device_limited(id);
                }
                BackendEvent::DeviceBondChanged { id, bond } => {
                    session.on_device_property(id, DeviceProperty::Bond, move |props| {
                        let changed = props.bond != bond;
                        props.bond = bond;
                        changed
                    });
                }
                BackendEvent::DeviceRssi { id, rssi } => {
                    session.on_device_property(id, DeviceProperty::Rssi, move |props| {
                        let changed = props.rssi != Some(rssi);
                        props.rssi = Some(rssi);
                        changed
                    });
                }
                BackendEvent::DeviceName { id, name } => {
                    session.on_device_property(id, DeviceProperty::Name, move |props| {
                        let changed = props.name.as_deref() != Some(name.as_str());
                        props.name = Some(name);
                        changed
                    });
                }
                BackendEvent::CharacteristicValueChanged { id, characteristic, value } => {
                    session.on_characteristic_value_changed(id, characteristic, value);
                }
            }
        }

        trace!("Finished task processing backend events from the backend_bus");
    }

    //
    // GATT IO, called from device operations
    //

    pub(crate) async fn characteristic_read(&self,
                                            id: &DeviceId,
                                            handle: &CharacteristicHandle)
                                            -> Result<Vec<u8>> {
        let state = self.get_device_state(id);
        state.check_ready()?;

        let properties = state.cache.characteristic_properties(handle)?;
        if !properties.intersects(CharacteristicProperties::READ) {
            return Err(Error::GattProtocolError(GattError::ReadNotPermitted));
        }

        let characteristic = state.cache.resolve_characteristic(handle)?;
        let value = self.backend.characteristic_read(id, characteristic).await?;
        state.store_value(handle.value_handle(), value.clone(), &self.dispatcher);
        Ok(value)
    }

    pub(crate) async fn characteristic_write(&self,
                                             id: &DeviceId,
                                             handle: &CharacteristicHandle,
                                             write_type: WriteType,
                                             value: &[u8])
                                             -> Result<i32> {
        let state = self.get_device_state(id);
        state.check_ready()?;

        let properties = state.cache.characteristic_properties(handle)?;
        let required = match write_type {
            WriteType::WithResponse => CharacteristicProperties::WRITE,
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        };
        if !properties.intersects(required) {
            return Err(Error::GattProtocolError(GattError::WriteNotPermitted));
        }

        let characteristic = state.cache.resolve_characteristic(handle)?;
        self.backend
            .characteristic_write(id, characteristic, write_type, value)
            .await
    }

    pub(crate) async fn characteristic_set_notify(&self,
                                                  id: &DeviceId,
                                                  handle: &CharacteristicHandle,
                                                  enable: bool)
                                                  -> Result<()> {
        let state = self.get_device_state(id);
        state.check_ready()?;

        let properties = state.cache.characteristic_properties(handle)?;
        if !properties.intersects(CharacteristicProperties::NOTIFY
                                  | CharacteristicProperties::INDICATE)
        {
            return Err(Error::Unsupported);
        }

        let characteristic = state.cache.resolve_characteristic(handle)?;
        if enable {
            self.backend.characteristic_subscribe(id, characteristic).await
        } else {
            self.backend.characteristic_unsubscribe(id, characteristic).await
        }
    }

    pub(crate) async fn descriptor_read(&self,
                                        id: &DeviceId,
                                        handle: &DescriptorHandle)
                                        -> Result<Vec<u8>> {
        let state = self.get_device_state(id);
        state.check_ready()?;

        let descriptor = state.cache.resolve_descriptor(handle)?;
        let value = self.backend.descriptor_read(id, descriptor).await?;
        state.store_value(handle.clone(), value.clone(), &self.dispatcher);
        Ok(value)
    }

    pub(crate) async fn descriptor_write(&self,
                                         id: &DeviceId,
                                         handle: &DescriptorHandle,
                                         value: &[u8])
                                         -> Result<()> {
        let state = self.get_device_state(id);
        state.check_ready()?;

        let descriptor = state.cache.resolve_descriptor(handle)?;
        self.backend.descriptor_write(id, descriptor, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{ConnectBehaviour, FakeCharacteristic, FakeDescriptor, FakeHost,
                      FakeProfile, FakeService};
    use crate::handle::ServiceHandle;
    use crate::uuid::uuid_from_u16;
    use crate::Address;
    use std::str::FromStr;

    async fn start_session(host: &FakeHost) -> Session {
        SessionConfig::fake(host.clone()).start().await.unwrap()
    }

    fn address() -> Address {
        Address::from_str("F1:E2:D3:C4:B5:A6").unwrap()
    }

    fn heart_rate_characteristic() -> FakeCharacteristic {
        FakeCharacteristic::new(uuid_from_u16(0x2A37),
                                CharacteristicProperties::READ
                                | CharacteristicProperties::NOTIFY).with_value(vec![60])
    }

    fn heart_rate_profile(characteristic: FakeCharacteristic) -> FakeProfile {
        FakeProfile::new().with_service(FakeService::primary(uuid_from_u16(0x180D))
                              .with_characteristic(characteristic))
    }

    async fn wait_for_event<S>(events: &mut S, pred: impl Fn(&Event) -> bool) -> Event
        where S: Stream<Item = Event> + Unpin
    {
        loop {
            let event = events.next().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn session_eq() {
        let session0 = start_session(&FakeHost::new()).await;
        let session1 = start_session(&FakeHost::new()).await;
        assert_ne!(session0, session1);
        assert_eq!(session0, session0.clone());
    }

    #[tokio::test]
    async fn connect_makes_handles_resolve() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        device.connect().wait().await.unwrap();
        assert!(device.is_ready());

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceConnected { .. })).await;
        match event {
            Event::DeviceConnected { device: connected } => assert_eq!(connected, device),
            _ => unreachable!(),
        }

        let services = device.services();
        assert_eq!(services, vec![ServiceHandle::new(uuid_from_u16(0x180D), 0)]);
        let characteristics = device.characteristics(&services[0]);
        assert_eq!(characteristics,
                   vec![services[0].characteristic(uuid_from_u16(0x2A37), 0)]);
        assert!(device.characteristic_properties(&characteristics[0])
                      .unwrap()
                      .intersects(CharacteristicProperties::NOTIFY));
    }

    #[tokio::test]
    async fn duplicate_services_are_disambiguated_end_to_end() {
        // A device exposing the Device Information service twice; both
        // instances must be independently addressable.
        let first = FakeCharacteristic::new(uuid_from_u16(0x2A29),
                                            CharacteristicProperties::READ)
            .with_value(b"Vendor A".to_vec());
        let second = FakeCharacteristic::new(uuid_from_u16(0x2A29),
                                             CharacteristicProperties::READ)
            .with_value(b"Vendor B".to_vec());
        let profile = FakeProfile::new()
            .with_service(FakeService::primary(uuid_from_u16(0x180A)).with_characteristic(first))
            .with_service(FakeService::primary(uuid_from_u16(0x180A)).with_characteristic(second));

        let host = FakeHost::new();
        let id = host.add_device(address(), "Duplicated", profile);
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        device.connect().wait().await.unwrap();

        let services = device.services();
        assert_eq!(services,
                   vec![ServiceHandle::new(uuid_from_u16(0x180A), 0),
                        ServiceHandle::new(uuid_from_u16(0x180A), 1)]);

        let ch0 = services[0].characteristic(uuid_from_u16(0x2A29), 0);
        let ch1 = services[1].characteristic(uuid_from_u16(0x2A29), 0);
        assert_eq!(device.read(&ch0).wait().await.unwrap(), b"Vendor A".to_vec());
        assert_eq!(device.read(&ch1).wait().await.unwrap(), b"Vendor B".to_vec());
    }

    #[tokio::test]
    async fn connect_reuses_the_in_flight_operation() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        host.set_connect_behaviour(&id, ConnectBehaviour::Manual);
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let op0 = device.connect();
        let op1 = device.connect();
        assert_eq!(op0, op1);

        wait_until(|| host.connect_calls() == 1).await;
        host.complete_connect(&id);

        op0.wait().await.unwrap();
        assert!(device.is_ready());
        assert_eq!(host.connect_calls(), 1);

        // With the previous operation complete a new connect is a fresh
        // operation (that trivially succeeds while still connected)
        let op2 = device.connect();
        assert_ne!(op0, op2);
        op2.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        host.set_connect_behaviour(&id, ConnectBehaviour::Manual);
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        let err = device.connect().wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg) if msg.contains("Timed out")));
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceDisconnected { .. })).await;
        match event {
            Event::DeviceDisconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ConnectError);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn native_connect_failure_fails_the_operation() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        host.set_connect_behaviour(&id, ConnectBehaviour::Fail("ATT error 0x3e".to_string()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let err = device.connect().wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg) if msg.contains("ATT error 0x3e")));
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_service_resolution_forces_a_disconnect() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        host.set_discovery_failure(&id, true);
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        let err = device.connect().wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg)
                         if msg.contains("Failed to resolve GATT services")));

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceDisconnected { .. })).await;
        match event {
            Event::DeviceDisconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ConnectError);
            }
            _ => unreachable!(),
        }

        assert!(device.services().is_empty());
        assert!(!device.is_ready());
        wait_until(|| !host.is_connected(&id)).await;
    }

    #[tokio::test]
    async fn disconnect_when_not_connected_is_a_noop() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        device.disconnect().wait().await.unwrap();
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
        assert_eq!(host.connect_calls(), 0);
    }

    #[tokio::test]
    async fn disconnect_cancels_an_in_flight_connect() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        host.set_connect_behaviour(&id, ConnectBehaviour::Manual);
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let connect_op = device.connect();
        wait_until(|| host.connect_calls() == 1).await;

        device.disconnect().wait().await.unwrap();
        let err = connect_op.wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
        assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn requested_disconnect_reports_the_right_reason() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        device.connect().wait().await.unwrap();
        device.disconnect().wait().await.unwrap();

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceDisconnected { .. })).await;
        match event {
            Event::DeviceDisconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Disconnected);
            }
            _ => unreachable!(),
        }
        assert!(!device.is_ready());
    }

    #[tokio::test]
    async fn lost_connection_reports_the_right_reason() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        device.connect().wait().await.unwrap();
        host.drop_connection(&id);

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceDisconnected { .. })).await;
        match event {
            Event::DeviceDisconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::ConnectionLost);
            }
            _ => unreachable!(),
        }
        assert!(device.services().is_empty());
    }

    #[tokio::test]
    async fn reads_feed_observers_and_the_value_cache() {
        let characteristic = heart_rate_characteristic();
        let characteristic_id = characteristic.id();
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(characteristic));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        let observer = device.subscribe(&handle);
        let mut values = Box::pin(observer.values());

        device.connect().wait().await.unwrap();
        assert_eq!(device.read(&handle).wait().await.unwrap(), vec![60]);
        assert_eq!(values.next().await, Some(vec![60]));

        device.set_notify(&handle, true).wait().await.unwrap();
        assert!(host.is_subscribed(&id, characteristic_id));
        host.notify(&id, characteristic_id, vec![61]);
        assert_eq!(values.next().await, Some(vec![61]));
        assert_eq!(device.cached_value(&handle.value_handle()), Some(vec![61]));
    }

    #[tokio::test]
    async fn unobserved_notifications_are_cached_but_not_delivered() {
        let characteristic = heart_rate_characteristic();
        let characteristic_id = characteristic.id();
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(characteristic));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        device.connect().wait().await.unwrap();
        host.notify(&id, characteristic_id, vec![72]);

        let handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0)
            .value_handle();
        wait_until(|| device.cached_value(&handle) == Some(vec![72])).await;
    }

    #[tokio::test]
    async fn value_cache_survives_a_disconnect() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        device.connect().wait().await.unwrap();
        device.read(&handle).wait().await.unwrap();
        device.disconnect().wait().await.unwrap();

        // Stale but available (and logged as such); handles no longer
        // resolve for live IO though
        assert_eq!(device.cached_value(&handle.value_handle()), Some(vec![60]));
        let err = device.read(&handle).wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[tokio::test]
    async fn writes_require_the_matching_property() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        device.connect().wait().await.unwrap();

        let handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        let err = device.write(&handle, WriteType::WithResponse, vec![1])
                        .wait()
                        .await
                        .unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg)
                         if msg.contains("Write Not Permitted")));
    }

    #[tokio::test]
    async fn writes_surface_the_native_response_code() {
        let characteristic =
            FakeCharacteristic::new(uuid_from_u16(0x2A39),
                                    CharacteristicProperties::WRITE
                                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
                .with_write_response(4);
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(characteristic));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        device.connect().wait().await.unwrap();

        let handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A39), 0);
        let code = device.write(&handle, WriteType::WithResponse, vec![1])
                         .wait()
                         .await
                         .unwrap();
        assert_eq!(code, 4);

        // Without-response writes have no acknowledgement to report
        let code = device.write(&handle, WriteType::WithoutResponse, vec![2])
                         .wait()
                         .await
                         .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn reconnect_resolves_the_new_profile_only() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let old_handle = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        device.connect().wait().await.unwrap();
        assert_eq!(device.read(&old_handle).wait().await.unwrap(), vec![60]);
        device.disconnect().wait().await.unwrap();

        // The device comes back advertising a different profile; the cache
        // rebuild must reflect it with no stale entries
        let battery = FakeCharacteristic::new(uuid_from_u16(0x2A19),
                                              CharacteristicProperties::READ)
            .with_value(vec![88]);
        let profile = FakeProfile::new()
            .with_service(FakeService::primary(uuid_from_u16(0x180F))
                              .with_characteristic(battery))
            .with_service(FakeService::secondary(uuid_from_u16(0x1801)));
        host.set_profile(&id, profile);
        device.connect().wait().await.unwrap();

        assert_eq!(device.services(),
                   vec![ServiceHandle::new(uuid_from_u16(0x180F), 0),
                        ServiceHandle::new(uuid_from_u16(0x1801), 0)]);
        let new_handle = ServiceHandle::new(uuid_from_u16(0x180F), 0)
            .characteristic(uuid_from_u16(0x2A19), 0);
        assert_eq!(device.read(&new_handle).wait().await.unwrap(), vec![88]);

        let err = device.read(&old_handle).wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[tokio::test]
    async fn limited_state_clears_the_cache_but_stays_connectable() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        device.connect().wait().await.unwrap();
        assert!(!device.services().is_empty());

        host.set_limited(&id);
        wait_until(|| device.connection_state() == ConnectionState::Limited).await;
        assert!(!device.is_ready());
        assert!(device.services().is_empty());

        // Limited counts as connectable; a fresh connect rebuilds the cache
        device.connect().wait().await.unwrap();
        assert!(device.is_ready());
        assert!(!device.services().is_empty());
    }

    #[tokio::test]
    async fn bond_changes_surface_as_property_events() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        let mut events = Box::pin(session.events().unwrap());

        assert_eq!(device.bond_state(), BondState::NotBonded);
        host.set_bond_state(&id, BondState::Bonded);

        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DevicePropertyChanged { .. })).await;
        match event {
            Event::DevicePropertyChanged { property, .. } => {
                assert_eq!(property, DeviceProperty::Bond);
            }
            _ => unreachable!(),
        }
        assert_eq!(device.bond_state(), BondState::Bonded);
    }

    #[tokio::test]
    async fn flat_handles_cover_the_io_surface() {
        let characteristic =
            FakeCharacteristic::new(uuid_from_u16(0x2A37),
                                    CharacteristicProperties::READ
                                    | CharacteristicProperties::WRITE
                                    | CharacteristicProperties::NOTIFY)
                .with_value(vec![60])
                .with_descriptor(FakeDescriptor::new(uuid_from_u16(0x2902))
                                     .with_value(vec![0, 0]));
        let characteristic_id = characteristic.id();
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(characteristic));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());

        let ch = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        let flat = crate::GattHandle::from(ch.clone());
        let observer = device.subscribe_gatt(&flat).unwrap();
        let mut values = Box::pin(observer.values());

        device.connect().wait().await.unwrap();
        assert_eq!(device.read_gatt(&flat).unwrap().wait().await.unwrap(), vec![60]);
        assert_eq!(values.next().await, Some(vec![60]));
        assert_eq!(device.write_gatt(&flat, WriteType::WithResponse, vec![61])
                         .unwrap()
                         .wait()
                         .await
                         .unwrap(),
                   0);

        device.set_notify_gatt(&flat, true).unwrap().wait().await.unwrap();
        assert!(host.is_subscribed(&id, characteristic_id));
        assert_eq!(device.cached_value_gatt(&flat), Some(vec![60]));

        // Descriptor writes are acknowledged but carry no response code
        let descriptor = crate::GattHandle::from(ch.descriptor(uuid_from_u16(0x2902), 0));
        assert_eq!(device.write_gatt(&descriptor, WriteType::WithResponse, vec![1, 0])
                         .unwrap()
                         .wait()
                         .await
                         .unwrap(),
                   0);

        // A service handle has no value to read, write or observe
        let service = crate::GattHandle::from(ServiceHandle::new(uuid_from_u16(0x180D), 0));
        assert!(matches!(device.read_gatt(&service), Err(Error::InvalidHandle)));
        assert!(matches!(device.write_gatt(&service, WriteType::WithResponse, vec![0]),
                         Err(Error::InvalidHandle)));
        assert!(matches!(device.set_notify_gatt(&service, true), Err(Error::InvalidHandle)));
        assert!(matches!(device.subscribe_gatt(&service), Err(Error::InvalidHandle)));
        assert_eq!(device.cached_value_gatt(&service), None);
    }

    #[tokio::test]
    async fn descriptor_round_trip() {
        let characteristic =
            FakeCharacteristic::new(uuid_from_u16(0x2A37),
                                    CharacteristicProperties::READ
                                    | CharacteristicProperties::NOTIFY)
                .with_descriptor(FakeDescriptor::new(uuid_from_u16(0x2902))
                                     .with_value(vec![0, 0]));
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(characteristic));
        let session = start_session(&host).await;
        let device = session.declare_device(id.address().clone());
        device.connect().wait().await.unwrap();

        let ch = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        let descriptor = ch.descriptor(uuid_from_u16(0x2902), 0);
        assert_eq!(device.descriptors(&ch), vec![descriptor.clone()]);

        assert_eq!(device.read_descriptor(&descriptor).wait().await.unwrap(), vec![0, 0]);
        device.write_descriptor(&descriptor, vec![1, 0]).wait().await.unwrap();
        assert_eq!(device.read_descriptor(&descriptor).wait().await.unwrap(), vec![1, 0]);
        assert_eq!(device.cached_value(&descriptor), Some(vec![1, 0]));
    }

    #[tokio::test]
    async fn scanning_lifecycle() {
        let host = FakeHost::new();
        let id = host.add_device(address(), "HRM", heart_rate_profile(heart_rate_characteristic()));
        let session = start_session(&host).await;
        let mut events = Box::pin(session.events().unwrap());

        session.start_scanning(Filter::new()).wait().await.unwrap();
        assert!(host.is_scanning());
        wait_for_event(&mut events, |e| matches!(e, Event::ScanStarted)).await;

        let err = session.start_scanning(Filter::new()).wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(ref msg) if msg.contains("Already scanning")));

        host.advertise(&id, -42);
        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::DeviceFound { .. })).await;
        match event {
            Event::DeviceFound { device, state_change_only } => {
                assert!(!state_change_only);
                assert_eq!(device.name().as_deref(), Some("HRM"));
                assert_eq!(device.rssi(), Some(-42));
            }
            _ => unreachable!(),
        }

        session.stop_scanning().wait().await.unwrap();
        assert!(!host.is_scanning());
        wait_for_event(&mut events, |e| matches!(e, Event::ScanStopped)).await;

        // Stopping while not scanning succeeds quietly
        session.stop_scanning().wait().await.unwrap();
    }

    #[tokio::test]
    async fn adapter_state_changes_are_reported() {
        let host = FakeHost::new();
        let session = start_session(&host).await;
        assert_eq!(session.adapter_state(), AdapterState::PoweredOn);
        let mut events = Box::pin(session.events().unwrap());

        host.set_adapter_state(AdapterState::PoweredOff);
        let event = wait_for_event(&mut events,
                                   |e| matches!(e, Event::AdapterStateChanged { .. })).await;
        match event {
            Event::AdapterStateChanged { state } => assert_eq!(state, AdapterState::PoweredOff),
            _ => unreachable!(),
        }
        assert_eq!(session.adapter_state(), AdapterState::PoweredOff);

        let err = session.start_scanning(Filter::new()).wait().await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }
}
