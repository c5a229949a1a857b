use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;

use dashmap::DashMap;
use futures::Stream;
use log::warn;
use tokio::task::JoinHandle;

use crate::cache::GattCache;
use crate::dispatch::Dispatcher;
use crate::handle::{CharacteristicHandle, DescriptorHandle, GattHandle, ServiceHandle};
use crate::observer::{Observer, ObserverRegistry};
use crate::operation::Operation;
use crate::session::Session;
use crate::{Address, BondState, CharacteristicProperties, ConnectionState, DeviceId,
            DisconnectReason, Error, Event, Result, WriteType};

// For the public API a Device is just a thin wrapper over a device id and
// the session it belongs to; all the state lives in the session's device
// index. This keeps the app-facing type Clone + cheap and avoids any
// circular reference back from session state to app objects.

#[derive(Clone)]
pub struct Device {
    pub(crate) session: Session,
    pub(crate) id: DeviceId,
}

impl PartialEq for Device {
    fn eq(&self, other: &Device) -> bool {
        self.session == other.session && self.id == other.id
    }
}
impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
         .field("id", &self.id)
         .field("state", &self.connection_state())
         .finish()
    }
}

impl Device {
    pub(crate) fn new(session: Session, id: DeviceId) -> Self {
        Self { session, id }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn address(&self) -> &Address {
        self.id.address()
    }

    pub fn name(&self) -> Option<String> {
        let state = self.session.get_device_state(&self.id);
        let guard = state.props.read().unwrap();
        guard.name.clone()
    }

    pub fn rssi(&self) -> Option<i16> {
        let state = self.session.get_device_state(&self.id);
        let guard = state.props.read().unwrap();
        guard.rssi
    }

    pub fn bond_state(&self) -> BondState {
        let state = self.session.get_device_state(&self.id);
        let guard = state.props.read().unwrap();
        guard.bond
    }

    pub fn connection_state(&self) -> ConnectionState {
        let state = self.session.get_device_state(&self.id);
        let guard = state.props.read().unwrap();
        guard.state
    }

    /// Whether the device is connected *and* its GATT cache has been
    /// rebuilt, i.e. structural handles currently resolve.
    pub fn is_ready(&self) -> bool {
        let state = self.session.get_device_state(&self.id);
        let guard = state.props.read().unwrap();
        guard.state == ConnectionState::Connected && guard.ready
    }

    /// Requests a connection to the device.
    ///
    /// The returned operation is already started and completes once the
    /// device is connected and its GATT cache has been rebuilt (also
    /// reported as [`Event::DeviceConnected`]). While a connect is already
    /// in flight the same in-flight operation is returned.
    pub fn connect(&self) -> Operation<()> {
        self.session.connect_device(&self.id)
    }

    /// Requests a disconnect.
    ///
    /// Disconnecting a device that isn't connected is a no-op that succeeds
    /// immediately. Disconnecting while a connect is in flight cancels the
    /// connect (failing its operation).
    pub fn disconnect(&self) -> Operation<()> {
        self.session.disconnect_device(&self.id)
    }

    /// A stream of session events filtered to this device.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        self.session.device_events(self)
    }

    /// The device's services in discovery order. Empty unless the device is
    /// ready.
    pub fn services(&self) -> Vec<ServiceHandle> {
        let state = self.session.get_device_state(&self.id);
        state.cache.services()
    }

    /// The characteristics of one service, in discovery order.
    pub fn characteristics(&self, service: &ServiceHandle) -> Vec<CharacteristicHandle> {
        let state = self.session.get_device_state(&self.id);
        state.cache.characteristics(service)
    }

    /// The descriptors of one characteristic, in discovery order.
    pub fn descriptors(&self, characteristic: &CharacteristicHandle) -> Vec<DescriptorHandle> {
        let state = self.session.get_device_state(&self.id);
        state.cache.descriptors(characteristic)
    }

    pub fn characteristic_properties(&self,
                                     characteristic: &CharacteristicHandle)
                                     -> Result<CharacteristicProperties> {
        let state = self.session.get_device_state(&self.id);
        state.cache.characteristic_properties(characteristic)
    }

    /// Reads a characteristic value. The value is also stored in the value
    /// cache and delivered to any observer registered for the
    /// characteristic's value handle.
    pub fn read(&self, characteristic: &CharacteristicHandle) -> Operation<Vec<u8>> {
        let session = self.session.clone();
        let id = self.id.clone();
        let handle = characteristic.clone();
        self.session.new_operation(move |op| async move {
            match session.characteristic_read(&id, &handle).await {
                Ok(value) => op.succeed(value),
                Err(err) => op.fail(err.to_string()),
            }
        })
    }

    /// Writes a characteristic value. On success the operation resolves to
    /// the transport's native response code, or `0` for
    /// write-without-response (which has no acknowledgement).
    pub fn write(&self,
                 characteristic: &CharacteristicHandle,
                 write_type: WriteType,
                 value: Vec<u8>)
                 -> Operation<i32> {
        let session = self.session.clone();
        let id = self.id.clone();
        let handle = characteristic.clone();
        self.session.new_operation(move |op| async move {
            match session.characteristic_write(&id, &handle, write_type, &value).await {
                Ok(code) => op.succeed(code),
                Err(err) => op.fail(err.to_string()),
            }
        })
    }

    pub fn read_descriptor(&self, descriptor: &DescriptorHandle) -> Operation<Vec<u8>> {
        let session = self.session.clone();
        let id = self.id.clone();
        let handle = descriptor.clone();
        self.session.new_operation(move |op| async move {
            match session.descriptor_read(&id, &handle).await {
                Ok(value) => op.succeed(value),
                Err(err) => op.fail(err.to_string()),
            }
        })
    }

    pub fn write_descriptor(&self, descriptor: &DescriptorHandle, value: Vec<u8>)
                            -> Operation<()> {
        let session = self.session.clone();
        let id = self.id.clone();
        let handle = descriptor.clone();
        self.session.new_operation(move |op| async move {
            match session.descriptor_write(&id, &handle, &value).await {
                Ok(()) => op.succeed(()),
                Err(err) => op.fail(err.to_string()),
            }
        })
    }

    /// Reads whatever the handle addresses. A service handle isn't readable
    /// and a synthetic value handle reads its characteristic.
    pub fn read_gatt(&self, handle: &GattHandle) -> Result<Operation<Vec<u8>>> {
        match handle {
            GattHandle::Service(_) => Err(Error::InvalidHandle),
            GattHandle::Characteristic(ch) => Ok(self.read(ch)),
            GattHandle::Descriptor(desc) if desc.is_characteristic_value() => {
                Ok(self.read(&desc.characteristic))
            }
            GattHandle::Descriptor(desc) => Ok(self.read_descriptor(desc)),
        }
    }

    /// Writes whatever the handle addresses. Descriptor writes resolve to
    /// `0`; they are always acknowledged but carry no response code.
    pub fn write_gatt(&self, handle: &GattHandle, write_type: WriteType, value: Vec<u8>)
                      -> Result<Operation<i32>> {
        match handle {
            GattHandle::Service(_) => Err(Error::InvalidHandle),
            GattHandle::Characteristic(ch) => Ok(self.write(ch, write_type, value)),
            GattHandle::Descriptor(desc) if desc.is_characteristic_value() => {
                Ok(self.write(&desc.characteristic, write_type, value))
            }
            GattHandle::Descriptor(desc) => {
                let session = self.session.clone();
                let id = self.id.clone();
                let handle = desc.clone();
                Ok(self.session.new_operation(move |op| async move {
                    match session.descriptor_write(&id, &handle, &value).await {
                        Ok(()) => op.succeed(0),
                        Err(err) => op.fail(err.to_string()),
                    }
                }))
            }
        }
    }

    /// [`set_notify`][Self::set_notify] for a flat handle. Only a
    /// characteristic (or its synthetic value handle) can be notified on.
    pub fn set_notify_gatt(&self, handle: &GattHandle, enable: bool) -> Result<Operation<()>> {
        match handle {
            GattHandle::Characteristic(ch) => Ok(self.set_notify(ch, enable)),
            GattHandle::Descriptor(desc) if desc.is_characteristic_value() => {
                Ok(self.set_notify(&desc.characteristic, enable))
            }
            _ => Err(Error::InvalidHandle),
        }
    }

    /// The observer for whatever value the handle addresses; a service has
    /// no value to observe.
    pub fn subscribe_gatt(&self, handle: &GattHandle) -> Result<Observer> {
        match handle {
            GattHandle::Service(_) => Err(Error::InvalidHandle),
            GattHandle::Characteristic(ch) => Ok(self.subscribe(ch)),
            GattHandle::Descriptor(desc) => Ok(self.subscribe_descriptor(desc)),
        }
    }

    /// [`cached_value`][Self::cached_value] for a flat handle.
    pub fn cached_value_gatt(&self, handle: &GattHandle) -> Option<Vec<u8>> {
        match handle {
            GattHandle::Service(_) => None,
            GattHandle::Characteristic(ch) => self.cached_value(&ch.value_handle()),
            GattHandle::Descriptor(desc) => self.cached_value(desc),
        }
    }

    /// Enables or disables peripheral-initiated value notifications for a
    /// characteristic. Incoming values are delivered to the observer for the
    /// characteristic's value handle (see [`subscribe`][Self::subscribe]).
    pub fn set_notify(&self, characteristic: &CharacteristicHandle, enable: bool)
                      -> Operation<()> {
        let session = self.session.clone();
        let id = self.id.clone();
        let handle = characteristic.clone();
        self.session.new_operation(move |op| async move {
            match session.characteristic_set_notify(&id, &handle, enable).await {
                Ok(()) => op.succeed(()),
                Err(err) => op.fail(err.to_string()),
            }
        })
    }

    /// Returns the observer for a characteristic's value, registering one if
    /// needed.
    ///
    /// This only wires up local delivery; pair it with
    /// [`set_notify`][Self::set_notify] to make the peripheral actually send
    /// notifications. The registration persists across reconnects.
    pub fn subscribe(&self, characteristic: &CharacteristicHandle) -> Observer {
        let state = self.session.get_device_state(&self.id);
        state.observers.get_or_create(&characteristic.value_handle())
    }

    /// Returns the observer for a descriptor value, registering one if
    /// needed.
    pub fn subscribe_descriptor(&self, descriptor: &DescriptorHandle) -> Observer {
        let state = self.session.get_device_state(&self.id);
        state.observers.get_or_create(descriptor)
    }

    /// The last value seen for a handle, from completed reads or incoming
    /// notifications. The value cache is kept across disconnects so this can
    /// serve stale data; a warning is logged when reading it while not
    /// connected.
    pub fn cached_value(&self, handle: &DescriptorHandle) -> Option<Vec<u8>> {
        let state = self.session.get_device_state(&self.id);
        {
            let guard = state.props.read().unwrap();
            if guard.state != ConnectionState::Connected {
                warn!("Reading cached value of {} for {} while not connected",
                      handle, self.id);
            }
        }
        state.values.get(handle).map(|value| value.clone())
    }
}

// Session-internal per-device state. Everything here is owned by the
// session's device index; app-facing Device objects never hold it directly.

#[derive(Clone, Debug)]
pub(crate) struct DeviceState {
    pub(crate) inner: Arc<DeviceShared>,
}
impl Deref for DeviceState {
    type Target = Arc<DeviceShared>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) id: DeviceId,

    // Note we use a std::sync RwLock instead of a tokio RwLock while
    // we don't really expect any significant contention and so we can
    // support a simpler, synchronous api for reading device properties
    // instead of needing to await for every property read
    pub(crate) props: StdRwLock<DeviceProps>,

    pub(crate) cache: GattCache,

    // Observer registrations and the value cache both outlive individual
    // connections
    pub(crate) observers: ObserverRegistry,
    pub(crate) values: DashMap<DescriptorHandle, Vec<u8>>,

    pub(crate) connect_op: StdMutex<Option<Operation<()>>>,
    pub(crate) disconnect_op: StdMutex<Option<Operation<()>>>,
    pub(crate) connect_timer: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
pub(crate) struct DeviceProps {
    pub(crate) name: Option<String>,
    pub(crate) rssi: Option<i16>,
    pub(crate) bond: BondState,

    pub(crate) state: ConnectionState,

    // Set once the GATT cache has been rebuilt for the current connection
    pub(crate) ready: bool,

    // Overrides the reason reported for the next disconnect transition;
    // used for locally requested disconnects and for forced disconnects
    // after a failed connection attempt
    pub(crate) pending_reason: Option<DisconnectReason>,
}

impl DeviceState {
    pub(crate) fn new(id: DeviceId) -> Self {
        Self {
            inner: Arc::new(DeviceShared {
                id,
                props: StdRwLock::new(DeviceProps { name: None,
                                                    rssi: None,
                                                    bond: BondState::NotBonded,
                                                    state: ConnectionState::Disconnected,
                                                    ready: false,
                                                    pending_reason: None }),
                cache: GattCache::new(),
                observers: ObserverRegistry::new(),
                values: DashMap::new(),
                connect_op: StdMutex::new(None),
                disconnect_op: StdMutex::new(None),
                connect_timer: StdMutex::new(None),
            }),
        }
    }
}

impl DeviceShared {
    pub(crate) fn check_ready(&self) -> Result<()> {
        let guard = self.props.read().unwrap();
        if guard.state == ConnectionState::Connected && guard.ready {
            Ok(())
        } else {
            Err(Error::DeviceNotConnected)
        }
    }

    /// Updates the value cache and notifies the registered observer for the
    /// handle, if there is one. Unobserved values are cached but otherwise
    /// dropped.
    pub(crate) fn store_value(&self,
                              handle: DescriptorHandle,
                              value: Vec<u8>,
                              dispatcher: &Dispatcher) {
        self.values.insert(handle.clone(), value.clone());
        if let Some(observer) = self.observers.lookup(&handle) {
            observer.notify(dispatcher, value);
        }
    }

    pub(crate) fn abort_connect_timer(&self) {
        if let Some(timer) = self.connect_timer.lock().unwrap().take() {
            timer.abort();
        }
    }
}
