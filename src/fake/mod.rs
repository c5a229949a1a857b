//! A scriptable in-process transport for testing and demos.
//!
//! A [`FakeHost`] models the radio side: the adapter, the peripherals in
//! range and their GATT profiles. Tests drive it directly (advertise a
//! device, complete a pending connect, push a value notification, drop a
//! connection) while a session talks to it through the regular backend
//! contract via [`session::FakeSession`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;

use dashmap::DashMap;
use log::trace;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::BackendEvent;
use crate::{AdapterState, Address, BondState, CharacteristicId, CharacteristicProperties,
            DescriptorId, DeviceId, ServiceId};

pub mod session;

fn next_attr_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// How the fake transport responds to a connect request.
#[derive(Clone, Debug)]
pub enum ConnectBehaviour {
    /// Report the connection immediately.
    Instant,
    /// Leave the connect pending until [`FakeHost::complete_connect`] is
    /// called; useful for exercising timeouts and cancellation.
    Manual,
    /// Accept the request, then report a native connect failure.
    Fail(String),
}

#[derive(Clone, Debug, Default)]
pub struct FakeProfile {
    pub(crate) services: Vec<FakeService>,
}

impl FakeProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: FakeService) -> Self {
        self.services.push(service);
        self
    }
}

#[derive(Clone, Debug)]
pub struct FakeService {
    pub(crate) id: ServiceId,
    pub(crate) uuid: Uuid,
    pub(crate) primary: bool,
    pub(crate) characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    pub fn primary(uuid: Uuid) -> Self {
        Self { id: ServiceId(next_attr_id()),
               uuid,
               primary: true,
               characteristics: Vec::new() }
    }

    pub fn secondary(uuid: Uuid) -> Self {
        Self { primary: false, ..Self::primary(uuid) }
    }

    pub fn with_characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }
}

#[derive(Clone, Debug)]
pub struct FakeCharacteristic {
    pub(crate) id: CharacteristicId,
    pub(crate) uuid: Uuid,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) value: Vec<u8>,
    pub(crate) write_response: i32,
    pub(crate) descriptors: Vec<FakeDescriptor>,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { id: CharacteristicId(next_attr_id()),
               uuid,
               properties,
               value: Vec::new(),
               write_response: 0,
               descriptors: Vec::new() }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    /// Scripts the response code reported for acknowledged writes.
    pub fn with_write_response(mut self, code: i32) -> Self {
        self.write_response = code;
        self
    }

    pub fn with_descriptor(mut self, descriptor: FakeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// The transport-level attribute id, for driving notifications through
    /// [`FakeHost::notify`].
    pub fn id(&self) -> CharacteristicId {
        self.id
    }
}

#[derive(Clone, Debug)]
pub struct FakeDescriptor {
    pub(crate) id: DescriptorId,
    pub(crate) uuid: Uuid,
    pub(crate) value: Vec<u8>,
}

impl FakeDescriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self { id: DescriptorId(next_attr_id()),
               uuid,
               value: Vec::new() }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }
}

#[derive(Debug)]
pub(crate) struct FakeDevice {
    pub(crate) name: StdMutex<String>,
    pub(crate) profile: StdMutex<FakeProfile>,
    pub(crate) behaviour: StdMutex<ConnectBehaviour>,
    pub(crate) connected: AtomicBool,
    pub(crate) pending_connect: AtomicBool,
    pub(crate) fail_discovery: AtomicBool,
    pub(crate) subscriptions: DashMap<CharacteristicId, ()>,
}

impl FakeDevice {
    pub(crate) fn find_characteristic(&self, id: CharacteristicId)
                                      -> Option<FakeCharacteristic> {
        let profile = self.profile.lock().unwrap();
        profile.services
               .iter()
               .flat_map(|service| service.characteristics.iter())
               .find(|characteristic| characteristic.id == id)
               .cloned()
    }

    /// Stores the value and returns the scripted response code, or `None`
    /// for an unknown attribute.
    pub(crate) fn write_characteristic(&self, id: CharacteristicId, value: &[u8])
                                       -> Option<i32> {
        let mut profile = self.profile.lock().unwrap();
        for service in profile.services.iter_mut() {
            for characteristic in service.characteristics.iter_mut() {
                if characteristic.id == id {
                    characteristic.value = value.to_vec();
                    return Some(characteristic.write_response);
                }
            }
        }
        None
    }

    pub(crate) fn find_descriptor(&self, id: DescriptorId) -> Option<FakeDescriptor> {
        let profile = self.profile.lock().unwrap();
        profile.services
               .iter()
               .flat_map(|service| service.characteristics.iter())
               .flat_map(|characteristic| characteristic.descriptors.iter())
               .find(|descriptor| descriptor.id == id)
               .cloned()
    }

    pub(crate) fn write_descriptor(&self, id: DescriptorId, value: &[u8]) -> bool {
        let mut profile = self.profile.lock().unwrap();
        for service in profile.services.iter_mut() {
            for characteristic in service.characteristics.iter_mut() {
                for descriptor in characteristic.descriptors.iter_mut() {
                    if descriptor.id == id {
                        descriptor.value = value.to_vec();
                        return true;
                    }
                }
            }
        }
        false
    }
}

#[derive(Debug)]
struct HostInner {
    adapter_state: StdRwLock<AdapterState>,
    scanning: AtomicBool,
    devices: DashMap<DeviceId, Arc<FakeDevice>>,
    events: StdMutex<Option<mpsc::UnboundedSender<BackendEvent>>>,
    connect_calls: AtomicU32,
}

/// The radio side of the fake transport. Cheap to clone; all clones share
/// state, so a test keeps one while a session drives another.
#[derive(Clone, Debug)]
pub struct FakeHost {
    inner: Arc<HostInner>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self { inner: Arc::new(HostInner { adapter_state:
                                               StdRwLock::new(AdapterState::PoweredOn),
                                           scanning: AtomicBool::new(false),
                                           devices: DashMap::new(),
                                           events: StdMutex::new(None),
                                           connect_calls: AtomicU32::new(0) }) }
    }

    pub(crate) fn attach(&self, backend_bus: mpsc::UnboundedSender<BackendEvent>) {
        *self.inner.events.lock().unwrap() = Some(backend_bus);
    }

    pub(crate) fn emit(&self, event: BackendEvent) {
        let events = self.inner.events.lock().unwrap();
        match events.as_ref() {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => trace!("Dropping fake backend event; no session attached"),
        }
    }

    pub(crate) fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter_state.read().unwrap()
    }

    pub(crate) fn device(&self, id: &DeviceId) -> Option<Arc<FakeDevice>> {
        self.inner.devices.get(id).map(|device| device.clone())
    }

    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.inner.scanning.store(scanning, Ordering::SeqCst);
    }

    pub(crate) fn count_connect_call(&self) {
        self.inner.connect_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Puts a peripheral in range.
    pub fn add_device(&self, address: Address, name: impl Into<String>, profile: FakeProfile)
                      -> DeviceId {
        let id = DeviceId::from(address);
        self.inner.devices.insert(id.clone(),
                                  Arc::new(FakeDevice {
                                      name: StdMutex::new(name.into()),
                                      profile: StdMutex::new(profile),
                                      behaviour: StdMutex::new(ConnectBehaviour::Instant),
                                      connected: AtomicBool::new(false),
                                      pending_connect: AtomicBool::new(false),
                                      fail_discovery: AtomicBool::new(false),
                                      subscriptions: DashMap::new(),
                                  }));
        id
    }

    pub fn set_connect_behaviour(&self, id: &DeviceId, behaviour: ConnectBehaviour) {
        if let Some(device) = self.device(id) {
            *device.behaviour.lock().unwrap() = behaviour;
        }
    }

    /// Swaps the device's GATT profile; takes effect on the next connection.
    pub fn set_profile(&self, id: &DeviceId, profile: FakeProfile) {
        if let Some(device) = self.device(id) {
            *device.profile.lock().unwrap() = profile;
        }
    }

    /// Makes service discovery fail for the device, to exercise the
    /// connection teardown path.
    pub fn set_discovery_failure(&self, id: &DeviceId, fail: bool) {
        if let Some(device) = self.device(id) {
            device.fail_discovery.store(fail, Ordering::SeqCst);
        }
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.inner.adapter_state.write().unwrap() = state;
        self.emit(BackendEvent::AdapterStateChanged { state });
    }

    /// Reports an advertisement for the device, as seen while scanning.
    pub fn advertise(&self, id: &DeviceId, rssi: i16) {
        if let Some(device) = self.device(id) {
            let name = device.name.lock().unwrap().clone();
            self.emit(BackendEvent::DeviceFound { id: id.clone(),
                                                  name: Some(name),
                                                  rssi: Some(rssi),
                                                  state_change_only: false });
        }
    }

    /// Completes a connect left pending by [`ConnectBehaviour::Manual`].
    pub fn complete_connect(&self, id: &DeviceId) {
        if let Some(device) = self.device(id) {
            if device.pending_connect.swap(false, Ordering::SeqCst) {
                device.connected.store(true, Ordering::SeqCst);
                self.emit(BackendEvent::DeviceConnected { id: id.clone() });
            }
        }
    }

    /// Drops an established connection from the peripheral side.
    pub fn drop_connection(&self, id: &DeviceId) {
        if let Some(device) = self.device(id) {
            if device.connected.swap(false, Ordering::SeqCst) {
                device.subscriptions.clear();
                self.emit(BackendEvent::DeviceConnectionLost { id: id.clone() });
            }
        }
    }

    /// Pushes a peripheral-initiated value notification.
    pub fn notify(&self, id: &DeviceId, characteristic: CharacteristicId, value: Vec<u8>) {
        self.emit(BackendEvent::CharacteristicValueChanged { id: id.clone(),
                                                             characteristic,
                                                             value });
    }

    pub fn set_limited(&self, id: &DeviceId) {
        self.emit(BackendEvent::DeviceLimited { id: id.clone() });
    }

    pub fn set_bond_state(&self, id: &DeviceId, bond: BondState) {
        self.emit(BackendEvent::DeviceBondChanged { id: id.clone(), bond });
    }

    pub fn connect_calls(&self) -> u32 {
        self.inner.connect_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.device(id)
            .map(|device| device.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self, id: &DeviceId, characteristic: CharacteristicId) -> bool {
        self.device(id)
            .map(|device| device.subscriptions.contains_key(&characteristic))
            .unwrap_or(false)
    }
}
