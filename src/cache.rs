use std::collections::HashMap;

use dashmap::DashMap;
use log::trace;
use uuid::Uuid;

use crate::handle::{CharacteristicHandle, DescriptorHandle, ServiceHandle};
use crate::session::BackendSession;
use crate::{CharacteristicId, CharacteristicProperties, DescriptorId, DeviceId};
use crate::{Error, Result, ServiceId};

// The per-device mapping between structural handles and the backend's live
// attribute ids for the current connection. Rebuilt from scratch on every
// successful connection (a device may expose a different GATT profile each
// time), cleared wholesale on disconnect.

#[derive(Clone, Debug)]
pub(crate) struct ServiceEntry {
    pub(crate) id: ServiceId,
    pub(crate) primary: bool,
    pub(crate) position: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct CharacteristicEntry {
    pub(crate) id: CharacteristicId,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) position: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct DescriptorEntry {
    pub(crate) id: DescriptorId,
    pub(crate) position: u32,
}

#[derive(Debug)]
pub(crate) struct GattCache {
    services: DashMap<ServiceHandle, ServiceEntry>,
    characteristics: DashMap<CharacteristicHandle, CharacteristicEntry>,
    descriptors: DashMap<DescriptorHandle, DescriptorEntry>,

    // Reverse mapping used to route value-change notifications from the
    // backend (which only knows its own attribute ids) back to a handle
    characteristics_by_id: DashMap<CharacteristicId, CharacteristicHandle>,
}

// Indices disambiguate repeated uuids among siblings: the first occurrence
// of a uuid at a given level gets index 0, the next gets 1 and so on, in
// discovery order. Counters reset per parent.
fn next_index(counters: &mut HashMap<Uuid, u32>, uuid: Uuid) -> u32 {
    let counter = counters.entry(uuid).or_insert(0);
    let index = *counter;
    *counter += 1;
    index
}

impl GattCache {
    pub(crate) fn new() -> Self {
        Self {
            services: DashMap::new(),
            characteristics: DashMap::new(),
            descriptors: DashMap::new(),
            characteristics_by_id: DashMap::new(),
        }
    }

    /// Discovers the device's full GATT profile depth first and replaces the
    /// cache contents with it. On any discovery failure the cache is left
    /// empty rather than partially populated.
    pub(crate) async fn rebuild(&self,
                                backend: &dyn BackendSession,
                                device: &DeviceId)
                                -> Result<()> {
        self.clear();
        if let Err(err) = self.populate(backend, device).await {
            self.clear();
            return Err(err);
        }
        trace!("Rebuilt GATT cache for {}: {} services, {} characteristics, {} descriptors",
               device,
               self.services.len(),
               self.characteristics.len(),
               self.descriptors.len());
        Ok(())
    }

    async fn populate(&self, backend: &dyn BackendSession, device: &DeviceId) -> Result<()> {
        let services = backend.gatt_services(device).await?;

        let mut service_counters = HashMap::new();
        for (position, service) in services.into_iter().enumerate() {
            let index = next_index(&mut service_counters, service.uuid);
            let service_handle = ServiceHandle::new(service.uuid, index);
            self.services.insert(service_handle.clone(),
                                 ServiceEntry { id: service.id,
                                                primary: service.primary,
                                                position: position as u32 });

            let characteristics = backend.gatt_characteristics(device, service.id).await?;
            let mut characteristic_counters = HashMap::new();
            for (position, characteristic) in characteristics.into_iter().enumerate() {
                let index = next_index(&mut characteristic_counters, characteristic.uuid);
                let characteristic_handle =
                    service_handle.characteristic(characteristic.uuid, index);
                self.characteristics
                    .insert(characteristic_handle.clone(),
                            CharacteristicEntry { id: characteristic.id,
                                                  properties: characteristic.properties,
                                                  position: position as u32 });
                self.characteristics_by_id
                    .insert(characteristic.id, characteristic_handle.clone());

                let descriptors = backend.gatt_descriptors(device, characteristic.id).await?;
                let mut descriptor_counters = HashMap::new();
                for (position, descriptor) in descriptors.into_iter().enumerate() {
                    let index = next_index(&mut descriptor_counters, descriptor.uuid);
                    let descriptor_handle =
                        characteristic_handle.descriptor(descriptor.uuid, index);
                    self.descriptors.insert(descriptor_handle,
                                            DescriptorEntry { id: descriptor.id,
                                                              position: position as u32 });
                }
            }
        }

        Ok(())
    }

    pub(crate) fn clear(&self) {
        self.services.clear();
        self.characteristics.clear();
        self.descriptors.clear();
        self.characteristics_by_id.clear();
    }

    pub(crate) fn resolve_service(&self, handle: &ServiceHandle) -> Result<ServiceId> {
        self.services
            .get(handle)
            .map(|entry| entry.id)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn resolve_characteristic(&self,
                                         handle: &CharacteristicHandle)
                                         -> Result<CharacteristicId> {
        self.characteristics
            .get(handle)
            .map(|entry| entry.id)
            .ok_or(Error::InvalidHandle)
    }

    /// Resolves a real descriptor handle. The synthetic characteristic-value
    /// form has no backend descriptor behind it and doesn't resolve here.
    pub(crate) fn resolve_descriptor(&self, handle: &DescriptorHandle) -> Result<DescriptorId> {
        if handle.is_characteristic_value() {
            return Err(Error::InvalidHandle);
        }
        self.descriptors
            .get(handle)
            .map(|entry| entry.id)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn characteristic_properties(&self,
                                            handle: &CharacteristicHandle)
                                            -> Result<CharacteristicProperties> {
        self.characteristics
            .get(handle)
            .map(|entry| entry.properties)
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn characteristic_by_id(&self,
                                       id: CharacteristicId)
                                       -> Option<CharacteristicHandle> {
        self.characteristics_by_id
            .get(&id)
            .map(|handle| handle.clone())
    }

    /// All services in discovery order.
    pub(crate) fn services(&self) -> Vec<ServiceHandle> {
        let mut services: Vec<_> = self.services
                                       .iter()
                                       .map(|kv| (kv.value().position, kv.key().clone()))
                                       .collect();
        services.sort_by_key(|(position, _)| *position);
        services.into_iter().map(|(_, handle)| handle).collect()
    }

    /// The characteristics of one service, in discovery order.
    pub(crate) fn characteristics(&self, service: &ServiceHandle) -> Vec<CharacteristicHandle> {
        let mut characteristics: Vec<_> =
            self.characteristics
                .iter()
                .filter(|kv| &kv.key().service == service)
                .map(|kv| (kv.value().position, kv.key().clone()))
                .collect();
        characteristics.sort_by_key(|(position, _)| *position);
        characteristics.into_iter()
                       .map(|(_, handle)| handle)
                       .collect()
    }

    /// The descriptors of one characteristic, in discovery order.
    pub(crate) fn descriptors(&self, characteristic: &CharacteristicHandle)
                              -> Vec<DescriptorHandle> {
        let mut descriptors: Vec<_> =
            self.descriptors
                .iter()
                .filter(|kv| &kv.key().characteristic == characteristic)
                .map(|kv| (kv.value().position, kv.key().clone()))
                .collect();
        descriptors.sort_by_key(|(position, _)| *position);
        descriptors.into_iter().map(|(_, handle)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CharacteristicInfo, DescriptorInfo, ServiceInfo};
    use crate::uuid::uuid_from_u16;
    use crate::{AdapterState, WriteType};
    use async_trait::async_trait;
    use std::str::FromStr;

    #[derive(Debug, Default)]
    struct StubBackend {
        services: Vec<ServiceInfo>,
        characteristics: HashMap<ServiceId, Vec<CharacteristicInfo>>,
        descriptors: HashMap<CharacteristicId, Vec<DescriptorInfo>>,
        fail_descriptors: bool,
    }

    #[async_trait]
    impl BackendSession for StubBackend {
        fn adapter_state(&self) -> AdapterState {
            AdapterState::PoweredOn
        }
        fn start_scanning(&self, _filter: &crate::session::Filter) -> Result<()> {
            Err(Error::Unsupported)
        }
        fn stop_scanning(&self) -> Result<()> {
            Err(Error::Unsupported)
        }
        async fn device_connect(&self, _device: &DeviceId) -> Result<()> {
            Err(Error::Unsupported)
        }
        async fn device_disconnect(&self, _device: &DeviceId) -> Result<()> {
            Err(Error::Unsupported)
        }
        async fn gatt_services(&self, _device: &DeviceId) -> Result<Vec<ServiceInfo>> {
            Ok(self.services.clone())
        }
        async fn gatt_characteristics(&self, _device: &DeviceId, service: ServiceId)
                                      -> Result<Vec<CharacteristicInfo>> {
            Ok(self.characteristics.get(&service).cloned().unwrap_or_default())
        }
        async fn gatt_descriptors(&self, _device: &DeviceId, characteristic: CharacteristicId)
                                  -> Result<Vec<DescriptorInfo>> {
            if self.fail_descriptors {
                return Err(Error::GattProtocolError(crate::GattError::GeneralFailure(
                    "descriptor discovery failed".to_string(),
                )));
            }
            Ok(self.descriptors
                   .get(&characteristic)
                   .cloned()
                   .unwrap_or_default())
        }
        async fn characteristic_read(&self, _device: &DeviceId, _id: CharacteristicId)
                                     -> Result<Vec<u8>> {
            Err(Error::Unsupported)
        }
        async fn characteristic_write(&self, _device: &DeviceId, _id: CharacteristicId,
                                      _write_type: WriteType, _value: &[u8])
                                      -> Result<i32> {
            Err(Error::Unsupported)
        }
        async fn characteristic_subscribe(&self, _device: &DeviceId, _id: CharacteristicId)
                                          -> Result<()> {
            Err(Error::Unsupported)
        }
        async fn characteristic_unsubscribe(&self, _device: &DeviceId, _id: CharacteristicId)
                                            -> Result<()> {
            Err(Error::Unsupported)
        }
        async fn descriptor_read(&self, _device: &DeviceId, _id: DescriptorId) -> Result<Vec<u8>> {
            Err(Error::Unsupported)
        }
        async fn descriptor_write(&self, _device: &DeviceId, _id: DescriptorId, _value: &[u8])
                                  -> Result<()> {
            Err(Error::Unsupported)
        }
    }

    fn device_id() -> DeviceId {
        DeviceId::from_str("F1:E2:D3:C4:B5:A6").unwrap()
    }

    fn service(id: u64, uuid: u16) -> ServiceInfo {
        ServiceInfo { id: ServiceId(id),
                      uuid: uuid_from_u16(uuid),
                      primary: true }
    }

    fn characteristic(id: u64, uuid: u16) -> CharacteristicInfo {
        CharacteristicInfo { id: CharacteristicId(id),
                             uuid: uuid_from_u16(uuid),
                             properties: CharacteristicProperties::READ }
    }

    #[tokio::test]
    async fn duplicate_service_uuids_get_increasing_indices() {
        // Two instances of the Device Information service, back to back.
        let mut backend = StubBackend::default();
        backend.services = vec![service(1, 0x180A), service(2, 0x180A), service(3, 0x180D)];

        let cache = GattCache::new();
        cache.rebuild(&backend, &device_id()).await.unwrap();

        let first = ServiceHandle::new(uuid_from_u16(0x180A), 0);
        let second = ServiceHandle::new(uuid_from_u16(0x180A), 1);
        let third = ServiceHandle::new(uuid_from_u16(0x180D), 0);
        assert_eq!(cache.resolve_service(&first).unwrap(), ServiceId(1));
        assert_eq!(cache.resolve_service(&second).unwrap(), ServiceId(2));
        assert_eq!(cache.resolve_service(&third).unwrap(), ServiceId(3));
        assert_eq!(cache.services(), vec![first, second, third]);
    }

    #[tokio::test]
    async fn duplicate_counters_reset_per_parent() {
        // Both services expose a characteristic with the same uuid; each
        // must be index 0 within its own parent.
        let mut backend = StubBackend::default();
        backend.services = vec![service(1, 0x180A), service(2, 0x180D)];
        backend.characteristics
               .insert(ServiceId(1), vec![characteristic(10, 0x2A29)]);
        backend.characteristics
               .insert(ServiceId(2), vec![characteristic(20, 0x2A29), characteristic(21, 0x2A29)]);

        let cache = GattCache::new();
        cache.rebuild(&backend, &device_id()).await.unwrap();

        let first_parent = ServiceHandle::new(uuid_from_u16(0x180A), 0)
            .characteristic(uuid_from_u16(0x2A29), 0);
        let second_parent = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A29), 0);
        let second_parent_dup = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A29), 1);

        assert_eq!(cache.resolve_characteristic(&first_parent).unwrap(),
                   CharacteristicId(10));
        assert_eq!(cache.resolve_characteristic(&second_parent).unwrap(),
                   CharacteristicId(20));
        assert_eq!(cache.resolve_characteristic(&second_parent_dup).unwrap(),
                   CharacteristicId(21));
    }

    #[tokio::test]
    async fn notification_routing_uses_the_reverse_map() {
        let mut backend = StubBackend::default();
        backend.services = vec![service(1, 0x180D)];
        backend.characteristics
               .insert(ServiceId(1), vec![characteristic(10, 0x2A37)]);

        let cache = GattCache::new();
        cache.rebuild(&backend, &device_id()).await.unwrap();

        let expected = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        assert_eq!(cache.characteristic_by_id(CharacteristicId(10)),
                   Some(expected));
        assert_eq!(cache.characteristic_by_id(CharacteristicId(99)), None);
    }

    #[tokio::test]
    async fn failed_rebuild_leaves_the_cache_empty() {
        let mut backend = StubBackend::default();
        backend.services = vec![service(1, 0x180A)];
        backend.characteristics
               .insert(ServiceId(1), vec![characteristic(10, 0x2A29)]);
        backend.fail_descriptors = true;

        let cache = GattCache::new();
        assert!(cache.rebuild(&backend, &device_id()).await.is_err());

        assert!(cache.services().is_empty());
        let handle = ServiceHandle::new(uuid_from_u16(0x180A), 0);
        assert!(matches!(cache.resolve_service(&handle), Err(Error::InvalidHandle)));
        assert_eq!(cache.characteristic_by_id(CharacteristicId(10)), None);
    }

    #[tokio::test]
    async fn synthetic_value_handles_never_resolve_as_descriptors() {
        let mut backend = StubBackend::default();
        backend.services = vec![service(1, 0x180D)];
        backend.characteristics
               .insert(ServiceId(1), vec![characteristic(10, 0x2A37)]);
        backend.descriptors
               .insert(CharacteristicId(10),
                       vec![DescriptorInfo { id: DescriptorId(100),
                                             uuid: uuid_from_u16(0x2902) }]);

        let cache = GattCache::new();
        cache.rebuild(&backend, &device_id()).await.unwrap();

        let ch = ServiceHandle::new(uuid_from_u16(0x180D), 0)
            .characteristic(uuid_from_u16(0x2A37), 0);
        assert_eq!(cache.resolve_descriptor(&ch.descriptor(uuid_from_u16(0x2902), 0))
                        .unwrap(),
                   DescriptorId(100));
        assert!(matches!(cache.resolve_descriptor(&ch.value_handle()),
                         Err(Error::InvalidHandle)));
    }
}
