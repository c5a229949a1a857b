use std::sync::atomic::Ordering;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectBehaviour, FakeHost};
use crate::session::{BackendEvent, BackendSession, CharacteristicInfo, DescriptorInfo, Filter,
                     ServiceInfo};
use crate::{AdapterState, CharacteristicId, DescriptorId, DeviceId, Error, GattError, Result,
            ServiceId, WriteType};

/// Backend adapter between a session and a [`FakeHost`].
#[derive(Debug)]
pub struct FakeSession {
    host: FakeHost,
}

impl FakeSession {
    pub(crate) fn new(host: FakeHost, backend_bus: mpsc::UnboundedSender<BackendEvent>) -> Self {
        host.attach(backend_bus);
        Self { host }
    }

    fn device(&self, id: &DeviceId) -> Result<std::sync::Arc<super::FakeDevice>> {
        self.host
            .device(id)
            .ok_or_else(|| Error::Other(anyhow!("Unknown device {}", id)))
    }

    fn connected_device(&self, id: &DeviceId) -> Result<std::sync::Arc<super::FakeDevice>> {
        let device = self.device(id)?;
        if !device.connected.load(Ordering::SeqCst) {
            return Err(Error::DeviceNotConnected);
        }
        Ok(device)
    }
}

#[async_trait]
impl BackendSession for FakeSession {
    fn adapter_state(&self) -> AdapterState {
        self.host.adapter_state()
    }

    fn start_scanning(&self, _filter: &Filter) -> Result<()> {
        if self.host.adapter_state() != AdapterState::PoweredOn {
            return Err(Error::AdapterUnavailable);
        }
        self.host.set_scanning(true);
        Ok(())
    }

    fn stop_scanning(&self) -> Result<()> {
        self.host.set_scanning(false);
        Ok(())
    }

    async fn device_connect(&self, id: &DeviceId) -> Result<()> {
        if self.host.adapter_state() != AdapterState::PoweredOn {
            return Err(Error::AdapterUnavailable);
        }
        let device = self.device(id)?;
        self.host.count_connect_call();

        let behaviour = device.behaviour.lock().unwrap().clone();
        match behaviour {
            ConnectBehaviour::Instant => {
                device.connected.store(true, Ordering::SeqCst);
                self.host.emit(BackendEvent::DeviceConnected { id: id.clone() });
            }
            ConnectBehaviour::Manual => {
                device.pending_connect.store(true, Ordering::SeqCst);
            }
            ConnectBehaviour::Fail(error) => {
                self.host
                    .emit(BackendEvent::DeviceConnectFailed { id: id.clone(), error });
            }
        }
        Ok(())
    }

    async fn device_disconnect(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        let was_connected = device.connected.swap(false, Ordering::SeqCst);
        let was_pending = device.pending_connect.swap(false, Ordering::SeqCst);
        if !was_connected && !was_pending {
            return Err(Error::DeviceNotConnected);
        }
        device.subscriptions.clear();
        self.host.emit(BackendEvent::DeviceDisconnected { id: id.clone() });
        Ok(())
    }

    async fn gatt_services(&self, id: &DeviceId) -> Result<Vec<ServiceInfo>> {
        let device = self.connected_device(id)?;
        if device.fail_discovery.load(Ordering::SeqCst) {
            return Err(Error::GattProtocolError(GattError::GeneralFailure(
                "Service discovery failed".to_string(),
            )));
        }
        let profile = device.profile.lock().unwrap();
        Ok(profile.services
                  .iter()
                  .map(|service| ServiceInfo { id: service.id,
                                               uuid: service.uuid,
                                               primary: service.primary })
                  .collect())
    }

    async fn gatt_characteristics(&self, id: &DeviceId, service: ServiceId)
                                  -> Result<Vec<CharacteristicInfo>> {
        let device = self.connected_device(id)?;
        let profile = device.profile.lock().unwrap();
        let service = profile.services
                             .iter()
                             .find(|candidate| candidate.id == service)
                             .ok_or(Error::InvalidHandle)?;
        Ok(service.characteristics
                  .iter()
                  .map(|characteristic| CharacteristicInfo { id: characteristic.id,
                                                             uuid: characteristic.uuid,
                                                             properties:
                                                                 characteristic.properties })
                  .collect())
    }

    async fn gatt_descriptors(&self, id: &DeviceId, characteristic: CharacteristicId)
                              -> Result<Vec<DescriptorInfo>> {
        let device = self.connected_device(id)?;
        let characteristic = device.find_characteristic(characteristic)
                                   .ok_or(Error::InvalidHandle)?;
        Ok(characteristic.descriptors
                         .iter()
                         .map(|descriptor| DescriptorInfo { id: descriptor.id,
                                                            uuid: descriptor.uuid })
                         .collect())
    }

    async fn characteristic_read(&self, id: &DeviceId, characteristic: CharacteristicId)
                                 -> Result<Vec<u8>> {
        let device = self.connected_device(id)?;
        let characteristic = device.find_characteristic(characteristic)
                                   .ok_or(Error::InvalidHandle)?;
        Ok(characteristic.value)
    }

    async fn characteristic_write(&self, id: &DeviceId, characteristic: CharacteristicId,
                                  write_type: WriteType, value: &[u8])
                                  -> Result<i32> {
        let device = self.connected_device(id)?;
        let code = device.write_characteristic(characteristic, value)
                         .ok_or(Error::InvalidHandle)?;
        Ok(match write_type {
            WriteType::WithResponse => code,
            WriteType::WithoutResponse => 0,
        })
    }

    async fn characteristic_subscribe(&self, id: &DeviceId, characteristic: CharacteristicId)
                                      -> Result<()> {
        let device = self.connected_device(id)?;
        device.find_characteristic(characteristic)
              .ok_or(Error::InvalidHandle)?;
        device.subscriptions.insert(characteristic, ());
        Ok(())
    }

    async fn characteristic_unsubscribe(&self, id: &DeviceId, characteristic: CharacteristicId)
                                        -> Result<()> {
        let device = self.connected_device(id)?;
        device.subscriptions.remove(&characteristic);
        Ok(())
    }

    async fn descriptor_read(&self, id: &DeviceId, descriptor: DescriptorId) -> Result<Vec<u8>> {
        let device = self.connected_device(id)?;
        let descriptor = device.find_descriptor(descriptor).ok_or(Error::InvalidHandle)?;
        Ok(descriptor.value)
    }

    async fn descriptor_write(&self, id: &DeviceId, descriptor: DescriptorId, value: &[u8])
                              -> Result<()> {
        let device = self.connected_device(id)?;
        if !device.write_descriptor(descriptor, value) {
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }
}
