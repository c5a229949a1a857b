use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::uuid::short_uuid_string;
use crate::{Error, Result};

// Structural handles address GATT objects by uuid plus a sibling index
// instead of by native object reference.
//
// NB: we can't use a Uuid alone as a unique key since it's possible for
// devices to expose the same service (or the same characteristic within one
// service) multiple times. The index is assigned in discovery order during
// a cache rebuild, starting at 0 per repeated uuid at that level, so a
// handle is value-comparable, human-debuggable and derivable without any
// live cache.
//
// Handles remain stable for the lifetime of one connection. A reconnect
// rebuilds the cache and, if the device changed its GATT profile, handles
// acquired earlier may simply stop resolving.

/// Addresses one service on a device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub uuid: Uuid,
    pub index: u32,
}

impl ServiceHandle {
    pub fn new(uuid: Uuid, index: u32) -> Self {
        Self { uuid, index }
    }

    pub fn characteristic(&self, uuid: Uuid, index: u32) -> CharacteristicHandle {
        CharacteristicHandle::new(self.clone(), uuid, index)
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[{}]", short_uuid_string(&self.uuid), self.index)
    }
}

/// Addresses one characteristic within a service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    pub service: ServiceHandle,
    pub uuid: Uuid,
    pub index: u32,
}

impl CharacteristicHandle {
    pub fn new(service: ServiceHandle, uuid: Uuid, index: u32) -> Self {
        Self {
            service,
            uuid,
            index,
        }
    }

    pub fn descriptor(&self, uuid: Uuid, index: u32) -> DescriptorHandle {
        DescriptorHandle::new(self.clone(), uuid, index)
    }

    /// The synthetic descriptor handle that addresses this characteristic's
    /// own value, used for subscribing to characteristic-level notifications
    /// through the same observer mechanism as descriptors.
    pub fn value_handle(&self) -> DescriptorHandle {
        DescriptorHandle::value_of(self)
    }
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f,
               "{}/{}[{}]",
               self.service,
               short_uuid_string(&self.uuid),
               self.index)
    }
}

/// Addresses one descriptor within a characteristic.
///
/// A handle with `uuid: None` and `index: 0` is the reserved synthetic form
/// addressing the characteristic's own value (see
/// [`CharacteristicHandle::value_handle`]).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorHandle {
    pub characteristic: CharacteristicHandle,
    pub uuid: Option<Uuid>,
    pub index: u32,
}

impl DescriptorHandle {
    pub fn new(characteristic: CharacteristicHandle, uuid: Uuid, index: u32) -> Self {
        Self {
            characteristic,
            uuid: Some(uuid),
            index,
        }
    }

    pub fn value_of(characteristic: &CharacteristicHandle) -> Self {
        Self {
            characteristic: characteristic.clone(),
            uuid: None,
            index: 0,
        }
    }

    pub fn is_characteristic_value(&self) -> bool {
        self.uuid.is_none()
    }
}

impl fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.uuid {
            Some(uuid) => {
                write!(f,
                       "{}/{}[{}]",
                       self.characteristic,
                       short_uuid_string(uuid),
                       self.index)
            }
            None => write!(f, "{}/<value>", self.characteristic),
        }
    }
}

/// A flat union of the three structural handle types, for callers that want
/// to carry a single opaque handle (scripting layers, config files).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattHandle {
    Service(ServiceHandle),
    Characteristic(CharacteristicHandle),
    Descriptor(DescriptorHandle),
}

impl GattHandle {
    pub fn is_service(&self) -> bool {
        matches!(self, GattHandle::Service(_))
    }

    pub fn is_characteristic(&self) -> bool {
        matches!(self, GattHandle::Characteristic(_))
    }

    pub fn is_descriptor(&self) -> bool {
        matches!(self, GattHandle::Descriptor(_))
    }

    pub fn as_service(&self) -> Result<&ServiceHandle> {
        match self {
            GattHandle::Service(handle) => Ok(handle),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn as_characteristic(&self) -> Result<&CharacteristicHandle> {
        match self {
            GattHandle::Characteristic(handle) => Ok(handle),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn as_descriptor(&self) -> Result<&DescriptorHandle> {
        match self {
            GattHandle::Descriptor(handle) => Ok(handle),
            _ => Err(Error::InvalidHandle),
        }
    }
}

impl From<ServiceHandle> for GattHandle {
    fn from(handle: ServiceHandle) -> Self {
        GattHandle::Service(handle)
    }
}
impl From<CharacteristicHandle> for GattHandle {
    fn from(handle: CharacteristicHandle) -> Self {
        GattHandle::Characteristic(handle)
    }
}
impl From<DescriptorHandle> for GattHandle {
    fn from(handle: DescriptorHandle) -> Self {
        GattHandle::Descriptor(handle)
    }
}

impl fmt::Display for GattHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GattHandle::Service(handle) => write!(f, "{}", handle),
            GattHandle::Characteristic(handle) => write!(f, "{}", handle),
            GattHandle::Descriptor(handle) => write!(f, "{}", handle),
        }
    }
}
