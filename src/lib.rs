//! A Bluetooth Low Energy (central role) GATT session engine.
//!
//! The crate tracks per-device connection state through an explicit state
//! machine, rebuilds a cache of GATT objects on every successful connection
//! and lets applications address services, characteristics and descriptors
//! through *structural handles* (UUID + sibling index) instead of transient
//! native object references. All externally initiated actions (scanning,
//! connecting, reads, writes, notification config) are surfaced through a
//! single-use [`Operation`] wrapper that reports completion exactly once.
//!
//! The actual radio transport is pluggable: a backend implements the
//! [`session::BackendSession`] capability trait and feeds
//! [`session::BackendEvent`]s into the session. A scriptable fake backend is
//! included for testing (see the [`fake`] module).

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

pub mod dispatch;
pub mod handle;
pub mod observer;
pub mod operation;

mod cache;

pub mod device;
pub use device::Device;

pub mod session;
pub use session::{Session, SessionConfig};

pub mod fake;

pub use handle::{CharacteristicHandle, DescriptorHandle, GattHandle, ServiceHandle};
pub use observer::Observer;
pub use operation::Operation;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(pub(crate) u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A transport-level address for Bluetooth devices
///
/// The underlying hardware MAC address is directly exposed on backends where
/// this is supported.
///
/// An address can be serialized/deserialized such that it's possible for
/// applications to save the address of a known device and later connect
/// back to the same device without having to re-scan
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// XXX: should maybe return Result if made public somehow but we don't
// really want any allocations in the 'error' path considering that a valid
// address might not be a MAC address.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if s.contains(':') {
        let mut parts = ArrayVec::<_, 6>::new();
        for part in s.split(':') {
            if let Err(_e) = parts.try_push(part) {
                return None;
            }
        }
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 8];
        for i in 0..6 {
            bytes[i] = match u8::from_str_radix(parts[i], 16) {
                Ok(v) => v,
                Err(_e) => {
                    return None;
                }
            };
        }
        Some(u64::from_le_bytes(bytes))
    } else {
        None
    }
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

/// Stable identity for a device, derived deterministically from its
/// transport [`Address`].
///
/// Unlike native device object references a `DeviceId` is value-comparable
/// and remains meaningful across connections and across process runs.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeviceId(Address);

impl DeviceId {
    pub fn address(&self) -> &Address {
        &self.0
    }
}
impl From<Address> for DeviceId {
    fn from(address: Address) -> Self {
        DeviceId(address)
    }
}
impl FromStr for DeviceId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        Ok(DeviceId(Address::from_str(s)?))
    }
}
impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceId({:?})", self.0)
    }
}

/// Global state of the Bluetooth transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    /// No usable adapter was found. Operations that need the adapter fail
    /// fast rather than hanging.
    Unavailable,
}

/// Connection lifecycle state of a [`Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Platform-specific constrained state; treated as connectable, the same
    /// as `Disconnected`.
    Limited,
}

impl ConnectionState {
    pub fn is_connectable(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Limited)
    }
}

/// Why a device transitioned into `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A locally requested disconnect completed.
    Disconnected,
    /// The peripheral dropped the connection.
    ConnectionLost,
    /// A connection attempt failed (native error, timeout or GATT cache
    /// rebuild failure).
    ConnectError,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Disconnected => "disconnected",
            DisconnectReason::ConnectionLost => "connection_lost",
            DisconnectReason::ConnectError => "connect_error",
        }
    }
}

/// Bonding state as reported by the backend. The engine only tracks this;
/// pairing itself is a backend concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondState {
    NotBonded,
    Bonding,
    Bonded,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceProperty {
    Name,
    Rssi,
    Bond,
}

/// Backend-assigned attribute id for a service.
///
/// These ids are the backend's own stable references for live GATT objects
/// within one connection. They are never handed to applications; the
/// session resolves structural handles to them through the per-device GATT
/// cache, which is rebuilt on every successful connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

/// Backend-assigned attribute id for a characteristic. See [`ServiceId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId(pub u64);

/// Backend-assigned attribute id for a descriptor. See [`ServiceId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(pub u64);

/// Whether a characteristic write should wait for the peripheral to
/// acknowledge. The characteristic must carry the matching property flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

bitflags::bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No usable Bluetooth adapter is available")]
    AdapterUnavailable,

    #[error("The device is not connected")]
    DeviceNotConnected,

    #[error("The device is not in a connectable state")]
    DeviceNotConnectable,

    #[error("No GATT object matches the given handle")]
    InvalidHandle,

    #[error("The target doesn't support this request / operation")]
    Unsupported,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("GATT protocol error: {0}")]
    GattProtocolError(#[from] GattError),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Session-level events, delivered through [`Session::events`].
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    #[non_exhaustive]
    AdapterStateChanged { state: AdapterState },

    ScanStarted,
    ScanStopped,

    /// A device advertisement was seen while scanning. `state_change_only`
    /// is set when the advertisement only reflects a state change for an
    /// already known device.
    #[non_exhaustive]
    DeviceFound {
        device: Device,
        state_change_only: bool,
    },

    /// The device is connected *and* its GATT cache has been rebuilt;
    /// structural handles resolve from this point on.
    ///
    /// Note that a reconnect may change the set of available services, in
    /// which case handles from a previous connection may no longer resolve
    /// and should be reacquired.
    #[non_exhaustive]
    DeviceConnected { device: Device },

    #[non_exhaustive]
    DeviceDisconnected {
        device: Device,
        reason: DisconnectReason,
    },

    #[non_exhaustive]
    DevicePropertyChanged {
        device: Device,
        property: DeviceProperty,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_two_way() {
        let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
        assert!(matches!(addr, Address::MAC(_)));
        let str = addr.to_string();
        // Note: we are also intentionally checking that we format the address
        // octets as uppercase considering that some platforms are very
        // particular about this when parsing address strings.
        assert_eq!(str, "F1:E2:D3:C4:B5:A6");

        let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
        assert!(matches!(addr, Address::String(_)));
        let str = addr.to_string();
        assert_eq!(str, "18c2a267-a539-4423-aecc-edeeb2784bcc");
    }

    #[test]
    fn device_id_from_address_is_deterministic() {
        let a: DeviceId = "F1:E2:D3:C4:B5:A6".parse().unwrap();
        let b: DeviceId = "F1:E2:D3:C4:B5:A6".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "F1:E2:D3:C4:B5:A6");
    }

    #[test]
    fn connectable_states() {
        assert!(ConnectionState::Disconnected.is_connectable());
        assert!(ConnectionState::Limited.is_connectable());
        assert!(!ConnectionState::Connecting.is_connectable());
        assert!(!ConnectionState::Connected.is_connectable());
    }
}
