//! Stable device identity and the policies that derive it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hotplug::PortInfo;

const USB_PREFIX: &str = "usb:";
const PATH_PREFIX: &str = "path:";

/// Key for a physical device across reconnects.
///
/// USB-derived identities (`usb:vvvv:pppp:serial`) survive a port path
/// change. Path-derived identities (`path:/dev/ttyUSB0`) are best-effort:
/// two boards swapped on the same port look identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_usb(vendor_id: u16, product_id: u16, serial: &str) -> Self {
        Self(format!(
            "{}{:04x}:{:04x}:{}",
            USB_PREFIX, vendor_id, product_id, serial
        ))
    }

    pub fn from_port_path(port_path: &str) -> Self {
        Self(format!("{}{}", PATH_PREFIX, port_path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_path_derived(&self) -> bool {
        self.0.starts_with(PATH_PREFIX)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Derives a [`DeviceIdentity`] from an observed port.
pub trait IdentityPolicy: Send + Sync + fmt::Debug {
    fn identify(&self, port: &PortInfo) -> DeviceIdentity;
}

/// Uses vendor id, product id and serial number when all are present,
/// otherwise falls back to the port path.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareSerialPolicy;

impl IdentityPolicy for HardwareSerialPolicy {
    fn identify(&self, port: &PortInfo) -> DeviceIdentity {
        let serial = port
            .serial_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        match (port.vendor_id, port.product_id, serial) {
            (Some(vid), Some(pid), Some(serial)) => DeviceIdentity::from_usb(vid, pid, serial),
            _ => DeviceIdentity::from_port_path(&port.port_path),
        }
    }
}

/// Always keys devices by port path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortPathPolicy;

impl IdentityPolicy for PortPathPolicy {
    fn identify(&self, port: &PortInfo) -> DeviceIdentity {
        DeviceIdentity::from_port_path(&port.port_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_port(path: &str, serial: Option<&str>) -> PortInfo {
        PortInfo {
            port_path: path.to_string(),
            vendor_id: Some(0x10c4),
            product_id: Some(0xea60),
            serial_number: serial.map(str::to_string),
        }
    }

    #[test]
    fn test_hardware_serial_identity() {
        let id = HardwareSerialPolicy.identify(&usb_port("/dev/ttyUSB0", Some("0001")));
        assert_eq!(id.as_str(), "usb:10c4:ea60:0001");
        assert!(!id.is_path_derived());
    }

    #[test]
    fn test_identity_stable_across_paths() {
        let a = HardwareSerialPolicy.identify(&usb_port("/dev/ttyUSB0", Some("0001")));
        let b = HardwareSerialPolicy.identify(&usb_port("/dev/ttyUSB3", Some("0001")));
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_or_blank_serial_falls_back_to_path() {
        let none = HardwareSerialPolicy.identify(&usb_port("/dev/ttyUSB0", None));
        let blank = HardwareSerialPolicy.identify(&usb_port("/dev/ttyUSB0", Some("   ")));
        assert_eq!(none.as_str(), "path:/dev/ttyUSB0");
        assert_eq!(none, blank);
        assert!(none.is_path_derived());
    }

    #[test]
    fn test_port_path_policy_ignores_serial() {
        let id = PortPathPolicy.identify(&usb_port("/dev/ttyACM1", Some("0001")));
        assert_eq!(id.as_str(), "path:/dev/ttyACM1");
    }

    #[test]
    fn test_identity_serializes_as_string() {
        let id = DeviceIdentity::from_port_path("/dev/ttyUSB0");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"path:/dev/ttyUSB0\"");
    }
}
