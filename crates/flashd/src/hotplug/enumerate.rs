//! Serial port enumeration.

use std::path::Path;

use serialport::SerialPortType;

use super::PortInfo;
use crate::error::HotplugError;

/// One-shot listing of the currently attached serial ports.
pub trait PortEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<PortInfo>, HotplugError>;
}

/// Lists ports through `serialport::available_ports`, keeping only those
/// whose file name matches one of the configured glob patterns.
pub struct SerialPortEnumerator {
    patterns: Vec<glob::Pattern>,
}

impl SerialPortEnumerator {
    pub fn new(patterns: &[String]) -> Result<Self, HotplugError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| HotplugError::Pattern {
                    pattern: p.clone(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Matches on the final path component, so `ttyUSB*` accepts `/dev/ttyUSB0`.
    pub fn matches(&self, port_path: &str) -> bool {
        let name = Path::new(port_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(port_path);
        self.patterns.iter().any(|p| p.matches(name))
    }
}

impl PortEnumerator for SerialPortEnumerator {
    fn enumerate(&self) -> Result<Vec<PortInfo>, HotplugError> {
        let ports = serialport::available_ports()?;
        let mut found: Vec<PortInfo> = ports
            .into_iter()
            .filter(|p| self.matches(&p.port_name))
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    port_path: p.port_name,
                    vendor_id: Some(usb.vid),
                    product_id: Some(usb.pid),
                    serial_number: usb.serial_number,
                },
                _ => PortInfo::from_path(p.port_name),
            })
            .collect();
        found.sort_by(|a, b| a.port_path.cmp(&b.port_path));
        Ok(found)
    }
}
