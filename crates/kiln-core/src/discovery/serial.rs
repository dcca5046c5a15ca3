//! Serial port enumeration through `tokio-serial`.

use super::PortEnumerator;
use crate::{Error, Result};
use kiln_types::Port;
use regex::Regex;
use tokio_serial::{SerialPortInfo, SerialPortType};
use tracing::{trace, warn};

/// Board-style device names that may lack USB information
const DEVICE_PATTERN: &str = r"(^|/)(ttyACM\d+|ttyUSB\d+|cu\.usbmodem.+|cu\.usbserial.+)$";

/// Lists the host's serial ports.
///
/// USB ports are always reported with their vendor and product ids. Other
/// ports are kept only when their name looks like a board's, so on-board
/// UARTs and Bluetooth devices stay out of the list.
#[derive(Debug, Clone)]
pub struct SerialPortEnumerator {
    pattern: Option<Regex>,
}

impl Default for SerialPortEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPortEnumerator {
    #[must_use]
    pub fn new() -> Self {
        let pattern = Regex::new(DEVICE_PATTERN)
            .inspect_err(|e| warn!("Invalid serial device pattern: {}", e))
            .ok();
        Self { pattern }
    }

    fn to_port(&self, info: SerialPortInfo) -> Option<Port> {
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let mut port = Port::serial(info.port_name)
                    .with_usb_id(&format!("{:04x}", usb.vid), &format!("{:04x}", usb.pid));
                if let Some(serial) = usb.serial_number.filter(|s| !s.is_empty()) {
                    port.properties.insert("serialNumber".to_string(), serial);
                }
                Some(port)
            }
            _ if self
                .pattern
                .as_ref()
                .is_some_and(|p| p.is_match(&info.port_name)) =>
            {
                Some(Port::serial(info.port_name))
            }
            other => {
                trace!("Skipping serial port {} ({:?})", info.port_name, other);
                None
            }
        }
    }

    /// Turn the OS listing into sorted, filtered ports.
    fn collect(&self, infos: Vec<SerialPortInfo>) -> Vec<Port> {
        let mut ports: Vec<Port> = infos.into_iter().filter_map(|i| self.to_port(i)).collect();
        ports.sort_by(|a, b| a.address.cmp(&b.address));
        ports.dedup_by(|a, b| a.address == b.address);
        ports
    }
}

impl PortEnumerator for SerialPortEnumerator {
    fn enumerate(&self) -> Result<Vec<Port>> {
        let infos = tokio_serial::available_ports().map_err(|e| {
            Error::BackendUnavailable(format!("Serial port enumeration failed: {e}"))
        })?;
        Ok(self.collect(infos))
    }
}
