//! Finding SmartWave devices among the host's serial ports.

use std::fmt;
use tokio_serial::{SerialPortInfo, SerialPortType};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// USB vendor id of the device's microcontroller board.
pub const VID: u16 = 0x2341;
/// USB product id of a SmartWave.
pub const PID: u16 = 0x8071;

/// Where a connection's device was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortIdentity {
    pub port: String,
    /// USB vendor/product ids, when the port is a USB device
    pub usb: Option<(u16, u16)>,
    pub serial_number: Option<String>,
}

impl PortIdentity {
    /// Identity of a stream that did not come from a serial port.
    pub fn unnamed() -> Self {
        Self {
            port: String::new(),
            usb: None,
            serial_number: None,
        }
    }

    pub fn is_smartwave(&self) -> bool {
        self.usb == Some((VID, PID))
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.usb {
            Some((vid, pid)) => write!(f, "{} ({:04x}:{:04x})", self.port, vid, pid),
            None => write!(f, "{}", self.port),
        }
    }
}

fn identity(info: &SerialPortInfo) -> PortIdentity {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => PortIdentity {
            port: info.port_name.clone(),
            usb: Some((usb.vid, usb.pid)),
            serial_number: usb.serial_number.clone(),
        },
        _ => PortIdentity {
            port: info.port_name.clone(),
            usb: None,
            serial_number: None,
        },
    }
}

fn select(ports: &[SerialPortInfo]) -> Vec<PortIdentity> {
    ports
        .iter()
        .map(identity)
        .filter(PortIdentity::is_smartwave)
        .collect()
}

/// Serial ports whose USB ids match a SmartWave, in enumeration order.
pub fn candidate_ports() -> Result<Vec<PortIdentity>> {
    let ports = tokio_serial::available_ports()?;
    let candidates = select(&ports);
    debug!(
        total = ports.len(),
        candidates = candidates.len(),
        "Enumerated serial ports"
    );
    Ok(candidates)
}

/// Identity of `port`, refusing ports that enumerate as some other USB
/// device. Ports the system does not list (e.g. pseudo terminals) are
/// allowed through unidentified.
pub fn identify(port: &str) -> Result<PortIdentity> {
    let ports = tokio_serial::available_ports()?;
    match ports.iter().find(|p| p.port_name == port).map(identity) {
        Some(id) if id.usb.is_some() && !id.is_smartwave() => Err(Error::InvalidArgument(
            format!("{} is not a SmartWave device", id),
        )),
        Some(id) => Ok(id),
        None => Ok(PortIdentity {
            port: port.to_string(),
            usb: None,
            serial_number: None,
        }),
    }
}
