//! Interpretation of device status bits and the payloads they announce.
//!
//! Replies and unsolicited frames share one format; which payload a frame
//! carries is determined by its status bits, not its opcode. The decoders
//! here are pure functions over a [`Frame`] so both the session's receive
//! loop and the callers awaiting a reply can use them.

use std::fmt;

use super::{ErrorCode, Frame, StatusFlags};
use crate::error::{Error, Result};

/// Three-part version number as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self::new(b[0], b[1], b[2])
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Identity record returned for an Info request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub hardware: Version,
    pub firmware: Version,
    pub fpga: Version,
    pub flash_id: u64,
}

impl DeviceInfo {
    pub const WIRE_LEN: usize = 17;

    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::WIRE_LEN {
            return Err(Error::MalformedFrame(format!(
                "info payload of {} bytes, expected {}",
                payload.len(),
                Self::WIRE_LEN
            )));
        }
        let mut flash_id = [0u8; 8];
        flash_id.copy_from_slice(&payload[9..17]);
        Ok(Self {
            hardware: Version::from_bytes(&payload[0..3]),
            firmware: Version::from_bytes(&payload[3..6]),
            fpga: Version::from_bytes(&payload[6..9]),
            flash_id: u64::from_be_bytes(flash_id),
        })
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hardware {}, firmware {}, fpga {}, flash 0x{:016x}",
            self.hardware, self.firmware, self.fpga, self.flash_id
        )
    }
}

/// Input level of every inventory pin; bit `i` is inventory pin `i`.
///
/// Bank A occupies the low byte, bank B the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PinLevels(pub u16);

impl PinLevels {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload {
            [bank_a, bank_b, ..] => Ok(Self(u16::from_le_bytes([*bank_a, *bank_b]))),
            _ => Err(Error::MalformedFrame(format!(
                "pin status payload of {} bytes, expected 2",
                payload.len()
            ))),
        }
    }

    pub fn level(self, index: usize) -> bool {
        index < 16 && self.0 & (1 << index) != 0
    }

    /// Pins whose level differs from `previous`, with their new level.
    pub fn changes_since(self, previous: PinLevels) -> impl Iterator<Item = (usize, bool)> {
        let diff = self.0 ^ previous.0;
        (0..16)
            .filter(move |i| diff & (1 << i) != 0)
            .map(move |i| (i, self.level(i)))
    }
}

/// Recorder samples returned after a triggered run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Readback {
    pub recorder: u8,
    pub samples: Vec<u32>,
}

impl Readback {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 3 {
            return Err(Error::MalformedFrame(format!(
                "readback payload of {} bytes is missing its header",
                payload.len()
            )));
        }
        let recorder = payload[0];
        let count = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        let body = &payload[3..];
        if body.len() < count * 4 {
            return Err(Error::MalformedFrame(format!(
                "readback announces {} samples but carries {} bytes",
                count,
                body.len()
            )));
        }
        let samples = body
            .chunks_exact(4)
            .take(count)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Self { recorder, samples })
    }
}

/// Progress byte sent while an update is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateStatus {
    /// `true` for the microcontroller, `false` for the FPGA
    pub microcontroller: bool,
    pub percent: u8,
}

impl UpdateStatus {
    const MICROCONTROLLER: u8 = 0x80;

    pub fn from_byte(byte: u8) -> Self {
        Self {
            microcontroller: byte & Self::MICROCONTROLLER != 0,
            percent: byte & !Self::MICROCONTROLLER,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        payload
            .first()
            .map(|&b| Self::from_byte(b))
            .ok_or_else(|| Error::MalformedFrame("empty update status payload".into()))
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.microcontroller {
            "microcontroller"
        } else {
            "FPGA"
        };
        write!(f, "{} update {}%", target, self.percent)
    }
}

/// One thing a frame's status bits announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Idle,
    Running,
    Error(Option<ErrorCode>),
    Info(DeviceInfo),
    Debug(String),
    UpdateOk,
    UpdateFailed,
    Readback(Readback),
    RegisterValue(u32),
    PinLevels(PinLevels),
    UpdateProgress(UpdateStatus),
    BootloaderReady,
}

/// Decode a NUL-terminated ASCII debug string.
pub fn debug_string(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Value of a single FPGA register read.
pub fn register_value(payload: &[u8]) -> Result<u32> {
    match payload {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(Error::MalformedFrame(format!(
            "register read payload of {} bytes, expected 4",
            payload.len()
        ))),
    }
}

/// Every event announced by `frame`, payload-carrying ones first.
pub fn decode(frame: &Frame) -> Result<Vec<StatusEvent>> {
    let status = frame.status;
    let payload = &frame.payload[..];
    let mut events = Vec::new();

    if status.contains(StatusFlags::ERROR) {
        events.push(StatusEvent::Error(frame.error_code()));
    }
    if status.contains(StatusFlags::INFO) {
        events.push(StatusEvent::Info(DeviceInfo::parse(payload)?));
    }
    if status.contains(StatusFlags::DEBUG) {
        events.push(StatusEvent::Debug(debug_string(payload)));
    }
    if status.contains(StatusFlags::READBACK) {
        events.push(StatusEvent::Readback(Readback::parse(payload)?));
    }
    if status.contains(StatusFlags::SINGLE_ADDRESS_READ) {
        events.push(StatusEvent::RegisterValue(register_value(payload)?));
    }
    if status.contains(StatusFlags::PINS_STATUS) {
        events.push(StatusEvent::PinLevels(PinLevels::parse(payload)?));
    }
    if status.contains(StatusFlags::FIRMWARE_UPDATE_STATUS) {
        events.push(StatusEvent::UpdateProgress(UpdateStatus::parse(payload)?));
    }
    if status.contains(StatusFlags::FIRMWARE_UPDATE_OK) {
        events.push(StatusEvent::UpdateOk);
    }
    if status.contains(StatusFlags::FIRMWARE_UPDATE_FAILED) {
        events.push(StatusEvent::UpdateFailed);
    }
    if status.contains(StatusFlags::BOOTLOADER_READY) {
        events.push(StatusEvent::BootloaderReady);
    }
    if status.contains(StatusFlags::RUNNING) {
        events.push(StatusEvent::Running);
    } else if status.contains(StatusFlags::IDLE) {
        events.push(StatusEvent::Idle);
    }

    Ok(events)
}
