//! SmartWave wire protocol.
//!
//! Every exchange with the device is a [`Frame`]: an opcode, a status
//! bitfield and an opcode-specific payload, wrapped in a sync byte, a length
//! and a CRC-8. The host sends request frames with an empty status field;
//! the device answers each request with a frame carrying the same opcode and
//! its status bits, and also emits unsolicited frames (pin level changes,
//! debug strings, heartbeats).

pub mod frame;
pub mod status;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, FromRepr};

pub use frame::{crc_is_valid, decode, encode, Frame, FrameCodec, FrameError};
pub use status::{DeviceInfo, PinLevels, Readback, StatusEvent, UpdateStatus, Version};

/// First byte after the sync byte; selects the meaning of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, EnumIter)]
#[repr(u8)]
pub enum Opcode {
    Reset = 0x00,
    Trigger = 0x01,
    Stop = 0x02,
    Stimulus = 0x03,
    Driver = 0x04,
    Pin = 0x05,
    StimulusDriverMatrix = 0x06,
    DriverPinMatrix = 0x07,
    General = 0x08,
    Info = 0x09,
    Heartbeat = 0x0A,
    FirmwareUpdate = 0x0B,
    FpgaUpdate = 0x0C,
    FpgaWrite = 0x0D,
    FpgaRead = 0x0E,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TriggerMode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Device status bits carried by every frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u16 {
        const IDLE = 1 << 0;
        const RUNNING = 1 << 1;
        /// First payload byte is an [`ErrorCode`]
        const ERROR = 1 << 2;
        /// Payload is a [`DeviceInfo`] record
        const INFO = 1 << 3;
        /// Payload is a NUL-terminated ASCII string
        const DEBUG = 1 << 4;
        const FIRMWARE_UPDATE_OK = 1 << 5;
        const FIRMWARE_UPDATE_FAILED = 1 << 6;
        /// Payload carries recorder samples
        const READBACK = 1 << 7;
        /// Payload is one 32-bit FPGA register value
        const SINGLE_ADDRESS_READ = 1 << 8;
        /// Payload is the input level of every pin
        const PINS_STATUS = 1 << 9;
        /// Payload is one update progress byte
        const FIRMWARE_UPDATE_STATUS = 1 << 10;
        const BOOTLOADER_READY = 1 << 11;
    }
}

/// Error sub-code carried in the first payload byte when
/// [`StatusFlags::ERROR`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum ErrorCode {
    FirmwareCorrupt = 0x00,
    #[strum(serialize = "FPGACorrupt")]
    FpgaCorrupt = 0x01,
}

/// Whether a configuration runs once or repeatedly after a trigger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, FromRepr, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TriggerMode {
    #[default]
    Single = 0x00,
    Full = 0x01,
    Toggle = 0x02,
}

/// Heartbeat payloads.
pub mod heartbeat {
    pub const PING: u8 = 0x00;
    pub const PONG: u8 = 0x01;
}
