//! Common error types for smartwave.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the underlying error types used throughout the crate.
//! Errors fall into three groups: failures that invalidate the whole
//! connection (`ConnectionLost`, `MalformedFrame`, `UpdateFailed`), failures
//! local to one call that leave the connection usable (`Timeout`,
//! `Rejected`), and resource lifecycle misuse (`ResourceExhausted`,
//! `AlreadyInUse`, `NotFound`, `InvalidHandle`).

use thiserror::Error;

use crate::protocol::{ErrorCode, Opcode};
use crate::resource::ResourceKind;

/// Main error type for smartwave operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Configuration file or environment errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session was never opened or has been closed
    #[error("Not connected to a device")]
    NotConnected,

    /// The transport failed or the device was disconnected
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// No reply arrived before the deadline
    #[error("Timed out waiting for {0} reply")]
    Timeout(Opcode),

    /// A frame could not be decoded; the stream is out of sync
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The device answered a request with its error flag set
    #[error("Device rejected {opcode} request{}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Rejected {
        opcode: Opcode,
        code: Option<ErrorCode>,
    },

    /// Every slot of a pool is held
    #[error("No {0} available on this device")]
    ResourceExhausted(ResourceKind),

    /// The requested resource is held by someone else
    #[error("{kind} {id} is already in use")]
    AlreadyInUse { kind: ResourceKind, id: String },

    /// The requested resource does not exist on this device
    #[error("No {kind} named {id} on this device")]
    NotFound { kind: ResourceKind, id: String },

    /// The handle was released already or belongs to another connection
    #[error("Invalid {0} handle")]
    InvalidHandle(ResourceKind),

    /// A setting is outside the range the hardware supports
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An I2C target did not acknowledge its address or a data byte
    #[error("I2C device 0x{0:02x} did not acknowledge")]
    I2cNack(u8),

    /// Firmware or bitstream update aborted; the device needs a reset
    #[error("Update failed: {0}")]
    UpdateFailed(String),
}

impl Error {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_)
                | Error::MalformedFrame(_)
                | Error::UpdateFailed(_)
                | Error::NotConnected
        )
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
