//! Hardware abstraction layer traits.
//!
//! Peripheral drivers are written against these traits instead of a
//! concrete bus, so the same driver runs over a SmartWave I2C driver or a
//! test double.

use async_trait::async_trait;

use crate::error::Result;

/// Blocking-style I2C master.
///
/// Every call is one complete bus operation; a missing acknowledgment from
/// the target is reported as [`Error::I2cNack`](crate::error::Error::I2cNack).
#[async_trait]
pub trait I2c: Send {
    /// Write `data` to the device at 7-bit `address`.
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<()>;

    /// Fill `buffer` from the device at `address`.
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<()>;

    /// Write `data`, then read into `buffer`, as one bus operation.
    async fn write_read(&mut self, address: u8, data: &[u8], buffer: &mut [u8]) -> Result<()>;
}
