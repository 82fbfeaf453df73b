//! Host driver for SmartWave signal generation and analysis devices.
//!
//! A SmartWave exposes a pool of pins, protocol drivers (I2C, SPI, GPIO)
//! and stimulus/recorder blocks over a USB serial link. This crate opens
//! that link, keeps a host-side model of which resources are held and how
//! they are wired, writes that model to the device on demand, and offers
//! I2C, SPI and GPIO configurations built on top of it.

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod gpio;
pub mod hw_trait;
pub mod i2c;
pub mod protocol;
pub mod resource;
pub mod spi;
pub mod tracing;
pub mod transport;
pub mod update;

pub use config::Config;
pub use device::{Connection, GeneralSettings};
pub use error::{Error, Result};
pub use event::DeviceEvent;
pub use gpio::{Gpio, GpioOptions};
pub use i2c::{I2cConfig, I2cOptions, I2cTransaction, I2cTransactionResult};
pub use protocol::{DeviceInfo, TriggerMode};
pub use resource::{DriverType, OutputType, PinId, Role};
pub use spi::{SpiConfig, SpiOptions};
pub use transport::{CloseReason, PortIdentity};
pub use update::{Bitstream, FirmwareImage, UpdateProgress, UpdateState};
