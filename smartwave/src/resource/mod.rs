//! Finite hardware resources of a device and the wiring between them.
//!
//! Everything here is host-side bookkeeping. Nothing touches the wire until
//! [`Resources::sync_plan`] turns dirty state into frames, which the
//! connection sends and acknowledges one by one.

pub mod allocator;
pub mod driver;
pub mod pin;
pub mod pool;
pub mod stimulus;

use std::fmt;

pub(crate) use allocator::Claim;
pub use allocator::{Resources, SyncStep, SyncTarget};
pub use driver::{
    Dirty, Driver, DriverHandle, DriverSettings, DriverType, GpioSettings, I2cSettings,
    OutputType, Rgb, Role, SpiSettings, StimulusLink, UartSettings,
};
pub use pin::{Bank, Pin, PinBinding, PinId};
pub use pool::{Handle, Pool};
pub use stimulus::{Stimulus, StimulusType};

pub type PinHandle = Handle<Pin>;
pub type StimulusHandle = Handle<Stimulus>;

/// Kind of resource named in allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pin,
    Driver(DriverType),
    Stimulus,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pin => write!(f, "pin"),
            ResourceKind::Driver(kind) => write!(f, "{} driver", kind),
            ResourceKind::Stimulus => write!(f, "stimulus"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(ResourceKind::Pin.to_string(), "pin");
        assert_eq!(
            ResourceKind::Driver(DriverType::I2c).to_string(),
            "I2C driver"
        );
        assert_eq!(ResourceKind::Stimulus.to_string(), "stimulus");
    }
}
