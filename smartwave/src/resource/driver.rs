//! Protocol drivers: the on-device blocks that bit-bang SPI, I2C, GPIO and
//! UART onto the pins wired to them.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, FromRepr};

use super::{PinHandle, StimulusHandle};
use crate::error::{Error, Result};

/// FPGA system clock all driver clock dividers derive from.
pub const FPGA_CLOCK_HZ: u32 = 100_000_000;

/// Slowest clock any driver can produce.
pub const MIN_CLOCK_HZ: u32 = FPGA_CLOCK_HZ / 0xFFFF / 2;
pub const MAX_I2C_CLOCK_HZ: u32 = 3_000_000;
pub const MAX_SPI_CLOCK_HZ: u32 = 25_000_000;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, FromRepr, EnumIter,
)]
#[repr(u8)]
pub enum DriverType {
    #[strum(serialize = "SPI")]
    Spi = 0x00,
    #[strum(serialize = "I2C")]
    I2c = 0x01,
    #[strum(serialize = "UART")]
    Uart = 0x03,
    #[strum(serialize = "GPIO")]
    Gpio = 0x04,
    NoDriver = 0xFF,
}

impl DriverType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Roles a driver of this type exposes, in wire order.
    pub fn roles(self) -> &'static [Role] {
        match self {
            DriverType::Spi => &[Role::Sclk, Role::Cs, Role::Mosi, Role::Miso],
            DriverType::I2c => &[Role::Scl, Role::Sda],
            DriverType::Uart => &[Role::Tx, Role::Rx],
            DriverType::Gpio => &[Role::Io],
            DriverType::NoDriver => &[],
        }
    }

    /// UI color of the first driver of this type.
    pub fn base_color(self) -> Rgb {
        match self {
            DriverType::I2c => Rgb::new(0xa5, 0x4b, 0xe2),
            DriverType::Spi => Rgb::new(0xab, 0x58, 0x48),
            DriverType::Gpio => Rgb::new(0x43, 0x58, 0x80),
            DriverType::Uart => Rgb::new(0x3f, 0x9e, 0x6b),
            DriverType::NoDriver => Rgb::new(0xff, 0xff, 0xff),
        }
    }

    fn default_settings(self) -> DriverSettings {
        match self {
            DriverType::I2c => DriverSettings::I2c(I2cSettings::default()),
            DriverType::Spi => DriverSettings::Spi(SpiSettings::default()),
            DriverType::Uart => DriverSettings::Uart(UartSettings::default()),
            DriverType::Gpio | DriverType::NoDriver => DriverSettings::Gpio(GpioSettings::default()),
        }
    }
}

/// Function a pin performs for its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum Role {
    #[strum(serialize = "SCL")]
    Scl,
    #[strum(serialize = "SDA")]
    Sda,
    #[strum(serialize = "SCLK")]
    Sclk,
    #[strum(serialize = "CS")]
    Cs,
    #[strum(serialize = "MOSI")]
    Mosi,
    #[strum(serialize = "MISO")]
    Miso,
    #[strum(serialize = "IO")]
    Io,
    #[strum(serialize = "TX")]
    Tx,
    #[strum(serialize = "RX")]
    Rx,
}

impl Role {
    /// Position of the role within its driver, as sent on the wire.
    pub fn number(self) -> u8 {
        match self {
            Role::Scl | Role::Sclk | Role::Io | Role::Tx => 0,
            Role::Sda | Role::Cs | Role::Rx => 1,
            Role::Mosi => 2,
            Role::Miso => 3,
        }
    }

    pub fn driver_type(self) -> DriverType {
        match self {
            Role::Scl | Role::Sda => DriverType::I2c,
            Role::Sclk | Role::Cs | Role::Mosi | Role::Miso => DriverType::Spi,
            Role::Io => DriverType::Gpio,
            Role::Tx | Role::Rx => DriverType::Uart,
        }
    }
}

/// 24-bit color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Move each channel `step` fifths of the way toward white.
    pub fn lighten(self, step: usize) -> Self {
        let step = step.min(4) as u16;
        let mix = |c: u8| (c as u16 + (255 - c as u16) * step / 5) as u8;
        Self::new(mix(self.r), mix(self.g), mix(self.b))
    }

    pub fn to_rgb565(self) -> u16 {
        ((self.r as u16 >> 3) << 11) | ((self.g as u16 >> 2) << 5) | (self.b as u16 >> 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I2cSettings {
    pub clock_hz: u32,
}

impl Default for I2cSettings {
    fn default() -> Self {
        Self { clock_hz: 400_000 }
    }
}

impl I2cSettings {
    pub fn validate(&self) -> Result<()> {
        check_clock(self.clock_hz, MAX_I2C_CLOCK_HZ)
    }

    /// Clock divider: six FPGA cycles per I2C quarter-bit phase pair.
    pub fn clock_divider(&self) -> u16 {
        divider(self.clock_hz, 6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiSettings {
    pub clock_hz: u32,
    /// Bits per word, 1 to 32
    pub bit_width: u8,
    pub msb_first: bool,
    pub cpol: bool,
    pub cphase: bool,
    /// Chip select active level
    pub cspol: bool,
    /// Clock cycles CS stays inactive between words
    pub cs_inactive: u8,
}

impl Default for SpiSettings {
    fn default() -> Self {
        Self {
            clock_hz: MAX_SPI_CLOCK_HZ,
            bit_width: 8,
            msb_first: true,
            cpol: false,
            cphase: false,
            cspol: false,
            cs_inactive: 1,
        }
    }
}

impl SpiSettings {
    pub fn validate(&self) -> Result<()> {
        check_clock(self.clock_hz, MAX_SPI_CLOCK_HZ)?;
        if !(1..=32).contains(&self.bit_width) {
            return Err(Error::InvalidArgument(format!(
                "SPI bit width {} outside 1-32",
                self.bit_width
            )));
        }
        Ok(())
    }

    pub fn clock_divider(&self) -> u16 {
        divider(self.clock_hz, 2)
    }

    /// Stimulus sample width able to carry one word.
    pub fn sample_width(&self) -> u8 {
        self.bit_width.div_ceil(8) * 8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartSettings {
    pub baud: u32,
}

impl Default for UartSettings {
    fn default() -> Self {
        Self { baud: 115_200 }
    }
}

/// How a GPIO pin drives its line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, FromRepr, Deserialize, Serialize,
)]
#[repr(u8)]
pub enum OutputType {
    #[default]
    Disable = 0x00,
    PushPull = 0x01,
    OpenDrain = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpioSettings {
    pub output: OutputType,
    pub level: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverSettings {
    I2c(I2cSettings),
    Spi(SpiSettings),
    Uart(UartSettings),
    Gpio(GpioSettings),
}

/// FPGA cycles per `cycles_per_bit` driver cycles, saturating at the
/// 16-bit register range for clocks `validate` would reject.
fn divider(clock_hz: u32, cycles_per_bit: u64) -> u16 {
    let divider = FPGA_CLOCK_HZ as u64 / (clock_hz.max(1) as u64 * cycles_per_bit);
    divider.clamp(1, u16::MAX as u64) as u16
}

fn check_clock(hz: u32, max: u32) -> Result<()> {
    if (MIN_CLOCK_HZ..=max).contains(&hz) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "clock {} Hz outside {}-{} Hz",
            hz, MIN_CLOCK_HZ, max
        )))
    }
}

bitflags! {
    /// Which parts of a driver differ from what the device last acknowledged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Dirty: u8 {
        /// Driver request (clock, mode)
        const CONFIG = 1 << 0;
        /// DriverPinMatrix entries
        const WIRING = 1 << 1;
        /// StimulusDriverMatrix entry
        const LINK = 1 << 2;
    }
}

/// Typed reference to a held driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverHandle {
    pub(crate) kind: DriverType,
    pub(crate) inner: super::Handle<Driver>,
}

impl DriverHandle {
    pub fn kind(&self) -> DriverType {
        self.kind
    }

    /// Per-type id of the driver on the device.
    pub fn id(&self) -> u8 {
        self.inner.index() as u8
    }
}

/// Stimulus feeding a driver and the number of samples its recorder
/// returns per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StimulusLink {
    pub stimulus: StimulusHandle,
    pub read_count: u16,
}

/// Host-side mirror of one driver block.
#[derive(Debug, Clone)]
pub struct Driver {
    kind: DriverType,
    id: u8,
    color: Rgb,
    pub(crate) pins: BTreeMap<Role, PinHandle>,
    pub(crate) names: BTreeMap<Role, String>,
    pub(crate) settings: DriverSettings,
    pub(crate) link: Option<StimulusLink>,
    pub(crate) dirty: Dirty,
}

impl Driver {
    pub(crate) fn new(kind: DriverType, id: u8) -> Self {
        Self {
            kind,
            id,
            color: kind.base_color().lighten(id as usize),
            pins: BTreeMap::new(),
            names: default_names(kind),
            settings: kind.default_settings(),
            link: None,
            dirty: Dirty::empty(),
        }
    }

    pub fn kind(&self) -> DriverType {
        self.kind
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn color(&self) -> Rgb {
        self.color
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn pin(&self, role: Role) -> Option<PinHandle> {
        self.pins.get(&role).copied()
    }

    pub fn name(&self, role: Role) -> &str {
        self.names.get(&role).map(String::as_str).unwrap_or("")
    }

    pub fn link(&self) -> Option<StimulusLink> {
        self.link
    }

    pub fn dirty(&self) -> Dirty {
        self.dirty
    }

    /// Payload of the Driver request, or `None` for types configured
    /// entirely through their pin matrix entries.
    pub(crate) fn config_payload(&self) -> Option<Vec<u8>> {
        let head = [self.kind.as_u8(), self.id, 1];
        match &self.settings {
            DriverSettings::I2c(s) => {
                let mut p = head.to_vec();
                p.extend_from_slice(&s.clock_divider().to_be_bytes());
                Some(p)
            }
            DriverSettings::Spi(s) => {
                let mut p = head.to_vec();
                p.extend_from_slice(&[
                    s.bit_width,
                    s.msb_first as u8,
                    s.cpol as u8,
                    s.cspol as u8,
                    s.cphase as u8,
                ]);
                p.extend_from_slice(&s.clock_divider().to_be_bytes());
                p.push(s.cs_inactive);
                Some(p)
            }
            DriverSettings::Uart(s) => {
                let mut p = head.to_vec();
                p.extend_from_slice(&s.baud.to_be_bytes());
                Some(p)
            }
            DriverSettings::Gpio(_) => None,
        }
    }

    /// One DriverPinMatrix entry for `role` wired to the pin with `pin_id`.
    pub(crate) fn matrix_entry(&self, role: Role, pin_id: u8) -> Vec<u8> {
        let (second, third) = match &self.settings {
            DriverSettings::Gpio(g) => (g.output as u8, g.level as u8),
            _ => (self.id, role.number()),
        };
        let name = self.name(role).as_bytes();
        let name = &name[..name.len().min(u8::MAX as usize)];
        let mut entry = vec![self.kind.as_u8(), second, third, pin_id];
        entry.extend_from_slice(&self.color.to_rgb565().to_be_bytes());
        entry.push(name.len() as u8);
        entry.extend_from_slice(name);
        entry
    }

    pub(crate) fn reset(&mut self) {
        self.pins.clear();
        self.names = default_names(self.kind);
        self.settings = self.kind.default_settings();
        self.link = None;
        self.dirty = Dirty::empty();
    }
}

fn default_names(kind: DriverType) -> BTreeMap<Role, String> {
    let gpio = kind == DriverType::Gpio;
    kind.roles()
        .iter()
        .map(|&r| (r, if gpio { "GPIO".to_string() } else { r.to_string() }))
        .collect()
}

/// Matrix entry that detaches `pin_id` from whatever driver holds it.
pub(crate) fn unbind_entry(pin_id: u8) -> [u8; 7] {
    [DriverType::NoDriver.as_u8(), 0, 0, pin_id, 0xff, 0xff, 0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DriverType::I2c, 0xa54be2, 0xa25c ; "i2c")]
    #[test_case(DriverType::Spi, 0xab5848, 0xaac9 ; "spi")]
    #[test_case(DriverType::Gpio, 0x435880, 0x42d0 ; "gpio")]
    #[test_case(DriverType::Uart, 0x3f9e6b, 0x3ced ; "uart")]
    fn base_colors(kind: DriverType, rgb: u32, rgb565: u16) {
        let c = kind.base_color();
        assert_eq!(
            ((c.r as u32) << 16) | ((c.g as u32) << 8) | c.b as u32,
            rgb
        );
        assert_eq!(c.to_rgb565(), rgb565);
    }

    #[test]
    fn later_drivers_are_lighter() {
        let first = Driver::new(DriverType::I2c, 0).color();
        let second = Driver::new(DriverType::I2c, 1).color();
        assert_eq!(first, DriverType::I2c.base_color());
        assert!(second.r >= first.r && second.g > first.g && second.b >= first.b);
    }

    #[test]
    fn i2c_config_payload() {
        let driver = Driver::new(DriverType::I2c, 1);
        // 100 MHz / (400 kHz * 6) = 41
        assert_eq!(driver.config_payload().unwrap(), vec![0x01, 1, 1, 0, 41]);
    }

    #[test]
    fn spi_config_payload() {
        let mut driver = Driver::new(DriverType::Spi, 0);
        driver.settings = DriverSettings::Spi(SpiSettings {
            clock_hz: 1_000_000,
            bit_width: 16,
            msb_first: true,
            cpol: true,
            cphase: false,
            cspol: false,
            cs_inactive: 3,
        });
        assert_eq!(
            driver.config_payload().unwrap(),
            vec![0x00, 0, 1, 16, 1, 1, 0, 0, 0, 50, 3]
        );
    }

    #[test]
    fn gpio_has_no_config_frame() {
        assert!(Driver::new(DriverType::Gpio, 3).config_payload().is_none());
    }

    #[test]
    fn matrix_entries() {
        let driver = Driver::new(DriverType::I2c, 0);
        assert_eq!(
            driver.matrix_entry(Role::Sda, 0xA2),
            vec![0x01, 0, 1, 0xA2, 0xa2, 0x5c, 3, b'S', b'D', b'A']
        );

        let mut gpio = Driver::new(DriverType::Gpio, 0);
        gpio.settings = DriverSettings::Gpio(GpioSettings {
            output: OutputType::OpenDrain,
            level: true,
        });
        gpio.names.insert(Role::Io, "LED".into());
        assert_eq!(
            gpio.matrix_entry(Role::Io, 0xB7),
            vec![0x04, 2, 1, 0xB7, 0x42, 0xd0, 3, b'L', b'E', b'D']
        );
    }

    #[test_case(MIN_CLOCK_HZ - 1, false ; "too slow")]
    #[test_case(MIN_CLOCK_HZ, true ; "slowest")]
    #[test_case(3_000_000, true ; "fastest")]
    #[test_case(3_000_001, false ; "too fast")]
    fn i2c_clock_range(hz: u32, ok: bool) {
        assert_eq!(I2cSettings { clock_hz: hz }.validate().is_ok(), ok);
    }

    #[test_case(u32::MAX, 1 ; "far too fast")]
    #[test_case(0, u16::MAX ; "zero")]
    #[test_case(1_000_000, 16 ; "one megahertz")]
    fn i2c_divider_saturates(hz: u32, expected: u16) {
        assert_eq!(I2cSettings { clock_hz: hz }.clock_divider(), expected);
    }

    #[test]
    fn spi_divider_saturates() {
        let s = SpiSettings {
            clock_hz: u32::MAX,
            ..Default::default()
        };
        assert_eq!(s.clock_divider(), 1);
    }

    #[test]
    fn spi_width_range() {
        let mut s = SpiSettings::default();
        s.bit_width = 0;
        assert!(s.validate().is_err());
        s.bit_width = 33;
        assert!(s.validate().is_err());
        s.bit_width = 12;
        assert!(s.validate().is_ok());
        assert_eq!(s.sample_width(), 16);
    }

    #[test]
    fn role_numbers_follow_wire_order() {
        for kind in [DriverType::I2c, DriverType::Spi, DriverType::Uart] {
            for (i, role) in kind.roles().iter().enumerate() {
                assert_eq!(role.number() as usize, i);
                assert_eq!(role.driver_type(), kind);
            }
        }
    }
}
