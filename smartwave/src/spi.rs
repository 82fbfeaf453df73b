//! SPI master built from one SPI driver, four pins and a stimulus.
//!
//! Each word written is one stimulus sample; the recorder captures the word
//! shifted in on MISO for every word shifted out, so a write returns as many
//! words as it sent.

use std::time::Duration;
use tokio::time::Instant;

use crate::device::{time_left, Connection};
use crate::error::{Error, Result};
use crate::protocol::{Opcode, TriggerMode};
use crate::resource::{
    Claim, DriverHandle, DriverSettings, DriverType, PinHandle, PinId, ResourceKind, Resources,
    Role, SpiSettings, StimulusHandle,
};
use crate::tracing::prelude::*;

const SAMPLE_WIDTH: u8 = 32;

#[derive(Debug, Clone, Default)]
pub struct SpiOptions {
    pub sclk: Option<PinId>,
    pub mosi: Option<PinId>,
    pub miso: Option<PinId>,
    pub cs: Option<PinId>,
    pub settings: SpiSettings,
}

/// Pins of an SPI config in role order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPins {
    pub sclk: PinHandle,
    pub mosi: PinHandle,
    pub miso: PinHandle,
    pub cs: PinHandle,
}

/// Configured SPI master on a device.
pub struct SpiConfig {
    connection: Connection,
    driver: DriverHandle,
    pins: SpiPins,
    stimulus: StimulusHandle,
    claim: Option<Claim>,
}

impl SpiConfig {
    pub async fn new(connection: &Connection, options: SpiOptions) -> Result<Self> {
        let mut resources = connection.resources().await;
        let mut claim = Claim::default();

        let (driver, pins, stimulus) =
            match Self::claim_parts(&mut resources, &mut claim, &options) {
                Ok(parts) => parts,
                Err(e) => {
                    let _ = claim.release(&mut resources);
                    return Err(e);
                }
            };
        if let Err(e) = connection.synchronize_locked(&mut resources).await {
            let _ = claim.release(&mut resources);
            return Err(e);
        }
        drop(resources);

        debug!(driver = driver.id(), "SPI config ready");
        Ok(Self {
            connection: connection.clone(),
            driver,
            pins,
            stimulus,
            claim: Some(claim),
        })
    }

    fn claim_parts(
        r: &mut Resources,
        claim: &mut Claim,
        options: &SpiOptions,
    ) -> Result<(DriverHandle, SpiPins, StimulusHandle)> {
        let driver = claim.driver(r, DriverType::Spi)?;
        let pins = SpiPins {
            sclk: claim.pin(r, options.sclk)?,
            mosi: claim.pin(r, options.mosi)?,
            miso: claim.pin(r, options.miso)?,
            cs: claim.pin(r, options.cs)?,
        };
        let stimulus = claim.stimulus(r)?;

        r.configure_driver(driver, DriverSettings::Spi(options.settings))?;
        r.bind_pin(driver, Role::Sclk, pins.sclk)?;
        r.bind_pin(driver, Role::Mosi, pins.mosi)?;
        r.bind_pin(driver, Role::Miso, pins.miso)?;
        r.bind_pin(driver, Role::Cs, pins.cs)?;
        r.program_stimulus(stimulus, SAMPLE_WIDTH, TriggerMode::Single, &[])?;
        r.link(driver, stimulus, 0)?;
        Ok((driver, pins, stimulus))
    }

    pub fn driver(&self) -> DriverHandle {
        self.driver
    }

    pub fn pins(&self) -> SpiPins {
        self.pins
    }

    pub fn recorder(&self) -> u8 {
        self.stimulus.index() as u8
    }

    pub async fn settings(&self) -> Result<SpiSettings> {
        match self.connection.resources().await.driver(self.driver)?.settings() {
            DriverSettings::Spi(s) => Ok(*s),
            _ => Err(Error::InvalidHandle(ResourceKind::Driver(DriverType::Spi))),
        }
    }

    /// Replace all settings at once.
    pub async fn configure(&self, settings: SpiSettings) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.configure_driver(self.driver, DriverSettings::Spi(settings))?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    async fn update(&self, change: impl FnOnce(&mut SpiSettings)) -> Result<()> {
        let mut settings = self.settings().await?;
        change(&mut settings);
        self.configure(settings).await
    }

    pub async fn set_clock(&self, clock_hz: u32) -> Result<()> {
        self.update(|s| s.clock_hz = clock_hz).await
    }

    pub async fn set_bit_width(&self, bit_width: u8) -> Result<()> {
        self.update(|s| s.bit_width = bit_width).await
    }

    pub async fn set_msb_first(&self, msb_first: bool) -> Result<()> {
        self.update(|s| s.msb_first = msb_first).await
    }

    pub async fn set_cpol(&self, cpol: bool) -> Result<()> {
        self.update(|s| s.cpol = cpol).await
    }

    pub async fn set_cphase(&self, cphase: bool) -> Result<()> {
        self.update(|s| s.cphase = cphase).await
    }

    pub async fn set_cspol(&self, cspol: bool) -> Result<()> {
        self.update(|s| s.cspol = cspol).await
    }

    /// Clock cycles chip select stays inactive between words.
    pub async fn set_cs_inactive(&self, cycles: u8) -> Result<()> {
        self.update(|s| s.cs_inactive = cycles).await
    }

    pub async fn set_display_name(&self, role: Role, name: &str) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.set_role_name(self.driver, role, name)?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    async fn load(
        &self,
        r: &mut Resources,
        words: &[u32],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let bit_width = match r.driver(self.driver)?.settings() {
            DriverSettings::Spi(s) => s.bit_width,
            _ => return Err(Error::InvalidHandle(ResourceKind::Driver(DriverType::Spi))),
        };
        if let Some(word) = words.iter().find(|&&w| bit_width < 32 && w >> bit_width != 0) {
            return Err(Error::InvalidArgument(format!(
                "word 0x{:x} wider than {} bits",
                word, bit_width
            )));
        }
        let read_count = u16::try_from(words.len())
            .map_err(|_| Error::InvalidArgument(format!("{} SPI words in one write", words.len())))?;
        r.program_stimulus(self.stimulus, SAMPLE_WIDTH, TriggerMode::Single, words)?;
        r.link(self.driver, self.stimulus, read_count)?;
        self.connection.synchronize_by(r, deadline).await?;
        Ok(())
    }

    /// Load `words` without running them. Loading the words already on the
    /// device writes nothing.
    pub async fn set_data(&self, words: &[u32]) -> Result<()> {
        let mut r = self.connection.resources().await;
        self.load(&mut r, words, None).await
    }

    /// Shift `words` out and return the words shifted in. `timeout` bounds
    /// the whole call, including loading the words.
    pub async fn write(&self, words: &[u32], timeout: Duration) -> Result<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        let mut r = self
            .connection
            .resources_until(deadline, Opcode::Trigger)
            .await?;
        self.load(&mut r, words, Some(deadline)).await?;
        let readback = self
            .connection
            .trigger_readback(self.recorder(), time_left(deadline, Opcode::Trigger)?)
            .await?;
        drop(r);

        if readback.samples.len() != words.len() {
            return Err(Error::MalformedFrame(format!(
                "{} SPI words read back for {} written",
                readback.samples.len(),
                words.len()
            )));
        }
        Ok(readback.samples)
    }

    pub async fn release(mut self) -> Result<()> {
        let mut r = self.connection.resources().await;
        if let Some(claim) = self.claim.take() {
            claim.release(&mut r)?;
        }
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }
}

impl Drop for SpiConfig {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        trace!(driver = self.driver.id(), "SPI config dropped");
        self.connection.release_on_drop(claim);
    }
}
