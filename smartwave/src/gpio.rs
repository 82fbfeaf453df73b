//! Single pin driven by a GPIO driver.

use crate::device::Connection;
use crate::error::{Error, Result};
use crate::resource::{
    Claim, DriverHandle, DriverSettings, DriverType, GpioSettings, OutputType, PinHandle, PinId,
    ResourceKind, Resources, Role,
};
use crate::tracing::prelude::*;

#[derive(Debug, Clone, Default)]
pub struct GpioOptions {
    /// Pin to use; the next free one when unset
    pub pin: Option<PinId>,
    /// Label shown on the device
    pub name: Option<String>,
    pub level: bool,
    pub pullup: bool,
    pub output: OutputType,
}

pub struct Gpio {
    connection: Connection,
    driver: DriverHandle,
    pin: PinHandle,
    pin_id: PinId,
    claim: Option<Claim>,
}

impl Gpio {
    pub async fn new(connection: &Connection, options: GpioOptions) -> Result<Self> {
        let mut resources = connection.resources().await;
        let mut claim = Claim::default();

        let (driver, pin) = match Self::claim_parts(&mut resources, &mut claim, &options) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = claim.release(&mut resources);
                return Err(e);
            }
        };
        let pin_id = resources.pin(pin)?.id();
        if let Err(e) = connection.synchronize_locked(&mut resources).await {
            let _ = claim.release(&mut resources);
            return Err(e);
        }
        drop(resources);

        debug!(pin = %pin_id, driver = driver.id(), "GPIO ready");
        Ok(Self {
            connection: connection.clone(),
            driver,
            pin,
            pin_id,
            claim: Some(claim),
        })
    }

    fn claim_parts(
        r: &mut Resources,
        claim: &mut Claim,
        options: &GpioOptions,
    ) -> Result<(DriverHandle, PinHandle)> {
        let driver = claim.driver(r, DriverType::Gpio)?;
        let pin = claim.pin(r, options.pin)?;
        r.configure_driver(
            driver,
            DriverSettings::Gpio(GpioSettings {
                output: options.output,
                level: options.level,
            }),
        )?;
        if let Some(name) = &options.name {
            r.set_role_name(driver, Role::Io, name)?;
        }
        r.bind_pin(driver, Role::Io, pin)?;
        r.set_pullup(pin, options.pullup)?;
        Ok((driver, pin))
    }

    pub fn pin(&self) -> PinId {
        self.pin_id
    }

    pub fn driver(&self) -> DriverHandle {
        self.driver
    }

    pub async fn settings(&self) -> Result<GpioSettings> {
        match self.connection.resources().await.driver(self.driver)?.settings() {
            DriverSettings::Gpio(s) => Ok(*s),
            _ => Err(Error::InvalidHandle(ResourceKind::Driver(DriverType::Gpio))),
        }
    }

    async fn update(&self, change: impl FnOnce(&mut GpioSettings)) -> Result<()> {
        let mut r = self.connection.resources().await;
        let mut settings = match r.driver(self.driver)?.settings() {
            DriverSettings::Gpio(s) => *s,
            _ => return Err(Error::InvalidHandle(ResourceKind::Driver(DriverType::Gpio))),
        };
        change(&mut settings);
        r.configure_driver(self.driver, DriverSettings::Gpio(settings))?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    /// Output level driven when the output type is not `Disable`.
    pub async fn set_level(&self, level: bool) -> Result<()> {
        self.update(|s| s.level = level).await
    }

    pub async fn set_output_type(&self, output: OutputType) -> Result<()> {
        self.update(|s| s.output = output).await
    }

    pub async fn set_pullup(&self, enabled: bool) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.set_pullup(self.pin, enabled)?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    pub async fn name(&self) -> Result<String> {
        let r = self.connection.resources().await;
        Ok(r.driver(self.driver)?.name(Role::Io).to_string())
    }

    pub async fn set_name(&self, name: &str) -> Result<()> {
        let mut r = self.connection.resources().await;
        r.set_role_name(self.driver, Role::Io, name)?;
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }

    /// Last input level the device reported.
    pub fn input_level(&self) -> bool {
        self.connection.input_level(self.pin_id)
    }

    /// Call `callback` with the new level whenever the input changes.
    pub fn on_level_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.connection
            .on_input_level(self.pin_id, move |_, level| callback(level));
    }

    pub fn clear_level_callback(&self) {
        self.connection.clear_input_listener(self.pin_id);
    }

    pub async fn release(mut self) -> Result<()> {
        self.connection.clear_input_listener(self.pin_id);
        let mut r = self.connection.resources().await;
        if let Some(claim) = self.claim.take() {
            claim.release(&mut r)?;
        }
        self.connection.synchronize_locked(&mut r).await?;
        Ok(())
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        self.connection.clear_input_listener(self.pin_id);
        self.connection.release_on_drop(claim);
    }
}
