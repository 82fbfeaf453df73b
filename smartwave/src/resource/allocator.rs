//! Pools of every resource kind, the pin-driver-stimulus wiring graph and
//! the dirty tracking that mirrors it to the device.
//!
//! `Resources` is plain data guarded by the connection's allocator lock; all
//! methods are synchronous. Every mutation validates first and only then
//! writes, so a failed call leaves the graph as it was.

use std::collections::{BTreeSet, HashMap};

use super::driver::{unbind_entry, Dirty, Driver, DriverHandle, DriverSettings, DriverType, Role, StimulusLink};
use super::pin::{Pin, PinBinding, PinId};
use super::stimulus::{link_payload, unlink_payload, Stimulus};
use super::{PinHandle, Pool, ResourceKind, StimulusHandle};
use crate::config::ResourceConfig;
use crate::error::{Error, Result};
use crate::protocol::{Frame, Opcode, TriggerMode};
use crate::tracing::prelude::*;

/// Object whose dirty state one synchronization frame clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    /// Detach these pin ids from their former drivers
    Unbind(Vec<u8>),
    /// Detach the stimulus from a driver that no longer has one
    Unlink(DriverType, u8),
    DriverConfig(DriverHandle),
    Stimulus(StimulusHandle),
    Wiring(DriverHandle),
    Pin(PinHandle),
    Link(DriverHandle),
}

/// One frame of a synchronization pass and what its acknowledgment clears.
#[derive(Debug, Clone)]
pub struct SyncStep {
    pub target: SyncTarget,
    pub frame: Frame,
}

pub struct Resources {
    pins: Pool<Pin>,
    drivers: HashMap<DriverType, Pool<Driver>>,
    stimuli: Pool<Stimulus>,
    pending_unbind: BTreeSet<u8>,
    pending_unlink: BTreeSet<(DriverType, u8)>,
}

impl Resources {
    pub fn new(config: &ResourceConfig) -> Self {
        let driver_pool = |kind: DriverType, count: u8| {
            (
                kind,
                Pool::new(
                    ResourceKind::Driver(kind),
                    (0..count).map(|id| Driver::new(kind, id)),
                ),
            )
        };
        Self {
            pins: Pool::new(ResourceKind::Pin, PinId::all().map(Pin::new)),
            drivers: [
                driver_pool(DriverType::I2c, config.i2c_drivers),
                driver_pool(DriverType::Spi, config.spi_drivers),
                driver_pool(DriverType::Gpio, config.gpio_drivers),
                driver_pool(DriverType::Uart, config.uart_drivers),
            ]
            .into_iter()
            .collect(),
            stimuli: Pool::new(
                ResourceKind::Stimulus,
                (0..config.stimuli).map(Stimulus::new),
            ),
            pending_unbind: BTreeSet::new(),
            pending_unlink: BTreeSet::new(),
        }
    }

    fn driver_pool(&self, kind: DriverType) -> Result<&Pool<Driver>> {
        self.drivers
            .get(&kind)
            .ok_or_else(|| Error::InvalidArgument(format!("no {} driver pool", kind)))
    }

    fn driver_pool_mut(&mut self, kind: DriverType) -> Result<&mut Pool<Driver>> {
        self.drivers
            .get_mut(&kind)
            .ok_or_else(|| Error::InvalidArgument(format!("no {} driver pool", kind)))
    }

    // ----- pins -----

    pub fn acquire_next_pin(&mut self) -> Result<PinHandle> {
        let handle = self.pins.acquire_next()?;
        self.on_pin_acquired(handle)
    }

    pub fn acquire_pin(&mut self, id: PinId) -> Result<PinHandle> {
        let handle = self.pins.acquire_at(id.index(), &id.to_string())?;
        self.on_pin_acquired(handle)
    }

    fn on_pin_acquired(&mut self, handle: PinHandle) -> Result<PinHandle> {
        let pin = self.pins.get_mut(handle)?;
        pin.dirty = true;
        debug!(pin = %pin.id(), "Acquired pin");
        Ok(handle)
    }

    /// Return a pin, detaching it from its driver first.
    pub fn release_pin(&mut self, handle: PinHandle) -> Result<()> {
        let (id, binding) = {
            let pin = self.pins.get(handle)?;
            (pin.id(), pin.binding)
        };
        if let Some(binding) = binding {
            if let Ok(driver) = self.driver_mut(binding.driver) {
                driver.pins.remove(&binding.role);
            }
            self.pending_unbind.insert(id.wire_id());
        }
        if let Ok(pin) = self.pins.get_mut(handle) {
            pin.reset();
        }
        self.pins.release(handle)?;
        debug!(pin = %id, "Released pin");
        Ok(())
    }

    pub fn pin(&self, handle: PinHandle) -> Result<&Pin> {
        self.pins.get(handle)
    }

    pub fn set_pullup(&mut self, handle: PinHandle, pullup: bool) -> Result<()> {
        let pin = self.pins.get_mut(handle)?;
        if pin.pullup != pullup {
            pin.pullup = pullup;
            pin.dirty = true;
        }
        Ok(())
    }

    // ----- drivers -----

    pub fn acquire_next_driver(&mut self, kind: DriverType) -> Result<DriverHandle> {
        let inner = self.driver_pool_mut(kind)?.acquire_next()?;
        self.on_driver_acquired(DriverHandle { kind, inner })
    }

    pub fn acquire_driver(&mut self, kind: DriverType, id: u8) -> Result<DriverHandle> {
        let inner = self
            .driver_pool_mut(kind)?
            .acquire_at(id as usize, &id.to_string())?;
        self.on_driver_acquired(DriverHandle { kind, inner })
    }

    fn on_driver_acquired(&mut self, handle: DriverHandle) -> Result<DriverHandle> {
        let driver = self.driver_mut(handle)?;
        if driver.config_payload().is_some() {
            driver.dirty |= Dirty::CONFIG;
        }
        debug!(driver = %handle.kind, id = handle.id(), "Acquired driver");
        Ok(handle)
    }

    /// Return a driver, unwiring its pins and unlinking its stimulus.
    pub fn release_driver(&mut self, handle: DriverHandle) -> Result<()> {
        let driver = self.driver(handle)?;
        let pins: Vec<PinHandle> = driver.pins.values().copied().collect();
        let linked = driver.link.is_some();

        for pin in pins {
            if let Ok(pin) = self.pins.get_mut(pin) {
                pin.binding = None;
                self.pending_unbind.insert(pin.id().wire_id());
            }
        }
        if linked {
            self.pending_unlink.insert((handle.kind, handle.id()));
        }

        let pool = self.driver_pool_mut(handle.kind)?;
        if let Ok(driver) = pool.get_mut(handle.inner) {
            driver.reset();
        }
        pool.release(handle.inner)?;
        debug!(driver = %handle.kind, id = handle.id(), "Released driver");
        Ok(())
    }

    pub fn driver(&self, handle: DriverHandle) -> Result<&Driver> {
        self.driver_pool(handle.kind)?.get(handle.inner)
    }

    fn driver_mut(&mut self, handle: DriverHandle) -> Result<&mut Driver> {
        self.driver_pool_mut(handle.kind)?.get_mut(handle.inner)
    }

    /// Replace a driver's settings after validating them.
    pub fn configure_driver(&mut self, handle: DriverHandle, settings: DriverSettings) -> Result<()> {
        let matches_kind = matches!(
            (handle.kind, &settings),
            (DriverType::I2c, DriverSettings::I2c(_))
                | (DriverType::Spi, DriverSettings::Spi(_))
                | (DriverType::Uart, DriverSettings::Uart(_))
                | (DriverType::Gpio, DriverSettings::Gpio(_))
        );
        if !matches_kind {
            return Err(Error::InvalidArgument(format!(
                "settings do not apply to a {} driver",
                handle.kind
            )));
        }
        match &settings {
            DriverSettings::I2c(s) => s.validate()?,
            DriverSettings::Spi(s) => s.validate()?,
            _ => {}
        }

        let driver = self.driver_mut(handle)?;
        if driver.settings != settings {
            driver.settings = settings;
            driver.dirty |= match settings {
                DriverSettings::Gpio(_) => Dirty::WIRING,
                _ => Dirty::CONFIG,
            };
        }
        Ok(())
    }

    pub fn set_role_name(&mut self, handle: DriverHandle, role: Role, name: &str) -> Result<()> {
        if role.driver_type() != handle.kind {
            return Err(Error::InvalidArgument(format!(
                "{} is not a role of a {} driver",
                role, handle.kind
            )));
        }
        if !name.is_ascii() || name.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "pin name {:?} must be ASCII and at most 255 bytes",
                name
            )));
        }
        let driver = self.driver_mut(handle)?;
        if driver.name(role) != name {
            driver.names.insert(role, name.to_string());
            if driver.pins.contains_key(&role) {
                driver.dirty |= Dirty::WIRING;
            }
        }
        Ok(())
    }

    // ----- wiring -----

    /// Wire `pin` to `role` of `driver`.
    ///
    /// Rebinding the same pin to the same role is a no-op. A pin wired to
    /// anything else is `AlreadyInUse`. A different pin previously in `role`
    /// is detached.
    pub fn bind_pin(&mut self, driver: DriverHandle, role: Role, pin: PinHandle) -> Result<()> {
        if role.driver_type() != driver.kind {
            return Err(Error::InvalidArgument(format!(
                "{} is not a role of a {} driver",
                role, driver.kind
            )));
        }
        let previous = self.driver(driver)?.pin(role);
        let target = self.pins.get(pin)?;
        let binding = PinBinding { driver, role };
        match target.binding {
            Some(existing) if existing == binding => return Ok(()),
            Some(_) => {
                return Err(Error::AlreadyInUse {
                    kind: ResourceKind::Pin,
                    id: target.id().to_string(),
                })
            }
            None => {}
        }

        if let Some(old) = previous {
            if let Ok(old) = self.pins.get_mut(old) {
                old.binding = None;
                self.pending_unbind.insert(old.id().wire_id());
            }
        }
        let target = self.pins.get_mut(pin)?;
        target.binding = Some(binding);
        let pin_id = target.id();
        let d = self.driver_mut(driver)?;
        d.pins.insert(role, pin);
        d.dirty |= Dirty::WIRING;
        trace!(driver = %driver.kind, id = driver.id(), %role, pin = %pin_id, "Bound pin");
        Ok(())
    }

    /// Detach whatever pin fills `role`, returning it.
    pub fn unbind_role(&mut self, driver: DriverHandle, role: Role) -> Result<Option<PinHandle>> {
        let Some(pin) = self.driver_mut(driver)?.pins.remove(&role) else {
            return Ok(None);
        };
        if let Ok(p) = self.pins.get_mut(pin) {
            p.binding = None;
            self.pending_unbind.insert(p.id().wire_id());
        }
        Ok(Some(pin))
    }

    // ----- stimuli -----

    pub fn acquire_next_stimulus(&mut self) -> Result<StimulusHandle> {
        let handle = self.stimuli.acquire_next()?;
        debug!(stimulus = handle.index(), "Acquired stimulus");
        Ok(handle)
    }

    pub fn acquire_stimulus(&mut self, id: u8) -> Result<StimulusHandle> {
        self.stimuli.acquire_at(id as usize, &id.to_string())
    }

    /// Return a stimulus, unlinking it from its driver.
    pub fn release_stimulus(&mut self, handle: StimulusHandle) -> Result<()> {
        self.stimuli.get(handle)?;
        if let Some(driver) = self.linked_driver(handle) {
            self.unlink(driver)?;
        }
        if let Ok(s) = self.stimuli.get_mut(handle) {
            s.reset();
        }
        self.stimuli.release(handle)?;
        debug!(stimulus = handle.index(), "Released stimulus");
        Ok(())
    }

    pub fn stimulus(&self, handle: StimulusHandle) -> Result<&Stimulus> {
        self.stimuli.get(handle)
    }

    /// Load a sample program; returns whether anything changed.
    pub fn program_stimulus(
        &mut self,
        handle: StimulusHandle,
        sample_width: u8,
        trigger_mode: TriggerMode,
        samples: &[u32],
    ) -> Result<bool> {
        self.stimuli
            .get_mut(handle)?
            .program(sample_width, trigger_mode, samples)
    }

    fn linked_driver(&self, stimulus: StimulusHandle) -> Option<DriverHandle> {
        self.drivers.iter().find_map(|(&kind, pool)| {
            pool.iter_held().find_map(|(index, d)| {
                d.link
                    .filter(|l| l.stimulus == stimulus)
                    .and_then(|_| pool.held_handle(index))
                    .map(|inner| DriverHandle { kind, inner })
            })
        })
    }

    /// Feed `driver` from `stimulus`, expecting `read_count` samples back.
    pub fn link(&mut self, driver: DriverHandle, stimulus: StimulusHandle, read_count: u16) -> Result<()> {
        self.stimuli.get(stimulus)?;
        self.driver(driver)?;
        if let Some(other) = self.linked_driver(stimulus) {
            if other != driver {
                return Err(Error::AlreadyInUse {
                    kind: ResourceKind::Stimulus,
                    id: stimulus.index().to_string(),
                });
            }
        }
        let link = StimulusLink {
            stimulus,
            read_count,
        };
        let d = self.driver_mut(driver)?;
        if d.link != Some(link) {
            d.link = Some(link);
            d.dirty |= Dirty::LINK;
        }
        Ok(())
    }

    pub fn unlink(&mut self, driver: DriverHandle) -> Result<()> {
        let d = self.driver_mut(driver)?;
        if d.link.take().is_some() {
            d.dirty.remove(Dirty::LINK);
            self.pending_unlink.insert((driver.kind, driver.id()));
        }
        Ok(())
    }

    // ----- synchronization -----

    /// Whether anything awaits a device write.
    pub fn is_clean(&self) -> bool {
        self.pending_unbind.is_empty()
            && self.pending_unlink.is_empty()
            && self.pins.iter_held().all(|(_, p)| !p.dirty)
            && self.stimuli.iter_held().all(|(_, s)| !s.dirty)
            && self
                .drivers
                .values()
                .all(|pool| pool.iter_held().all(|(_, d)| d.dirty.is_empty()))
    }

    fn held_drivers(&self) -> Vec<(DriverHandle, &Driver)> {
        let mut held: Vec<_> = self
            .drivers
            .iter()
            .flat_map(|(&kind, pool)| {
                pool.iter_held().filter_map(move |(index, d)| {
                    pool.held_handle(index)
                        .map(|inner| (DriverHandle { kind, inner }, d))
                })
            })
            .collect();
        held.sort_by_key(|(h, _)| (h.kind, h.id()));
        held
    }

    /// Frames that bring the device in line with the host state.
    ///
    /// Order: unbinds, unlinks, driver configs, stimuli, wiring, pins,
    /// links. Drivers whose wiring emptied have nothing to send and are
    /// marked clean here.
    pub fn sync_plan(&mut self) -> Vec<SyncStep> {
        let mut emptied = Vec::new();
        for (handle, d) in self.held_drivers() {
            if d.dirty.contains(Dirty::WIRING) && d.pins.is_empty() {
                emptied.push(handle);
            }
        }
        for handle in emptied {
            if let Ok(d) = self.driver_mut(handle) {
                d.dirty.remove(Dirty::WIRING);
            }
        }

        let mut steps = Vec::new();

        if !self.pending_unbind.is_empty() {
            let ids: Vec<u8> = self.pending_unbind.iter().copied().collect();
            let mut payload = vec![ids.len() as u8];
            for &id in &ids {
                payload.extend_from_slice(&unbind_entry(id));
            }
            steps.push(SyncStep {
                target: SyncTarget::Unbind(ids),
                frame: Frame::new(Opcode::DriverPinMatrix, payload),
            });
        }

        for &(kind, id) in &self.pending_unlink {
            steps.push(SyncStep {
                target: SyncTarget::Unlink(kind, id),
                frame: Frame::new(Opcode::StimulusDriverMatrix, unlink_payload(kind, id)),
            });
        }

        let drivers = self.held_drivers();

        for (handle, d) in &drivers {
            if d.dirty.contains(Dirty::CONFIG) {
                if let Some(payload) = d.config_payload() {
                    steps.push(SyncStep {
                        target: SyncTarget::DriverConfig(*handle),
                        frame: Frame::new(Opcode::Driver, payload),
                    });
                }
            }
        }

        for (index, s) in self.stimuli.iter_held() {
            if let (true, Some(handle)) = (s.dirty, self.stimuli.held_handle(index)) {
                steps.push(SyncStep {
                    target: SyncTarget::Stimulus(handle),
                    frame: Frame::new(Opcode::Stimulus, s.payload()),
                });
            }
        }

        for (handle, d) in &drivers {
            if !d.dirty.contains(Dirty::WIRING) {
                continue;
            }
            let entries: Vec<Vec<u8>> = d
                .pins
                .iter()
                .filter_map(|(&role, &pin)| {
                    self.pins
                        .get(pin)
                        .ok()
                        .map(|p| d.matrix_entry(role, p.id().wire_id()))
                })
                .collect();
            let mut payload = vec![entries.len() as u8];
            for entry in entries {
                payload.extend_from_slice(&entry);
            }
            steps.push(SyncStep {
                target: SyncTarget::Wiring(*handle),
                frame: Frame::new(Opcode::DriverPinMatrix, payload),
            });
        }

        for (index, p) in self.pins.iter_held() {
            if let (true, Some(handle)) = (p.dirty, self.pins.held_handle(index)) {
                steps.push(SyncStep {
                    target: SyncTarget::Pin(handle),
                    frame: Frame::new(Opcode::Pin, p.payload()),
                });
            }
        }

        for (handle, d) in &drivers {
            if let (true, Some(link)) = (d.dirty.contains(Dirty::LINK), d.link) {
                steps.push(SyncStep {
                    target: SyncTarget::Link(*handle),
                    frame: Frame::new(
                        Opcode::StimulusDriverMatrix,
                        link_payload(
                            link.stimulus.index() as u8,
                            handle.kind,
                            handle.id(),
                            link.read_count,
                        ),
                    ),
                });
            }
        }

        steps
    }

    /// Clear the dirty state an acknowledged step covered.
    pub fn acknowledge(&mut self, target: &SyncTarget) {
        match target {
            SyncTarget::Unbind(ids) => {
                for id in ids {
                    self.pending_unbind.remove(id);
                }
            }
            SyncTarget::Unlink(kind, id) => {
                self.pending_unlink.remove(&(*kind, *id));
            }
            SyncTarget::DriverConfig(h) => self.clear_driver(*h, Dirty::CONFIG),
            SyncTarget::Wiring(h) => self.clear_driver(*h, Dirty::WIRING),
            SyncTarget::Link(h) => self.clear_driver(*h, Dirty::LINK),
            SyncTarget::Stimulus(h) => {
                if let Ok(s) = self.stimuli.get_mut(*h) {
                    s.dirty = false;
                }
            }
            SyncTarget::Pin(h) => {
                if let Ok(p) = self.pins.get_mut(*h) {
                    p.dirty = false;
                }
            }
        }
    }

    /// Mark everything held as unknown to the device, e.g. after a reset
    /// wiped its configuration. Pending unbinds and unlinks are dropped.
    pub fn invalidate(&mut self) {
        self.pending_unbind.clear();
        self.pending_unlink.clear();

        let held: Vec<usize> = self.pins.iter_held().map(|(i, _)| i).collect();
        for index in held {
            if let Some(pin) = self.pins.slot_mut(index) {
                pin.dirty = true;
            }
        }

        let programmed: Vec<usize> = self
            .stimuli
            .iter_held()
            .filter(|(_, s)| !s.samples().is_empty())
            .map(|(i, _)| i)
            .collect();
        for index in programmed {
            if let Some(s) = self.stimuli.slot_mut(index) {
                s.dirty = true;
            }
        }

        for pool in self.drivers.values_mut() {
            let held: Vec<usize> = pool.iter_held().map(|(i, _)| i).collect();
            for index in held {
                if let Some(d) = pool.slot_mut(index) {
                    if d.config_payload().is_some() {
                        d.dirty |= Dirty::CONFIG;
                    }
                    if !d.pins.is_empty() {
                        d.dirty |= Dirty::WIRING;
                    }
                    if d.link.is_some() {
                        d.dirty |= Dirty::LINK;
                    }
                }
            }
        }
        debug!("Resource state invalidated");
    }

    fn clear_driver(&mut self, handle: DriverHandle, bits: Dirty) {
        if let Ok(d) = self.driver_mut(handle) {
            d.dirty.remove(bits);
        }
    }
}

/// Handles taken on behalf of one config object, so a construction that
/// fails halfway can hand everything back.
#[derive(Debug, Default)]
pub(crate) struct Claim {
    drivers: Vec<DriverHandle>,
    pins: Vec<PinHandle>,
    stimuli: Vec<StimulusHandle>,
}

impl Claim {
    pub(crate) fn driver(&mut self, r: &mut Resources, kind: DriverType) -> Result<DriverHandle> {
        let handle = r.acquire_next_driver(kind)?;
        self.drivers.push(handle);
        Ok(handle)
    }

    /// The named pin, or the next free one.
    pub(crate) fn pin(&mut self, r: &mut Resources, id: Option<PinId>) -> Result<PinHandle> {
        let handle = match id {
            Some(id) => r.acquire_pin(id)?,
            None => r.acquire_next_pin()?,
        };
        self.pins.push(handle);
        Ok(handle)
    }

    pub(crate) fn stimulus(&mut self, r: &mut Resources) -> Result<StimulusHandle> {
        let handle = r.acquire_next_stimulus()?;
        self.stimuli.push(handle);
        Ok(handle)
    }

    /// Return every handle, drivers first so their wiring goes with them.
    /// Keeps going past failures and reports the first.
    pub(crate) fn release(self, r: &mut Resources) -> Result<()> {
        let mut results = Vec::new();
        for handle in self.drivers {
            results.push(r.release_driver(handle));
        }
        for handle in self.stimuli {
            results.push(r.release_stimulus(handle));
        }
        for handle in self.pins {
            results.push(r.release_pin(handle));
        }
        results.into_iter().collect()
    }
}
