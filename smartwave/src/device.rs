//! Connection to one SmartWave device.
//!
//! A [`Connection`] owns the session and the resource allocator of one
//! device. Every host operation is a request the device acknowledges, so
//! each method here suspends until that acknowledgment arrives or the
//! configured reply timeout elapses.
//!
//! Resource changes only touch host state; [`Connection::synchronize`]
//! writes whatever differs from what the device last acknowledged. The
//! allocator lock is always taken before the session's operation lock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, MutexGuard};
use tokio::time::{self, Instant};

use crate::config::{Config, MAX_VDDIO, MIN_VDDIO};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::protocol::{status, DeviceInfo, Frame, Opcode, Readback, StatusFlags, TriggerMode};
use crate::resource::{
    Claim, DriverHandle, DriverType, PinHandle, PinId, Resources, Role, StimulusHandle,
};
use crate::tracing::prelude::*;
use crate::transport::session::Exclusive;
use crate::transport::{
    self, discovery, ByteStream, CloseReason, PortIdentity, Session, SessionOptions,
};

const SYNC_DIVIDER: u16 = 1;
const SUBCYCLES: u16 = 0;
const MAX_FPGA_ADDRESS: u32 = 0xFF_FFFF;

/// Device-wide settings written by the General request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneralSettings {
    /// IO voltage in volts, 10 mV resolution
    pub vddio: f32,
    pub trigger_mode: TriggerMode,
}

impl GeneralSettings {
    fn validate(&self) -> Result<()> {
        if (MIN_VDDIO..=MAX_VDDIO).contains(&self.vddio) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "vddio {:.2} V outside {:.1}-{:.1} V",
                self.vddio, MIN_VDDIO, MAX_VDDIO
            )))
        }
    }

    fn payload(&self) -> Vec<u8> {
        let vddio = (self.vddio * 100.0).round() as u16;
        let mut p = Vec::with_capacity(7);
        p.extend_from_slice(&SYNC_DIVIDER.to_be_bytes());
        p.extend_from_slice(&SUBCYCLES.to_be_bytes());
        p.push(self.trigger_mode.as_u8());
        p.extend_from_slice(&vddio.to_be_bytes());
        p
    }
}

struct Inner {
    session: Session,
    resources: AsyncMutex<Resources>,
    /// Claims dropped while the allocator was held elsewhere
    deferred: Mutex<Vec<Claim>>,
    general: Mutex<GeneralSettings>,
    info: Mutex<Option<DeviceInfo>>,
    port: PortIdentity,
    config: Config,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}

/// Open connection to one device. Cheap to clone; the session closes when
/// the last clone is dropped or on [`disconnect`](Self::disconnect).
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Run the handshake over an already open byte stream.
    pub async fn open(stream: impl ByteStream, config: Config) -> Result<Self> {
        Self::handshake(stream, PortIdentity::unnamed(), config).await
    }

    /// Open `port` and run the handshake. Ports enumerating as some other
    /// USB device are refused.
    pub async fn connect(port: &str, config: Config) -> Result<Self> {
        let identity = discovery::identify(port)?;
        let stream = transport::open_serial(port, config.connection.baud_rate)?;
        Self::handshake(stream, identity, config).await
    }

    /// Try every port with SmartWave USB ids until one completes the
    /// handshake.
    pub async fn scan_and_connect(config: Config) -> Result<Self> {
        let mut last_error = None;
        for candidate in discovery::candidate_ports()? {
            let attempt = match transport::open_serial(&candidate.port, config.connection.baud_rate)
            {
                Ok(stream) => Self::handshake(stream, candidate.clone(), config.clone()).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(port = %candidate, error = %e, "Handshake failed, trying next port");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(Error::NotConnected))
    }

    async fn handshake(stream: impl ByteStream, port: PortIdentity, config: Config) -> Result<Self> {
        let options = SessionOptions {
            keepalive: config.keepalive_interval(),
            event_capacity: config.connection.event_capacity,
            ..Default::default()
        };
        let general = GeneralSettings {
            vddio: config.connection.vddio,
            trigger_mode: config.connection.trigger_mode,
        };
        let connection = Connection {
            inner: Arc::new(Inner {
                session: Session::spawn(stream, options),
                resources: AsyncMutex::new(Resources::new(&config.resources)),
                deferred: Mutex::new(Vec::new()),
                general: Mutex::new(general),
                info: Mutex::new(None),
                port,
                config,
            }),
        };

        match connection.run_handshake().await {
            Ok(info) => {
                info!(port = %connection.inner.port, device = %info, "Connected to SmartWave");
                Ok(connection)
            }
            Err(e) => {
                debug!(error = %e, "Handshake failed");
                connection.disconnect().await;
                Err(e)
            }
        }
    }

    async fn run_handshake(&self) -> Result<DeviceInfo> {
        let connection = &self.inner.config.connection;
        if connection.reset_on_connect {
            self.reset().await?;
        }
        if connection.configure_on_connect {
            self.configure_general(None, None).await?;
        }
        self.request_info().await
    }

    /// Close the session. Pending and later operations fail.
    pub async fn disconnect(&self) {
        self.inner.session.close(CloseReason::Disconnected).await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.session.close_reason()
    }

    pub fn port(&self) -> &PortIdentity {
        &self.inner.port
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Versions reported by the last [`request_info`](Self::request_info).
    pub fn info(&self) -> Option<DeviceInfo> {
        *self.inner.info.lock()
    }

    pub(crate) fn session(&self) -> &Session {
        &self.inner.session
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        self.inner.config.reply_timeout()
    }

    async fn request(&self, frame: Frame) -> Result<Frame> {
        self.inner.session.request(frame, self.reply_timeout()).await
    }

    // ----- device control -----

    /// Clear the device configuration. Everything held is rewritten by the
    /// next synchronization.
    pub async fn reset(&self) -> Result<()> {
        let mut resources = self.resources().await;
        self.request(Frame::empty(Opcode::Reset)).await?;
        resources.invalidate();
        Ok(())
    }

    /// Start (or, in toggle mode, stop) the loaded configuration.
    pub async fn trigger(&self) -> Result<()> {
        self.request(Frame::empty(Opcode::Trigger)).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Frame::empty(Opcode::Stop)).await?;
        Ok(())
    }

    /// Write the General settings, replacing the given fields. The host
    /// copy only changes once the device acknowledged.
    pub async fn configure_general(
        &self,
        vddio: Option<f32>,
        trigger_mode: Option<TriggerMode>,
    ) -> Result<()> {
        let current = *self.inner.general.lock();
        let next = GeneralSettings {
            vddio: vddio.unwrap_or(current.vddio),
            trigger_mode: trigger_mode.unwrap_or(current.trigger_mode),
        };
        next.validate()?;
        self.request(Frame::new(Opcode::General, next.payload()))
            .await?;
        *self.inner.general.lock() = next;
        debug!(vddio = next.vddio, mode = %next.trigger_mode, "General settings written");
        Ok(())
    }

    pub fn general(&self) -> GeneralSettings {
        *self.inner.general.lock()
    }

    pub async fn set_vddio(&self, vddio: f32) -> Result<()> {
        self.configure_general(Some(vddio), None).await
    }

    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> Result<()> {
        self.configure_general(None, Some(mode)).await
    }

    /// Ask the device for its hardware, firmware and bitstream versions.
    pub async fn request_info(&self) -> Result<DeviceInfo> {
        let reply = self.request(Frame::empty(Opcode::Info)).await?;
        if !reply.status.contains(StatusFlags::INFO) {
            return Err(Error::MalformedFrame(format!(
                "Info reply without info status ({:?})",
                reply.status
            )));
        }
        let info = DeviceInfo::parse(&reply.payload)?;
        *self.inner.info.lock() = Some(info);
        Ok(info)
    }

    // ----- FPGA registers -----

    pub async fn write_fpga_register(&self, address: u32, value: u32) -> Result<()> {
        check_fpga_address(address)?;
        let mut payload = address.to_be_bytes()[1..].to_vec();
        payload.extend_from_slice(&value.to_be_bytes());
        self.request(Frame::new(Opcode::FpgaWrite, payload)).await?;
        trace!(address, value, "FPGA register written");
        Ok(())
    }

    pub async fn read_fpga_register(&self, address: u32) -> Result<u32> {
        check_fpga_address(address)?;
        let reply = self
            .request(Frame::new(Opcode::FpgaRead, address.to_be_bytes()[1..].to_vec()))
            .await?;
        if !reply.status.contains(StatusFlags::SINGLE_ADDRESS_READ) {
            return Err(Error::MalformedFrame(format!(
                "FpgaRead reply without register value ({:?})",
                reply.status
            )));
        }
        status::register_value(&reply.payload)
    }

    // ----- resources -----

    /// Lock the allocator for several changes in a row.
    pub async fn resources(&self) -> MutexGuard<'_, Resources> {
        let mut guard = self.inner.resources.lock().await;
        self.release_deferred(&mut guard);
        guard
    }

    /// Lock the allocator, giving up at `deadline`.
    pub(crate) async fn resources_until(
        &self,
        deadline: Instant,
        opcode: Opcode,
    ) -> Result<MutexGuard<'_, Resources>> {
        time::timeout_at(deadline, self.resources())
            .await
            .map_err(|_| Error::Timeout(opcode))
    }

    /// Hand back the resources of a config dropped without `release()`.
    ///
    /// Host-side only; the device is unwired by the next synchronization.
    /// When the allocator is busy the claim is queued and returned by
    /// whoever locks it next.
    pub(crate) fn release_on_drop(&self, claim: Claim) {
        match self.inner.resources.try_lock() {
            Ok(mut r) => {
                self.release_deferred(&mut r);
                if let Err(e) = claim.release(&mut r) {
                    warn!(error = %e, "Release of dropped config failed");
                }
            }
            Err(_) => {
                debug!("Allocator busy, deferring release of dropped config");
                self.inner.deferred.lock().push(claim);
            }
        }
    }

    fn release_deferred(&self, resources: &mut Resources) {
        let claims = std::mem::take(&mut *self.inner.deferred.lock());
        for claim in claims {
            if let Err(e) = claim.release(resources) {
                warn!(error = %e, "Deferred release failed");
            }
        }
    }

    /// Acquire a pin by name, e.g. `"A1"`.
    pub async fn acquire_pin(&self, name: &str) -> Result<PinHandle> {
        let id: PinId = name.parse()?;
        self.resources().await.acquire_pin(id)
    }

    pub async fn acquire_next_pin(&self) -> Result<PinHandle> {
        self.resources().await.acquire_next_pin()
    }

    pub async fn release_pin(&self, pin: PinHandle) -> Result<()> {
        self.resources().await.release_pin(pin)
    }

    pub async fn acquire_driver(&self, kind: DriverType) -> Result<DriverHandle> {
        self.resources().await.acquire_next_driver(kind)
    }

    pub async fn acquire_driver_by_id(&self, kind: DriverType, id: u8) -> Result<DriverHandle> {
        self.resources().await.acquire_driver(kind, id)
    }

    pub async fn release_driver(&self, driver: DriverHandle) -> Result<()> {
        self.resources().await.release_driver(driver)
    }

    pub async fn acquire_stimulus(&self) -> Result<StimulusHandle> {
        self.resources().await.acquire_next_stimulus()
    }

    pub async fn acquire_stimulus_by_id(&self, id: u8) -> Result<StimulusHandle> {
        self.resources().await.acquire_stimulus(id)
    }

    pub async fn release_stimulus(&self, stimulus: StimulusHandle) -> Result<()> {
        self.resources().await.release_stimulus(stimulus)
    }

    pub async fn bind_pin(&self, driver: DriverHandle, role: Role, pin: PinHandle) -> Result<()> {
        self.resources().await.bind_pin(driver, role, pin)
    }

    /// Detach the pin filling `role`, returning it to the caller.
    pub async fn remove_pin_connection(
        &self,
        driver: DriverHandle,
        role: Role,
    ) -> Result<Option<PinHandle>> {
        self.resources().await.unbind_role(driver, role)
    }

    /// Write every change the device has not acknowledged yet; returns the
    /// number of frames written.
    ///
    /// Stops at the first failed frame: whatever was acknowledged before it
    /// is clean, the rest stays dirty for the next attempt.
    pub async fn synchronize(&self) -> Result<usize> {
        let mut resources = self.resources().await;
        self.synchronize_locked(&mut resources).await
    }

    pub(crate) async fn synchronize_locked(&self, resources: &mut Resources) -> Result<usize> {
        self.synchronize_by(resources, None).await
    }

    /// Like [`synchronize_locked`](Self::synchronize_locked), but every
    /// frame must be acknowledged before `deadline`.
    pub(crate) async fn synchronize_by(
        &self,
        resources: &mut Resources,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let steps = resources.sync_plan();
        let Some(first) = steps.first() else {
            return Ok(0);
        };
        let exclusive: Exclusive = match deadline {
            Some(deadline) => time::timeout_at(deadline, self.inner.session.exclusive())
                .await
                .map_err(|_| Error::Timeout(first.frame.opcode))?,
            None => self.inner.session.exclusive().await,
        };
        for step in &steps {
            let timeout = match deadline {
                Some(deadline) => time_left(deadline, step.frame.opcode)
                    .map(|left| left.min(self.reply_timeout())),
                None => Ok(self.reply_timeout()),
            };
            let result = match timeout {
                Ok(timeout) => exclusive.request(step.frame.clone(), timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(step = ?step.target, error = %e, "Synchronization stopped");
                return Err(e);
            }
            resources.acknowledge(&step.target);
        }
        debug!(frames = steps.len(), "Synchronized");
        Ok(steps.len())
    }

    /// Run the loaded configuration once and collect what `recorder`
    /// recorded.
    pub(crate) async fn trigger_readback(&self, recorder: u8, timeout: Duration) -> Result<Readback> {
        let reply = self
            .inner
            .session
            .request(Frame::new(Opcode::Trigger, vec![recorder]), timeout)
            .await?;
        if !reply.status.contains(StatusFlags::READBACK) {
            return Err(Error::MalformedFrame(format!(
                "Trigger reply without readback ({:?})",
                reply.status
            )));
        }
        let readback = Readback::parse(&reply.payload)?;
        if readback.recorder != recorder {
            return Err(Error::MalformedFrame(format!(
                "readback from recorder {} while waiting for {}",
                readback.recorder, recorder
            )));
        }
        Ok(readback)
    }

    // ----- notifications -----

    /// Subscribe to unsolicited device events.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.session.subscribe()
    }

    /// Last input level the device reported for `pin`.
    pub fn input_level(&self, pin: PinId) -> bool {
        self.inner.session.input_levels().level(pin.index())
    }

    /// Call `callback` on the receive task whenever `pin` changes level.
    /// Replaces any earlier callback for the pin.
    pub fn on_input_level<F>(&self, pin: PinId, callback: F)
    where
        F: Fn(PinId, bool) + Send + Sync + 'static,
    {
        self.inner
            .session
            .set_level_listener(pin, Some(Arc::new(callback)));
    }

    pub fn clear_input_listener(&self, pin: PinId) {
        self.inner.session.set_level_listener(pin, None);
    }
}

/// Time left until `deadline`; a timeout for `opcode` once it has passed.
pub(crate) fn time_left(deadline: Instant, opcode: Opcode) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::Timeout(opcode))
    } else {
        Ok(left)
    }
}

fn check_fpga_address(address: u32) -> Result<()> {
    if address > MAX_FPGA_ADDRESS {
        return Err(Error::InvalidArgument(format!(
            "FPGA address 0x{:x} exceeds 24 bits",
            address
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_payload_layout() {
        let settings = GeneralSettings {
            vddio: 3.3,
            trigger_mode: TriggerMode::Toggle,
        };
        assert_eq!(settings.payload(), vec![0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x4a]);
    }

    #[test]
    fn vddio_range() {
        let mut settings = GeneralSettings {
            vddio: 1.7,
            trigger_mode: TriggerMode::Single,
        };
        assert!(matches!(settings.validate(), Err(Error::InvalidArgument(_))));
        settings.vddio = 5.0;
        assert!(settings.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_runs_out() {
        let deadline = Instant::now() + Duration::from_millis(100);
        assert_eq!(
            time_left(deadline, Opcode::Trigger).unwrap(),
            Duration::from_millis(100)
        );
        time::advance(Duration::from_millis(100)).await;
        assert!(matches!(
            time_left(deadline, Opcode::Trigger),
            Err(Error::Timeout(Opcode::Trigger))
        ));
    }

    #[test]
    fn fpga_addresses_are_24_bit() {
        assert!(check_fpga_address(0xFF_FFFF).is_ok());
        assert!(check_fpga_address(0x100_0000).is_err());
    }
}
