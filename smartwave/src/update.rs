//! Firmware and FPGA bitstream upload.
//!
//! Both uploads hold the operation lock from start to finish and follow the
//! same shape: a start request announcing length and checksum, the image in
//! fixed-size chunks, and a final request the device answers once it has
//! checked the image. Firmware additionally waits for the bootloader to
//! report ready; a bitstream may carry a clock divider.
//!
//! Any failure leaves the device in an unknown state. The session is closed
//! with [`CloseReason::UpdateFailed`] and the caller has to reconnect.

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use strum::Display;

use crate::device::Connection;
use crate::error::{Error, Result};
use crate::protocol::{Frame, Opcode, StatusFlags, UpdateStatus};
use crate::tracing::prelude::*;
use crate::transport::session::Exclusive;
use crate::transport::CloseReason;

/// Flash offset where the application firmware begins.
pub const FIRMWARE_START: usize = 0x9000;
/// Flash offset where the application firmware ends.
pub const FIRMWARE_END: usize = 0x18200;
/// Size of a cropped firmware image.
pub const FIRMWARE_LEN: usize = FIRMWARE_END - FIRMWARE_START;
/// Size of every FPGA bitstream.
pub const BITSTREAM_LEN: usize = 0x21_728C;

// Zero bytes a raw flash dump must carry after the firmware region.
const RAW_PADDING: usize = 16;
const CHECKSUM_SEED: u32 = 0xC0DE_F19E;

/// First payload byte of update requests.
pub mod command {
    pub const CHUNK: u8 = 0x01;
    pub const FINISH: u8 = 0x02;
    pub const CLOCK_DIVIDER: u8 = 0x03;
    pub const ENTER_BOOTLOADER: u8 = 0x1B;
    pub const START_BITSTREAM: u8 = 0x1C;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UpdateState {
    Idle,
    BootloaderEntry,
    Transferring,
    Verifying,
    Complete,
    Failed,
}

/// Reported on every state change and after every acknowledged chunk.
/// A failed update reports `Failed` before the session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub state: UpdateState,
    pub sent: usize,
    pub total: usize,
}

impl UpdateProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.sent * 100 / self.total) as u8
    }
}

fn checksum(data: &[u8], word: fn([u8; 4]) -> u32) -> u32 {
    data.chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            word(w)
        })
        .fold(CHECKSUM_SEED, u32::wrapping_add)
}

/// Microcontroller application image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Bytes,
    checksum: u32,
}

impl FirmwareImage {
    /// Accept a cropped image or a raw flash dump, extracting the
    /// application region from the latter.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let data = if raw.len() == FIRMWARE_LEN {
            raw
        } else if raw.len() >= FIRMWARE_END + RAW_PADDING {
            let padding = &raw[FIRMWARE_END..FIRMWARE_END + RAW_PADDING];
            if padding.iter().any(|&b| b != 0) {
                return Err(Error::InvalidArgument(
                    "firmware overruns the application region".into(),
                ));
            }
            &raw[FIRMWARE_START..FIRMWARE_END]
        } else {
            return Err(Error::InvalidArgument(format!(
                "{} bytes is neither a cropped firmware ({} bytes) nor a flash dump",
                raw.len(),
                FIRMWARE_LEN
            )));
        };
        Ok(Self {
            checksum: checksum(data, u32::from_le_bytes),
            data: Bytes::copy_from_slice(data),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// FPGA configuration image.
#[derive(Debug, Clone)]
pub struct Bitstream {
    data: Bytes,
    checksum: u32,
    clock_divider: Option<u16>,
}

impl Bitstream {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != BITSTREAM_LEN {
            return Err(Error::InvalidArgument(format!(
                "bitstream of 0x{:x} bytes, expected 0x{:x}",
                raw.len(),
                BITSTREAM_LEN
            )));
        }
        Ok(Self {
            checksum: checksum(raw, u32::from_be_bytes),
            data: Bytes::copy_from_slice(raw),
            clock_divider: None,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Ask the device to reprogram the FPGA clock divider after the start
    /// request.
    pub fn with_clock_divider(mut self, divider: u16) -> Self {
        self.clock_divider = Some(divider);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

struct Plan<'a> {
    opcode: Opcode,
    start: u8,
    wait_for_bootloader: bool,
    clock_divider: Option<u16>,
    data: &'a [u8],
    checksum: u32,
}

impl Plan<'_> {
    fn start_payload(&self) -> Vec<u8> {
        let mut p = vec![self.start];
        p.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        p.extend_from_slice(&self.checksum.to_be_bytes());
        p
    }
}

fn chunk_payload(offset: usize, data: &[u8]) -> Vec<u8> {
    let mut p = Vec::with_capacity(5 + data.len());
    p.push(command::CHUNK);
    p.extend_from_slice(&(offset as u32).to_be_bytes());
    p.extend_from_slice(data);
    p
}

impl Connection {
    /// Replace the microcontroller firmware.
    pub async fn update_firmware<F>(&self, image: &FirmwareImage, progress: F) -> Result<()>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        let plan = Plan {
            opcode: Opcode::FirmwareUpdate,
            start: command::ENTER_BOOTLOADER,
            wait_for_bootloader: true,
            clock_divider: None,
            data: image.data(),
            checksum: image.checksum(),
        };
        info!(bytes = plan.data.len(), checksum = plan.checksum, "Updating firmware");
        self.run_update(plan, progress).await
    }

    /// Replace the FPGA bitstream.
    pub async fn update_bitstream<F>(&self, bitstream: &Bitstream, progress: F) -> Result<()>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        let plan = Plan {
            opcode: Opcode::FpgaUpdate,
            start: command::START_BITSTREAM,
            wait_for_bootloader: false,
            clock_divider: bitstream.clock_divider,
            data: bitstream.data(),
            checksum: bitstream.checksum(),
        };
        info!(bytes = plan.data.len(), checksum = plan.checksum, "Updating FPGA bitstream");
        self.run_update(plan, progress).await
    }

    async fn run_update<F>(&self, plan: Plan<'_>, mut progress: F) -> Result<()>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        let exclusive = self.session().exclusive().await;
        let mut current = UpdateProgress {
            state: UpdateState::Idle,
            sent: 0,
            total: plan.data.len(),
        };
        let result = self
            .transfer(&exclusive, &plan, &mut current, &mut progress)
            .await;
        drop(exclusive);

        match result {
            Ok(()) => {
                info!(opcode = %plan.opcode, "Update complete");
                Ok(())
            }
            Err(e) => {
                let reason = format!("{} while {}", e, current.state);
                error!(opcode = %plan.opcode, %reason, "Update aborted");
                current.state = UpdateState::Failed;
                progress(current);
                self.session()
                    .close(CloseReason::UpdateFailed(reason.clone()))
                    .await;
                Err(Error::UpdateFailed(reason))
            }
        }
    }

    async fn transfer<F>(
        &self,
        exclusive: &Exclusive,
        plan: &Plan<'_>,
        current: &mut UpdateProgress,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(UpdateProgress) + Send,
    {
        let config = &self.config().update;
        let ms = Duration::from_millis;
        let opcode = plan.opcode;
        let request = move |payload: Vec<u8>, timeout: Duration| {
            exclusive.request(Frame::new(opcode, payload), timeout)
        };

        let mut report = |state: UpdateState, sent: usize| {
            current.state = state;
            current.sent = sent;
            progress(*current);
        };

        report(UpdateState::BootloaderEntry, 0);
        let reply = request(plan.start_payload(), ms(config.bootloader_timeout_ms)).await?;
        if plan.wait_for_bootloader && !reply.status.contains(StatusFlags::BOOTLOADER_READY) {
            return Err(Error::UpdateFailed(format!(
                "bootloader not ready ({:?})",
                reply.status
            )));
        }
        if let Some(divider) = plan.clock_divider {
            let mut payload = vec![command::CLOCK_DIVIDER];
            payload.extend_from_slice(&divider.to_be_bytes());
            request(payload, self.reply_timeout()).await?;
        }

        let total = plan.data.len();
        let mut sent = 0;
        for chunk in plan.data.chunks(config.chunk_size.max(1)) {
            let reply = request(chunk_payload(sent, chunk), ms(config.chunk_timeout_ms)).await?;
            if reply.status.contains(StatusFlags::FIRMWARE_UPDATE_FAILED) {
                return Err(Error::UpdateFailed(format!("chunk at {} refused", sent)));
            }
            if reply.status.contains(StatusFlags::FIRMWARE_UPDATE_STATUS) {
                if let Ok(status) = UpdateStatus::parse(&reply.payload) {
                    trace!(%status, "Device update status");
                }
            }
            sent += chunk.len();
            report(UpdateState::Transferring, sent);
        }

        report(UpdateState::Verifying, total);
        let reply = request(vec![command::FINISH], ms(config.verify_timeout_ms)).await?;
        if !reply.status.contains(StatusFlags::FIRMWARE_UPDATE_OK)
            || reply.status.contains(StatusFlags::FIRMWARE_UPDATE_FAILED)
        {
            return Err(Error::UpdateFailed(format!(
                "device did not accept the image ({:?})",
                reply.status
            )));
        }

        report(UpdateState::Complete, total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cropped_firmware_checksum() {
        let mut raw = vec![0u8; FIRMWARE_LEN];
        raw[..8].copy_from_slice(&[1, 0, 0, 0, 0, 0, 0, 1]);
        let image = FirmwareImage::from_bytes(&raw).unwrap();
        assert_eq!(image.data().len(), FIRMWARE_LEN);
        assert_eq!(image.checksum(), 0xC0DE_F19E + 1 + 0x0100_0000);
    }

    #[test]
    fn raw_dump_is_cropped() {
        let mut raw = vec![0u8; FIRMWARE_END + RAW_PADDING + 32];
        raw[FIRMWARE_START] = 0xAA;
        raw[FIRMWARE_START - 1] = 0xFF;
        let image = FirmwareImage::from_bytes(&raw).unwrap();
        assert_eq!(image.data().len(), FIRMWARE_LEN);
        assert_eq!(image.data()[0], 0xAA);
        assert_eq!(image.checksum(), CHECKSUM_SEED.wrapping_add(0xAA));
    }

    #[test]
    fn raw_dump_with_overrun_rejected() {
        let mut raw = vec![0u8; FIRMWARE_END + RAW_PADDING];
        raw[FIRMWARE_END + 3] = 1;
        assert!(matches!(
            FirmwareImage::from_bytes(&raw),
            Err(Error::InvalidArgument(_))
        ));
        assert!(FirmwareImage::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn bitstream_checksum_is_big_endian() {
        let mut raw = vec![0u8; BITSTREAM_LEN];
        raw[3] = 0x01;
        raw[4] = 0x01;
        let bitstream = Bitstream::from_bytes(&raw).unwrap();
        assert_eq!(
            bitstream.checksum(),
            CHECKSUM_SEED.wrapping_add(1).wrapping_add(0x0100_0000)
        );
        assert!(Bitstream::from_bytes(&raw[1..]).is_err());
    }

    #[test]
    fn checksum_wraps() {
        let data = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            checksum(&data, u32::from_le_bytes),
            CHECKSUM_SEED.wrapping_sub(2)
        );
    }

    #[test]
    fn progress_percent() {
        let p = UpdateProgress {
            state: UpdateState::Transferring,
            sent: 512,
            total: 2048,
        };
        assert_eq!(p.percent(), 25);
    }

    #[test]
    fn start_payload_layout() {
        let data = [0u8; 8];
        let plan = Plan {
            opcode: Opcode::FirmwareUpdate,
            start: command::ENTER_BOOTLOADER,
            wait_for_bootloader: true,
            clock_divider: None,
            data: &data,
            checksum: 0x1122_3344,
        };
        assert_eq!(
            plan.start_payload(),
            vec![0x1B, 0, 0, 0, 8, 0x11, 0x22, 0x33, 0x44]
        );
        assert_eq!(chunk_payload(0x100, &[9]), vec![0x01, 0, 0, 1, 0, 9]);
    }
}
