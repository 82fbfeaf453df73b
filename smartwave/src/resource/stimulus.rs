//! Stimulus generator slots.
//!
//! A stimulus plays a list of samples into the driver it is linked to; the
//! same slot records what the driver reads back and acts as the recorder
//! for that run.

use strum::{Display, FromRepr};

use super::DriverType;
use crate::error::{Error, Result};
use crate::protocol::frame::MAX_PAYLOAD;
use crate::protocol::TriggerMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum StimulusType {
    Arbitrary = 0x00,
    NoStimulus = 0x01,
}

const HEADER_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct Stimulus {
    id: u8,
    sample_width: u8,
    trigger_mode: TriggerMode,
    samples: Vec<u32>,
    pub(crate) dirty: bool,
}

impl Stimulus {
    pub(crate) fn new(id: u8) -> Self {
        Self {
            id,
            sample_width: 8,
            trigger_mode: TriggerMode::Single,
            samples: Vec::new(),
            dirty: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn sample_width(&self) -> u8 {
        self.sample_width
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger_mode
    }

    pub fn samples(&self) -> &[u32] {
        &self.samples
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the program; marks the slot dirty only if anything changed.
    pub(crate) fn program(
        &mut self,
        sample_width: u8,
        trigger_mode: TriggerMode,
        samples: &[u32],
    ) -> Result<bool> {
        if !matches!(sample_width, 8 | 16 | 24 | 32) {
            return Err(Error::InvalidArgument(format!(
                "sample width {} is not 8, 16, 24 or 32 bits",
                sample_width
            )));
        }
        let bytes = samples.len() * (sample_width as usize / 8);
        if samples.len() > u16::MAX as usize || HEADER_LEN + bytes > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "{} samples of {} bits do not fit one stimulus",
                samples.len(),
                sample_width
            )));
        }

        let changed = self.sample_width != sample_width
            || self.trigger_mode != trigger_mode
            || self.samples != samples;
        if changed {
            self.sample_width = sample_width;
            self.trigger_mode = trigger_mode;
            self.samples = samples.to_vec();
            self.dirty = true;
        }
        Ok(changed)
    }

    pub(crate) fn payload(&self) -> Vec<u8> {
        let width = self.sample_width as usize / 8;
        let mut p = Vec::with_capacity(HEADER_LEN + self.samples.len() * width);
        p.push(StimulusType::Arbitrary as u8);
        p.push(self.id);
        p.push(self.sample_width);
        p.push(if self.trigger_mode == TriggerMode::Toggle { 0 } else { 1 });
        p.extend_from_slice(&(self.samples.len() as u16).to_be_bytes());
        for sample in &self.samples {
            p.extend_from_slice(&sample.to_be_bytes()[4 - width..]);
        }
        p
    }

    pub(crate) fn reset(&mut self) {
        self.sample_width = 8;
        self.trigger_mode = TriggerMode::Single;
        self.samples.clear();
        self.dirty = false;
    }
}

/// StimulusDriverMatrix payload linking `stimulus` to a driver.
pub(crate) fn link_payload(stimulus: u8, driver: DriverType, driver_id: u8, read_count: u16) -> Vec<u8> {
    let mut p = vec![
        StimulusType::Arbitrary as u8,
        stimulus,
        driver.as_u8(),
        driver_id,
    ];
    p.extend_from_slice(&read_count.to_be_bytes());
    p
}

/// StimulusDriverMatrix payload detaching whatever stimulus feeds a driver.
pub(crate) fn unlink_payload(driver: DriverType, driver_id: u8) -> Vec<u8> {
    vec![
        StimulusType::NoStimulus as u8,
        0,
        driver.as_u8(),
        driver_id,
        0xff,
        0xff,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_splits_samples_by_width() {
        let mut s = Stimulus::new(2);
        s.program(16, TriggerMode::Single, &[0x1234, 0xabcd]).unwrap();
        assert_eq!(
            s.payload(),
            vec![0x00, 2, 16, 1, 0, 2, 0x12, 0x34, 0xab, 0xcd]
        );
    }

    #[test]
    fn toggle_mode_byte() {
        let mut s = Stimulus::new(0);
        s.program(8, TriggerMode::Toggle, &[0xa, 0xb]).unwrap();
        assert_eq!(s.payload(), vec![0x00, 0, 8, 0, 0, 2, 0x0a, 0x0b]);
    }

    #[test]
    fn reprogramming_same_samples_stays_clean() {
        let mut s = Stimulus::new(0);
        assert!(s.program(32, TriggerMode::Single, &[1, 2, 3]).unwrap());
        s.dirty = false;
        assert!(!s.program(32, TriggerMode::Single, &[1, 2, 3]).unwrap());
        assert!(!s.is_dirty());
        assert!(s.program(32, TriggerMode::Single, &[1, 2]).unwrap());
        assert!(s.is_dirty());
    }

    #[test]
    fn rejects_odd_width() {
        let mut s = Stimulus::new(0);
        assert!(matches!(
            s.program(12, TriggerMode::Single, &[1]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_oversized_program() {
        let mut s = Stimulus::new(0);
        let samples = vec![0u32; 20_000];
        assert!(s.program(32, TriggerMode::Single, &samples).is_err());
    }

    #[test]
    fn matrix_payloads() {
        assert_eq!(
            link_payload(1, DriverType::I2c, 0, 7),
            vec![0x00, 1, 0x01, 0, 0, 7]
        );
        assert_eq!(
            unlink_payload(DriverType::Spi, 1),
            vec![0x01, 0, 0x00, 1, 0xff, 0xff]
        );
    }
}
