//! Serial capture parsing and frame reassembly.
//!
//! A capture is a text file with one chunk of bytes per line:
//!
//! ```text
//! # time_s,direction,bytes
//! 0.001200,host,a50a0000000100d6
//! 0.001950,device,a50a00000001...
//! ```
//!
//! Chunks arrive however the capture tool split them, so bytes are buffered
//! per direction and cut into frames using the header's length field.

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use smartwave::protocol::frame::{CRC_LEN, HEADER_LEN, SYNC};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToDevice => write!(f, "TX"),
            Direction::DeviceToHost => write!(f, "RX"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "tx" => Ok(Direction::HostToDevice),
            "device" | "rx" => Ok(Direction::DeviceToHost),
            other => bail!("unknown direction '{}'", other),
        }
    }
}

/// One line of a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureChunk {
    pub timestamp: f64,
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// Parse one capture line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<CaptureChunk>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.splitn(3, ',');
    let (Some(time), Some(direction), Some(bytes)) = (fields.next(), fields.next(), fields.next())
    else {
        bail!("expected time,direction,bytes");
    };
    let timestamp = time
        .trim()
        .parse()
        .with_context(|| format!("bad timestamp '{}'", time))?;
    let compact: String = bytes.chars().filter(|c| !c.is_whitespace()).collect();
    let data = hex::decode(&compact).with_context(|| format!("bad hex '{}'", bytes.trim()))?;

    Ok(Some(CaptureChunk {
        timestamp,
        direction: direction.parse()?,
        data,
    }))
}

/// Raw frame bytes cut from a direction's byte stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialFrame {
    /// Time of the chunk holding the first byte
    pub start_time: f64,
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// Something the assembler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Frame(SerialFrame),
    /// Bytes skipped while hunting for a sync byte
    Garbage {
        timestamp: f64,
        direction: Direction,
        data: Vec<u8>,
    },
}

/// Reassembles frames for one direction.
#[derive(Debug)]
pub struct FrameAssembler {
    direction: Direction,
    buffer: BytesMut,
    start_time: Option<f64>,
}

impl FrameAssembler {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buffer: BytesMut::new(),
            start_time: None,
        }
    }

    /// Add a chunk and return every frame it completed.
    pub fn push(&mut self, timestamp: f64, data: &[u8]) -> Vec<Assembled> {
        if self.buffer.is_empty() {
            self.start_time = Some(timestamp);
        }
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        loop {
            let skip = self
                .buffer
                .iter()
                .position(|&b| b == SYNC)
                .unwrap_or(self.buffer.len());
            if skip > 0 {
                out.push(Assembled::Garbage {
                    timestamp: self.start_time.unwrap_or(timestamp),
                    direction: self.direction,
                    data: self.buffer.split_to(skip).to_vec(),
                });
                self.start_time = Some(timestamp);
            }
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let len = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
            let total = HEADER_LEN + len + CRC_LEN;
            if self.buffer.len() < total {
                break;
            }
            out.push(Assembled::Frame(SerialFrame {
                start_time: self.start_time.unwrap_or(timestamp),
                direction: self.direction,
                data: self.buffer.split_to(total).to_vec(),
            }));
            self.start_time = Some(timestamp);
        }
        out
    }

    /// Bytes left over at the end of the capture.
    pub fn finish(&mut self) -> Option<Assembled> {
        if !self.buffer.has_remaining() {
            return None;
        }
        let data = self.buffer.split().to_vec();
        Some(Assembled::Garbage {
            timestamp: self.start_time.unwrap_or_default(),
            direction: self.direction,
            data,
        })
    }
}
