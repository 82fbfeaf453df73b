//! Protocol dissection engine.

use crate::capture::{Direction, SerialFrame};
use colored::Colorize;
use smartwave::protocol::frame::{CRC_LEN, HEADER_LEN};
use smartwave::protocol::status::{self, StatusEvent};
use smartwave::protocol::{crc_is_valid, heartbeat, Frame, Opcode, StatusFlags, TriggerMode};
use smartwave::update::command;
use smartwave::DriverType;
use std::fmt;

/// Dissected frame with decoded content
#[derive(Debug)]
pub struct DissectedFrame {
    pub timestamp: f64,
    pub direction: Direction,
    pub raw_data: Vec<u8>,
    pub content: FrameContent,
    pub crc_status: CrcStatus,
}

/// Decoded frame content
#[derive(Debug, PartialEq)]
pub enum FrameContent {
    Request(String),
    Reply(String),
    Invalid(String),
}

impl fmt::Display for FrameContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameContent::Request(s) => write!(f, "{}", s),
            FrameContent::Reply(s) => write!(f, "{}", s.cyan()),
            FrameContent::Invalid(s) => write!(f, "{}", s.yellow()),
        }
    }
}

/// CRC validation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    Valid,
    Invalid,
    NotChecked,
}

impl fmt::Display for CrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrcStatus::Valid => write!(f, "{}", "CRC OK".green()),
            CrcStatus::Invalid => write!(f, "{}", "CRC FAIL".red()),
            CrcStatus::NotChecked => write!(f, ""),
        }
    }
}

impl fmt::Display for DissectedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>12.6} {} {} {}",
            self.timestamp, self.direction, self.content, self.crc_status
        )
    }
}

/// Dissect one reassembled frame
pub fn dissect_serial_frame(frame: &SerialFrame) -> DissectedFrame {
    let (content, crc_status) = dissect_bytes(frame.direction, &frame.data);
    DissectedFrame {
        timestamp: frame.start_time,
        direction: frame.direction,
        raw_data: frame.data.clone(),
        content,
        crc_status,
    }
}

fn dissect_bytes(direction: Direction, data: &[u8]) -> (FrameContent, CrcStatus) {
    if data.len() < HEADER_LEN + CRC_LEN {
        return (
            FrameContent::Invalid(format!("Frame too short: {} bytes", data.len())),
            CrcStatus::NotChecked,
        );
    }
    if !crc_is_valid(data) {
        let content = match data.get(1).copied().and_then(Opcode::from_repr) {
            Some(opcode) => FrameContent::Invalid(format!("{}(len={})", opcode, data.len())),
            None => FrameContent::Invalid(format!("Frame(len={})", data.len())),
        };
        return (content, CrcStatus::Invalid);
    }

    let frame = match status_frame(data) {
        Ok(frame) => frame,
        Err(e) => return (FrameContent::Invalid(e), CrcStatus::Valid),
    };
    let content = match direction {
        Direction::HostToDevice => FrameContent::Request(describe_request(&frame)),
        Direction::DeviceToHost => match describe_reply(&frame) {
            Ok(s) => FrameContent::Reply(s),
            Err(e) => FrameContent::Invalid(format!("{}: {}", frame.opcode, e)),
        },
    };
    (content, CrcStatus::Valid)
}

fn status_frame(data: &[u8]) -> Result<Frame, String> {
    smartwave::protocol::decode(data).map_err(|e| format!("Parse error: {}", e))
}

fn pin_name(wire_id: u8) -> String {
    match wire_id >> 4 {
        0xA => format!("A{}", wire_id & 0x0F),
        0xB => format!("B{}", wire_id & 0x0F),
        _ => format!("pin 0x{:02x}", wire_id),
    }
}

fn driver_name(kind: u8) -> String {
    DriverType::from_repr(kind)
        .map(|d| d.to_string())
        .unwrap_or_else(|| format!("driver 0x{:02x}", kind))
}

fn be16(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

fn describe_request(frame: &Frame) -> String {
    let p = &frame.payload[..];
    let body = match frame.opcode {
        Opcode::Trigger => match p.first() {
            Some(recorder) => format!("recorder={}", recorder),
            None => String::new(),
        },
        Opcode::Heartbeat => match p.first() {
            Some(&heartbeat::PONG) => "pong".into(),
            _ => "ping".into(),
        },
        Opcode::General => match *p {
            [_, _, _, _, mode, v0, v1] => format!(
                "mode={}, vddio={:.2}V",
                TriggerMode::from_repr(mode)
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| mode.to_string()),
                u16::from_be_bytes([v0, v1]) as f32 / 100.0
            ),
            _ => format!("len={}", p.len()),
        },
        Opcode::Driver => describe_driver(p),
        Opcode::Pin => match *p {
            [id, _, pullup] => format!("{}, pullup={}", pin_name(id), pullup != 0),
            _ => format!("len={}", p.len()),
        },
        Opcode::Stimulus => match *p {
            [_, id, width, mode, n0, n1, ..] => format!(
                "id={}, width={}, {}, samples={}",
                id,
                width,
                if mode == 0 { "toggle" } else { "repeat" },
                u16::from_be_bytes([n0, n1])
            ),
            _ => format!("len={}", p.len()),
        },
        Opcode::StimulusDriverMatrix => match *p {
            [0x01, _, kind, id, ..] => format!("unlink {}{}", driver_name(kind), id),
            [_, stimulus, kind, id, r0, r1] => format!(
                "link stimulus {} -> {}{}, reads={}",
                stimulus,
                driver_name(kind),
                id,
                u16::from_be_bytes([r0, r1])
            ),
            _ => format!("len={}", p.len()),
        },
        Opcode::DriverPinMatrix => describe_wiring(p),
        Opcode::FpgaWrite => match *p {
            [a, b, c, v0, v1, v2, v3] => format!(
                "0x{:06x} <- 0x{:08x}",
                u32::from_be_bytes([0, a, b, c]),
                u32::from_be_bytes([v0, v1, v2, v3])
            ),
            _ => format!("len={}", p.len()),
        },
        Opcode::FpgaRead => match *p {
            [a, b, c] => format!("0x{:06x}", u32::from_be_bytes([0, a, b, c])),
            _ => format!("len={}", p.len()),
        },
        Opcode::FirmwareUpdate | Opcode::FpgaUpdate => describe_update(p),
        Opcode::Reset | Opcode::Stop | Opcode::Info => String::new(),
    };
    format!("{}({})", frame.opcode, body)
}

fn describe_driver(p: &[u8]) -> String {
    let [kind, id, _, rest @ ..] = p else {
        return format!("len={}", p.len());
    };
    let settings = match (DriverType::from_repr(*kind), rest) {
        (Some(DriverType::I2c), [d0, d1]) => format!("divider={}", u16::from_be_bytes([*d0, *d1])),
        (Some(DriverType::Spi), [width, msb, cpol, cspol, cphase, d0, d1, cs]) => format!(
            "width={}, msb_first={}, cpol={}, cspol={}, cphase={}, divider={}, cs_inactive={}",
            width,
            *msb != 0,
            cpol,
            cspol,
            cphase,
            u16::from_be_bytes([*d0, *d1]),
            cs
        ),
        (Some(DriverType::Uart), [b0, b1, b2, b3]) => {
            format!("baud={}", u32::from_be_bytes([*b0, *b1, *b2, *b3]))
        }
        _ => hex::encode(rest),
    };
    format!("{}{}, {}", driver_name(*kind), id, settings)
}

fn describe_wiring(p: &[u8]) -> String {
    let Some((&count, mut rest)) = p.split_first() else {
        return "empty".into();
    };
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let [kind, second, third, pin, _, _, name_len, tail @ ..] = rest else {
            entries.push("truncated".to_string());
            break;
        };
        let name_len = (*name_len as usize).min(tail.len());
        let name = String::from_utf8_lossy(&tail[..name_len]);
        entries.push(match DriverType::from_repr(*kind) {
            Some(DriverType::NoDriver) => format!("{} unbound", pin_name(*pin)),
            Some(DriverType::Gpio) => format!(
                "{} GPIO out={} level={} \"{}\"",
                pin_name(*pin),
                second,
                third,
                name
            ),
            _ => format!(
                "{} {}{}.{} \"{}\"",
                pin_name(*pin),
                driver_name(*kind),
                second,
                third,
                name
            ),
        });
        rest = &tail[name_len..];
    }
    entries.join("; ")
}

fn describe_update(p: &[u8]) -> String {
    match p {
        [command::ENTER_BOOTLOADER, rest @ ..] | [command::START_BITSTREAM, rest @ ..] => {
            let target = if p[0] == command::ENTER_BOOTLOADER {
                "firmware"
            } else {
                "bitstream"
            };
            match rest {
                [l0, l1, l2, l3, c0, c1, c2, c3] => format!(
                    "start {}, len={}, checksum=0x{:08x}",
                    target,
                    u32::from_be_bytes([*l0, *l1, *l2, *l3]),
                    u32::from_be_bytes([*c0, *c1, *c2, *c3])
                ),
                _ => format!("start {}", target),
            }
        }
        [command::CLOCK_DIVIDER, rest @ ..] => match be16(rest) {
            Some(divider) => format!("clock divider {}", divider),
            None => "clock divider".into(),
        },
        [command::CHUNK, o0, o1, o2, o3, data @ ..] => format!(
            "chunk @0x{:06x}, {} bytes",
            u32::from_be_bytes([*o0, *o1, *o2, *o3]),
            data.len()
        ),
        [command::FINISH] => "finish".into(),
        _ => hex::encode(p),
    }
}

fn describe_reply(frame: &Frame) -> smartwave::Result<String> {
    if frame.opcode == Opcode::Heartbeat && frame.status.is_empty() {
        return Ok(describe_request(frame));
    }
    let events: Vec<String> = status::decode(frame)?
        .into_iter()
        .map(|event| match event {
            StatusEvent::Idle => "idle".to_string(),
            StatusEvent::Running => "running".to_string(),
            StatusEvent::Error(Some(code)) => format!("error {}", code),
            StatusEvent::Error(None) => match frame.payload.first() {
                Some(b) => format!("error 0x{:02x}", b),
                None => "error".to_string(),
            },
            StatusEvent::Info(info) => info.to_string(),
            StatusEvent::Debug(text) => format!("debug \"{}\"", text),
            StatusEvent::UpdateOk => "update ok".to_string(),
            StatusEvent::UpdateFailed => "update failed".to_string(),
            StatusEvent::Readback(r) => {
                let samples: Vec<String> =
                    r.samples.iter().map(|s| format!("{:08x}", s)).collect();
                format!("readback recorder={} [{}]", r.recorder, samples.join(" "))
            }
            StatusEvent::RegisterValue(v) => format!("value 0x{:08x}", v),
            StatusEvent::PinLevels(levels) => format!("levels 0x{:04x}", levels.0),
            StatusEvent::UpdateProgress(progress) => progress.to_string(),
            StatusEvent::BootloaderReady => "bootloader ready".to_string(),
        })
        .collect();
    let unsolicited = frame
        .status
        .intersects(StatusFlags::PINS_STATUS | StatusFlags::DEBUG);
    Ok(format!(
        "{}{}[{}]",
        frame.opcode,
        if unsolicited { "!" } else { "" },
        events.join(", ")
    ))
}

/// Describe bytes that did not form a frame.
pub fn describe_garbage(data: &[u8]) -> FrameContent {
    if data.len() >= HEADER_LEN {
        FrameContent::Invalid(format!("{} stray bytes", data.len()))
    } else {
        FrameContent::Invalid(format!("stray bytes {}", hex::encode(data)))
    }
}
