//! In-memory SmartWave used by the integration tests.
//!
//! The simulator answers every request the way the firmware does, keeps the
//! stimulus programs and stimulus-driver links it was sent, and plays a
//! triggered I2C stimulus against a set of responding addresses. SPI
//! stimuli are looped back. Everything it receives is recorded.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use smartwave::config::Config;
use smartwave::protocol::{Frame, FrameCodec, Opcode, StatusFlags};
use smartwave::Connection;

pub const TIMEOUT: Duration = Duration::from_millis(300);

const I2C_DRIVER: u8 = 0x01;
const SPI_DRIVER: u8 = 0x00;
const NO_STIMULUS: u8 = 0x01;

#[derive(Default)]
pub struct SimState {
    /// Requests in arrival order
    pub received: Vec<Frame>,
    /// I2C addresses that acknowledge
    pub i2c_targets: BTreeSet<u8>,
    /// Bytes a read from an address returns, repeated as needed
    pub i2c_data: HashMap<u8, Vec<u8>>,
    /// Opcodes answered with the error flag
    pub reject: HashSet<Opcode>,
    /// Opcodes never answered
    pub silent: HashSet<Opcode>,
    /// Number of upcoming triggers to leave unanswered
    pub ignore_triggers: usize,
    pub fpga_registers: HashMap<u32, u32>,
    /// Update chunk index answered with a firmware-corrupt error
    pub corrupt_chunk: Option<usize>,
    pub chunks: usize,
    /// Stimulus id to programmed samples
    pub stimuli: BTreeMap<u8, Vec<u32>>,
    /// (driver type, driver id) to stimulus id
    pub links: BTreeMap<(u8, u8), u8>,
}

impl SimState {
    pub fn opcodes(&self) -> Vec<Opcode> {
        self.received.iter().map(|f| f.opcode).collect()
    }

    /// Requests received after the handshake.
    pub fn since(&self, mark: usize) -> Vec<Frame> {
        self.received[mark..].to_vec()
    }
}

enum Control {
    Send(Frame),
    HangUp,
}

pub struct SimDevice {
    pub state: Arc<Mutex<SimState>>,
    control: mpsc::UnboundedSender<Control>,
}

impl SimDevice {
    pub fn start() -> (DuplexStream, SimDevice) {
        let (host, device) = duplex(1 << 16);
        let state = Arc::new(Mutex::new(SimState::default()));
        let (control, controls) = mpsc::unbounded_channel();
        tokio::spawn(run(Framed::new(device, FrameCodec), state.clone(), controls));
        (host, SimDevice { state, control })
    }

    /// Send an unsolicited frame to the host.
    pub fn inject(&self, frame: Frame) {
        let _ = self.control.send(Control::Send(frame));
    }

    /// Close the device end of the stream.
    pub fn hang_up(&self) {
        let _ = self.control.send(Control::HangUp);
    }

    /// Report new input levels, bank A in the low byte.
    pub fn set_levels(&self, levels: u16) {
        self.inject(
            Frame::new(Opcode::Pin, levels.to_le_bytes().to_vec())
                .with_status(StatusFlags::PINS_STATUS),
        );
    }

    pub fn mark(&self) -> usize {
        self.state.lock().received.len()
    }

    pub fn since(&self, mark: usize) -> Vec<Frame> {
        self.state.lock().since(mark)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.connection.reply_timeout_ms = TIMEOUT.as_millis() as u64;
    config.update.chunk_size = 4096;
    config.update.bootloader_timeout_ms = 300;
    config.update.chunk_timeout_ms = 300;
    config.update.verify_timeout_ms = 300;
    config
}

/// A connected host and the device it talks to.
pub async fn connect() -> (Connection, SimDevice) {
    connect_with(test_config(), |_| {}).await
}

pub async fn connect_with(
    config: Config,
    setup: impl FnOnce(&mut SimState),
) -> (Connection, SimDevice) {
    let (stream, sim) = SimDevice::start();
    setup(&mut sim.state.lock());
    let connection = Connection::open(stream, config).await.unwrap();
    (connection, sim)
}

async fn run(
    mut framed: Framed<DuplexStream, FrameCodec>,
    state: Arc<Mutex<SimState>>,
    mut controls: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let reply = tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    let mut state = state.lock();
                    respond(&mut state, frame)
                }
                _ => break,
            },
            Some(control) = controls.recv() => match control {
                Control::Send(frame) => Some(frame),
                Control::HangUp => break,
            },
        };
        if let Some(reply) = reply {
            if framed.send(reply).await.is_err() {
                break;
            }
        }
    }
}

fn ack(opcode: Opcode) -> Frame {
    Frame::empty(opcode).with_status(StatusFlags::IDLE)
}

fn respond(state: &mut SimState, frame: Frame) -> Option<Frame> {
    state.received.push(frame.clone());
    let opcode = frame.opcode;
    if state.silent.contains(&opcode) {
        return None;
    }
    if state.reject.contains(&opcode) {
        return Some(Frame::new(opcode, vec![0xEE]).with_status(StatusFlags::ERROR));
    }
    let payload = &frame.payload[..];

    match opcode {
        Opcode::Heartbeat => Some(Frame::new(Opcode::Heartbeat, vec![0x01])),
        Opcode::Reset => {
            state.stimuli.clear();
            state.links.clear();
            Some(ack(opcode))
        }
        Opcode::Info => {
            let mut info = vec![1, 2, 0, 0, 8, 12, 3, 1, 4];
            info.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
            Some(Frame::new(opcode, info).with_status(StatusFlags::INFO))
        }
        Opcode::Stimulus => {
            store_stimulus(state, payload);
            Some(ack(opcode))
        }
        Opcode::StimulusDriverMatrix => {
            if let [kind, stimulus, driver, id, ..] = *payload {
                if kind == NO_STIMULUS {
                    state.links.remove(&(driver, id));
                } else {
                    state.links.insert((driver, id), stimulus);
                }
            }
            Some(ack(opcode))
        }
        Opcode::Trigger => match payload.first() {
            None => Some(ack(opcode)),
            Some(_) if state.ignore_triggers > 0 => {
                state.ignore_triggers -= 1;
                None
            }
            Some(&recorder) => Some(readback(state, recorder)),
        },
        Opcode::FpgaWrite => {
            if let [a, b, c, v0, v1, v2, v3] = *payload {
                let address = u32::from_be_bytes([0, a, b, c]);
                state
                    .fpga_registers
                    .insert(address, u32::from_be_bytes([v0, v1, v2, v3]));
            }
            Some(ack(opcode))
        }
        Opcode::FpgaRead => {
            let address = match *payload {
                [a, b, c] => u32::from_be_bytes([0, a, b, c]),
                _ => 0,
            };
            let value = state.fpga_registers.get(&address).copied().unwrap_or(0);
            Some(
                Frame::new(opcode, value.to_be_bytes().to_vec())
                    .with_status(StatusFlags::SINGLE_ADDRESS_READ),
            )
        }
        Opcode::FirmwareUpdate | Opcode::FpgaUpdate => Some(update(state, opcode, payload)),
        _ => Some(ack(opcode)),
    }
}

fn store_stimulus(state: &mut SimState, payload: &[u8]) {
    let [_, id, width, _, n_hi, n_lo, body @ ..] = payload else {
        return;
    };
    let width = *width as usize / 8;
    let count = u16::from_be_bytes([*n_hi, *n_lo]) as usize;
    let samples = body
        .chunks_exact(width.max(1))
        .take(count)
        .map(|c| c.iter().fold(0u32, |acc, &b| acc << 8 | b as u32))
        .collect();
    state.stimuli.insert(*id, samples);
}

fn readback(state: &mut SimState, recorder: u8) -> Frame {
    let samples = state.stimuli.get(&recorder).cloned().unwrap_or_default();
    let driver = state
        .links
        .iter()
        .find(|(_, &s)| s == recorder)
        .map(|(&(kind, _), _)| kind);
    let words = match driver {
        Some(I2C_DRIVER) => run_i2c(state, &samples),
        Some(SPI_DRIVER) => samples,
        _ => Vec::new(),
    };

    let mut payload = vec![recorder];
    payload.extend_from_slice(&(words.len() as u16).to_be_bytes());
    for word in words {
        payload.extend_from_slice(&word.to_be_bytes());
    }
    Frame::new(Opcode::Trigger, payload).with_status(StatusFlags::READBACK)
}

fn run_i2c(state: &SimState, samples: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let mut samples = samples.iter();
    while let Some(&command) = samples.next() {
        let length = (command & 0xFF) as usize;
        let address = ((command >> 17) & 0x7F) as u8;
        let read = command & (1 << 25) != 0;
        let present = state.i2c_targets.contains(&address);

        let bytes: Vec<(u8, bool)> = if read {
            let source = state.i2c_data.get(&address).cloned().unwrap_or_default();
            (0..length)
                .map(|i| {
                    let byte = if present {
                        source.get(i % source.len().max(1)).copied().unwrap_or(0)
                    } else {
                        0xFF
                    };
                    (byte, present && i + 1 < length)
                })
                .collect()
        } else {
            samples
                .by_ref()
                .take(length)
                .map(|&b| (b as u8, present))
                .collect()
        };

        out.push(
            length as u32
                | (address as u32) << 8
                | (read as u32) << 16
                | (present as u32) << 17,
        );
        for pair in bytes.chunks(2) {
            let mut word = pair[0].0 as u32 | (pair[0].1 as u32) << 8;
            if let Some(&(byte, byte_ack)) = pair.get(1) {
                word |= (byte as u32) << 16 | (byte_ack as u32) << 24 | 1 << 25;
            }
            out.push(word);
        }
    }
    out
}

fn update(state: &mut SimState, opcode: Opcode, payload: &[u8]) -> Frame {
    match payload.first() {
        Some(0x1B) => {
            state.chunks = 0;
            Frame::empty(opcode).with_status(StatusFlags::BOOTLOADER_READY)
        }
        Some(0x1C) => {
            state.chunks = 0;
            ack(opcode)
        }
        Some(0x01) => {
            let index = state.chunks;
            state.chunks += 1;
            if state.corrupt_chunk == Some(index) {
                Frame::new(opcode, vec![0x00]).with_status(StatusFlags::ERROR)
            } else {
                ack(opcode)
            }
        }
        Some(0x02) => Frame::empty(opcode).with_status(StatusFlags::FIRMWARE_UPDATE_OK),
        _ => ack(opcode),
    }
}
