//! Byte-stream transports and the session running over them.
//!
//! The protocol only needs an ordered duplex byte stream. Serial ports are
//! the real transport; tests use in-memory pipes.

pub mod discovery;
pub mod session;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::Result;
use crate::tracing::prelude::*;

pub use discovery::{candidate_ports, PortIdentity, PID, VID};
pub use session::{CloseReason, PendingOperation, Session, SessionOptions};

/// Anything a session can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Open a serial port in raw 8N1 mode.
pub fn open_serial(port: &str, baud_rate: u32) -> Result<SerialStream> {
    debug!(port, baud_rate, "Opening serial port");
    let stream = tokio_serial::new(port, baud_rate).open_native_async()?;
    Ok(stream)
}
