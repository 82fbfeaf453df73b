//! Request/reply session over one byte stream.
//!
//! The protocol carries no request ids, so at most one request may be on the
//! wire at a time: callers queue on an operation lock (FIFO) and a reply is
//! matched to the single pending request by opcode. A background receive task
//! owns the read half of the stream; it completes the pending request,
//! answers device heartbeats and turns everything else into
//! [`DeviceEvent`]s.
//!
//! Any transport failure or undecodable frame closes the session for good;
//! the pending request and every later one fail.

use futures::SinkExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ByteStream;
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::protocol::{
    heartbeat, status, Frame, FrameCodec, FrameError, Opcode, PinLevels, StatusEvent, StatusFlags,
};
use crate::resource::PinId;
use crate::tracing::prelude::*;

type Reader = FramedRead<ReadHalf<Box<dyn ByteStream>>, FrameCodec>;
type Writer = FramedWrite<WriteHalf<Box<dyn ByteStream>>, FrameCodec>;

/// Callback invoked on the receive task when a pin's input level changes.
pub type LevelCallback = Arc<dyn Fn(PinId, bool) + Send + Sync>;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The host disconnected
    Disconnected,
    ConnectionLost(String),
    MalformedFrame(String),
    /// An update aborted and left the device in an unknown state
    UpdateFailed(String),
}

impl CloseReason {
    /// Error delivered to the request in flight when the session closed.
    fn pending_error(&self) -> Error {
        match self {
            CloseReason::MalformedFrame(msg) => Error::MalformedFrame(msg.clone()),
            other => Error::ConnectionLost(other.to_string()),
        }
    }

    /// Error for requests made after the session closed.
    fn later_error(&self) -> Error {
        match self {
            CloseReason::Disconnected => Error::NotConnected,
            other => Error::ConnectionLost(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected => write!(f, "disconnected by host"),
            CloseReason::ConnectionLost(msg) => write!(f, "{}", msg),
            CloseReason::MalformedFrame(msg) => write!(f, "malformed frame: {}", msg),
            CloseReason::UpdateFailed(msg) => write!(f, "update failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Host heartbeat interval, if any
    pub keepalive: Option<Duration>,
    pub event_capacity: usize,
    pub write_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keepalive: None,
            event_capacity: 64,
            write_timeout: Duration::from_secs(1),
        }
    }
}

struct PendingSlot {
    opcode: Opcode,
    tx: oneshot::Sender<Result<Frame>>,
}

struct Link {
    closed: Option<CloseReason>,
    pending: Option<PendingSlot>,
}

struct Shared {
    link: Mutex<Link>,
    events: broadcast::Sender<DeviceEvent>,
    levels: AtomicU16,
    listeners: Mutex<HashMap<PinId, LevelCallback>>,
    cancel: CancellationToken,
}

impl Shared {
    fn closed(&self) -> Option<CloseReason> {
        self.link.lock().closed.clone()
    }

    /// Close once; returns whether this call did it.
    fn close(&self, reason: CloseReason) -> bool {
        let pending = {
            let mut link = self.link.lock();
            if link.closed.is_some() {
                return false;
            }
            link.closed = Some(reason.clone());
            link.pending.take()
        };

        if let Some(slot) = pending {
            let _ = slot.tx.send(Err(reason.pending_error()));
        }
        match &reason {
            CloseReason::Disconnected => info!("Session closed."),
            other => warn!(reason = %other, "Session closed."),
        }
        let _ = self.events.send(DeviceEvent::Disconnected(reason.to_string()));
        self.cancel.cancel();
        true
    }

    /// Hand `frame` to the pending request if it is the awaited reply.
    fn complete(&self, frame: Frame) -> Option<Frame> {
        let mut link = self.link.lock();
        match link.pending.take() {
            Some(slot) if slot.opcode == frame.opcode => {
                drop(link);
                trace!(opcode = %frame.opcode, "Completing pending request");
                let _ = slot.tx.send(Ok(frame));
                None
            }
            other => {
                link.pending = other;
                Some(frame)
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        let unsolicited = frame
            .status
            .intersects(StatusFlags::PINS_STATUS | StatusFlags::DEBUG);
        let frame = if unsolicited {
            frame
        } else {
            match self.complete(frame) {
                Some(frame) => frame,
                None => return,
            }
        };
        self.publish(frame);
    }

    fn publish(&self, frame: Frame) {
        match status::decode(&frame) {
            Ok(events) if !events.is_empty() => {
                for event in events {
                    match event {
                        StatusEvent::PinLevels(levels) => self.update_levels(levels),
                        StatusEvent::Debug(msg) => {
                            debug!(device = %msg, "Device debug output");
                            let _ = self.events.send(DeviceEvent::Status(StatusEvent::Debug(msg)));
                        }
                        other => {
                            let _ = self.events.send(DeviceEvent::Status(other));
                        }
                    }
                }
            }
            Ok(_) => {
                debug!(opcode = %frame.opcode, status = ?frame.status, "Unsolicited frame");
                let _ = self.events.send(DeviceEvent::Unsolicited(frame));
            }
            Err(e) => {
                warn!(opcode = %frame.opcode, error = %e, "Undecodable status payload");
                let _ = self.events.send(DeviceEvent::Unsolicited(frame));
            }
        }
    }

    fn update_levels(&self, levels: PinLevels) {
        let previous = PinLevels(self.levels.swap(levels.0, Ordering::AcqRel));
        for (index, level) in levels.changes_since(previous) {
            let Some(pin) = PinId::from_index(index) else {
                continue;
            };
            let callback = self.listeners.lock().get(&pin).cloned();
            if let Some(callback) = callback {
                callback(pin, level);
            }
            let _ = self.events.send(DeviceEvent::InputLevel { pin, level });
        }
    }
}

async fn write_frame(
    shared: &Shared,
    writer: &AsyncMutex<Writer>,
    frame: Frame,
    timeout: Duration,
) -> Result<()> {
    if let Some(reason) = shared.closed() {
        return Err(reason.later_error());
    }
    let mut writer = writer.lock().await;
    let failure = match time::timeout(timeout, writer.send(frame)).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(FrameError::Malformed(msg))) => return Err(Error::InvalidArgument(msg)),
        Ok(Err(FrameError::Io(e))) => e.to_string(),
        Err(_) => "write timed out".to_string(),
    };
    let reason = CloseReason::ConnectionLost(failure);
    shared.close(reason.clone());
    Err(reason.later_error())
}

/// A sent request awaiting its reply.
///
/// Holds the operation lock (unless created under an [`Exclusive`]); dropping
/// it, including after a timeout, discards the pending slot and releases the
/// lock.
pub struct PendingOperation {
    rx: oneshot::Receiver<Result<Frame>>,
    opcode: Opcode,
    shared: Arc<Shared>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl PendingOperation {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Suspend until the reply arrives or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Frame> {
        match time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self
                .shared
                .closed()
                .map(|r| r.pending_error())
                .unwrap_or_else(|| Error::ConnectionLost("reply channel closed".into()))),
            Err(_) => {
                debug!(opcode = %self.opcode, ?timeout, "Request timed out");
                Err(Error::Timeout(self.opcode))
            }
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        let mut link = self.shared.link.lock();
        if matches!(&link.pending, Some(slot) if slot.opcode == self.opcode) {
            link.pending = None;
        }
    }
}

/// Open session to one device. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    op_lock: Arc<AsyncMutex<()>>,
    writer: Arc<AsyncMutex<Writer>>,
    write_timeout: Duration,
    tracker: TaskTracker,
}

impl Session {
    /// Take ownership of `stream` and start the receive (and keepalive) task.
    pub fn spawn(stream: impl ByteStream, options: SessionOptions) -> Self {
        let boxed: Box<dyn ByteStream> = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        let shared = Arc::new(Shared {
            link: Mutex::new(Link {
                closed: None,
                pending: None,
            }),
            events,
            levels: AtomicU16::new(0),
            listeners: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        let writer = Arc::new(AsyncMutex::new(FramedWrite::new(writer, FrameCodec)));
        let tracker = TaskTracker::new();

        tracker.spawn(receive_loop(
            shared.clone(),
            FramedRead::new(reader, FrameCodec),
            writer.clone(),
            options.write_timeout,
        ));
        if let Some(interval) = options.keepalive {
            tracker.spawn(keepalive_loop(
                shared.clone(),
                writer.clone(),
                interval,
                options.write_timeout,
            ));
        }
        tracker.close();

        Self {
            shared,
            op_lock: Arc::new(AsyncMutex::new(())),
            writer,
            write_timeout: options.write_timeout,
            tracker,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.closed().is_none()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.closed()
    }

    /// Queue for the operation lock, then send `frame`.
    pub async fn send(&self, frame: Frame) -> Result<PendingOperation> {
        let guard = self.op_lock.clone().lock_owned().await;
        self.send_inner(frame, Some(guard)).await
    }

    async fn send_inner(
        &self,
        frame: Frame,
        guard: Option<OwnedMutexGuard<()>>,
    ) -> Result<PendingOperation> {
        let (tx, rx) = oneshot::channel();
        let opcode = frame.opcode;
        {
            let mut link = self.shared.link.lock();
            if let Some(reason) = &link.closed {
                return Err(reason.later_error());
            }
            link.pending = Some(PendingSlot { opcode, tx });
        }
        let op = PendingOperation {
            rx,
            opcode,
            shared: self.shared.clone(),
            _guard: guard,
        };
        write_frame(&self.shared, &self.writer, frame, self.write_timeout).await?;
        Ok(op)
    }

    /// Send `frame` and wait for its reply; a reply flagged as an error is
    /// `Rejected`.
    pub async fn request(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        let opcode = frame.opcode;
        let reply = self.send(frame).await?.wait(timeout).await?;
        check_reply(opcode, reply)
    }

    /// Hold the operation lock across several requests.
    pub async fn exclusive(&self) -> Exclusive {
        let guard = self.op_lock.clone().lock_owned().await;
        Exclusive {
            session: self.clone(),
            _guard: guard,
        }
    }

    /// Write a frame that expects no reply, outside the operation lock.
    pub async fn notify(&self, frame: Frame) -> Result<()> {
        write_frame(&self.shared, &self.writer, frame, self.write_timeout).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    pub fn input_levels(&self) -> PinLevels {
        PinLevels(self.shared.levels.load(Ordering::Acquire))
    }

    /// Install or remove the level-change callback for `pin`.
    pub fn set_level_listener(&self, pin: PinId, callback: Option<LevelCallback>) {
        let mut listeners = self.shared.listeners.lock();
        match callback {
            Some(cb) => {
                listeners.insert(pin, cb);
            }
            None => {
                listeners.remove(&pin);
            }
        }
    }

    /// Close the session and wait for its tasks to stop.
    pub async fn close(&self, reason: CloseReason) {
        self.shared.close(reason);
        {
            let mut writer = self.writer.lock().await;
            let _ = time::timeout(self.write_timeout, writer.close()).await;
        }
        self.tracker.wait().await;
    }

    /// Close without waiting; used when the last handle goes away.
    pub fn shutdown(&self) {
        self.shared.close(CloseReason::Disconnected);
    }
}

/// Operation lock held across a sequence of requests.
pub struct Exclusive {
    session: Session,
    _guard: OwnedMutexGuard<()>,
}

impl Exclusive {
    pub async fn send(&self, frame: Frame) -> Result<PendingOperation> {
        self.session.send_inner(frame, None).await
    }

    pub async fn request(&self, frame: Frame, timeout: Duration) -> Result<Frame> {
        let opcode = frame.opcode;
        let reply = self.send(frame).await?.wait(timeout).await?;
        check_reply(opcode, reply)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

fn check_reply(opcode: Opcode, reply: Frame) -> Result<Frame> {
    if reply.is_error() {
        let code = reply.error_code();
        warn!(%opcode, ?code, "Device rejected request");
        return Err(Error::Rejected { opcode, code });
    }
    Ok(reply)
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut reader: Reader,
    writer: Arc<AsyncMutex<Writer>>,
    write_timeout: Duration,
) {
    trace!("Receive task started.");
    loop {
        let item = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            item = reader.next() => item,
        };
        match item {
            Some(Ok(frame)) if frame.opcode == Opcode::Heartbeat => {
                if frame.payload.first() == Some(&heartbeat::PING) {
                    trace!("Answering device heartbeat");
                    let pong = Frame::new(Opcode::Heartbeat, vec![heartbeat::PONG]);
                    if write_frame(&shared, &writer, pong, write_timeout)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Some(Ok(frame)) => shared.dispatch(frame),
            Some(Err(FrameError::Malformed(msg))) => {
                error!(%msg, "Dropping connection after malformed frame");
                shared.close(CloseReason::MalformedFrame(msg));
                break;
            }
            Some(Err(FrameError::Io(e))) => {
                shared.close(CloseReason::ConnectionLost(e.to_string()));
                break;
            }
            None => {
                shared.close(CloseReason::ConnectionLost(
                    "device closed the connection".into(),
                ));
                break;
            }
        }
    }
    trace!("Receive task stopped.");
}

async fn keepalive_loop(
    shared: Arc<Shared>,
    writer: Arc<AsyncMutex<Writer>>,
    interval: Duration,
    write_timeout: Duration,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let ping = Frame::new(Opcode::Heartbeat, vec![heartbeat::PING]);
                if write_frame(&shared, &writer, ping, write_timeout).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!("Keepalive task stopped.");
}
