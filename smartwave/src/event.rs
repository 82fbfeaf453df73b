//! Notifications a connection publishes to subscribers.

use crate::protocol::{Frame, StatusEvent};
use crate::resource::PinId;

/// Something the device reported without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Input level of a pin changed
    InputLevel { pin: PinId, level: bool },

    /// Idle, running, debug output, errors and update progress
    Status(StatusEvent),

    /// A frame no pending operation was waiting for and that carried no
    /// decodable status
    Unsolicited(Frame),

    /// The session closed; no further events follow
    Disconnected(String),
}
