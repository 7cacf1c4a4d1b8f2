//! Engine error types.

use core::fmt;

/// Errors surfaced by switchboard operations.
#[derive(Debug)]
pub enum SwitchboardError {
    /// The recipient mailbox is at capacity; the frame was not enqueued.
    BacklogLimit {
        /// Number of entries currently queued.
        queued: usize,
        /// The configured cap.
        cap: usize,
    },
    /// No room exists for the given application id.
    RoomMissing,
    /// The connection is not registered in the room.
    NotRegistered,
    /// The connection was displaced by a newer one for the same side.
    Replaced,
    /// A socket write failed or timed out.
    Write(std::io::Error),
}

impl fmt::Display for SwitchboardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BacklogLimit { queued, cap } => {
                write!(f, "mailbox backlog limit reached ({queued} queued, cap {cap})")
            }
            Self::RoomMissing => write!(f, "room does not exist"),
            Self::NotRegistered => write!(f, "connection not registered"),
            Self::Replaced => write!(f, "connection was replaced"),
            Self::Write(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl std::error::Error for SwitchboardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SwitchboardError {
    fn from(e: std::io::Error) -> Self {
        Self::Write(e)
    }
}
