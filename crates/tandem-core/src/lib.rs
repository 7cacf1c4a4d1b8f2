//! tandem-core: room/mailbox engine and wire frames for the tandem relay.
//!
//! A room pairs exactly two endpoints, side `A` and side `B`, under an opaque
//! application id. Each side owns a mailbox of sequenced messages addressed to
//! it; the switchboard pushes undelivered entries to whichever connection is
//! currently bound to that side and trims them once the side acknowledges a
//! watermark. Transient signaling frames bypass the mailboxes and are
//! forwarded verbatim to the peer.
//!
//! This crate is transport-free: connections enter the engine through the
//! [`Link`] trait, so the engine can be exercised in tests without a socket.
//! The HTTP crate supplies the WebSocket implementation.

pub mod error;
pub mod frame;
pub mod link;
pub mod mailbox;
pub mod switchboard;

pub use error::SwitchboardError;
pub use frame::{ClientFrameKind, Deliver, Delivered, Hello, SendFrame, ServerFrame, Side};
pub use link::Link;
pub use mailbox::Mailbox;
pub use switchboard::{Switchboard, SwitchboardConfig};
