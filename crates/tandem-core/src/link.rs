//! The connection seam between the engine and a transport.

use std::time::Duration;

/// A live client connection as the switchboard sees it.
///
/// Implementations wrap the write half of a socket. All writes on one link
/// must be serialized by the implementation (a mutex around the sink half);
/// the engine never holds its own lock across a call into a link.
///
/// `id` must be unique for the lifetime of the process so the engine can
/// tell a displaced connection apart from its replacement.
#[allow(async_fn_in_trait)]
pub trait Link: Send + Sync + 'static {
    /// Process-unique connection id.
    fn id(&self) -> u64;

    /// Write a text frame, giving up after `deadline`.
    async fn send_text(&self, text: String, deadline: Duration) -> std::io::Result<()>;

    /// Write a protocol-level ping, giving up after `deadline`.
    async fn send_ping(&self, deadline: Duration) -> std::io::Result<()>;

    /// Send a close frame with the given code and reason, then drop the
    /// connection. Best-effort; errors are swallowed by implementations.
    async fn close(&self, code: u16, reason: &str);
}
