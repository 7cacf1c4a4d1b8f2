//! tandem-http: the relay's HTTP and WebSocket surface.
//!
//! Adapts the engine crates to the wire: the `/ws` connection supervisor
//! over [`tandem_core::Switchboard`], the `/objects` REST surface over
//! [`tandem_store::FsStore`], the problem-details error envelope with
//! per-request correlation ids, the cross-origin policy, the legacy `/api`
//! pairing routes, and a hyper-util serve loop with graceful shutdown.
//! Route assembly and configuration live in the daemon binary.

pub mod cors;
pub mod objects;
pub mod pairing;
pub mod problem;
pub mod request_id;
pub mod serve;
pub mod ws;

pub use problem::Problem;
pub use request_id::{request_id_middleware, RequestId};
pub use serve::serve;
