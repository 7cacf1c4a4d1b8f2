//! The switchboard: rooms, per-side connections, and the push loop.
//!
//! All room/mailbox state lives behind a single engine mutex. The contract
//! throughout this module is that the lock is only ever held for map and
//! queue manipulation; every socket write happens after the guard is
//! dropped, under the per-connection write serialization a [`Link`]
//! implementation provides. The push loop re-checks connection identity
//! between writes, so a displaced connection stops receiving frames after
//! at most one in-flight write, and the replacement re-pushes from its own
//! reported watermark.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SwitchboardError;
use crate::frame::{Deliver, ServerFrame, Side};
use crate::link::Link;
use crate::mailbox::{Mailbox, QueuedFrame};

/// Close code sent to a displaced connection (normal closure).
pub const CLOSE_NORMAL: u16 = 1000;

/// Close reason sent to a displaced connection.
pub const REASON_REPLACED: &str = "replaced";

/// Tunables for the switchboard.
#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Maximum queued entries per mailbox before `enqueue` rejects.
    pub max_backlog: usize,
    /// Per-frame write deadline.
    pub write_wait: Duration,
    /// Idle time after which a room with no connections is evicted.
    pub room_ttl: Duration,
    /// Interval between room GC sweeps.
    pub gc_interval: Duration,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            max_backlog: 10_000,
            write_wait: Duration::from_secs(10),
            room_ttl: Duration::from_secs(600),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// Storage indexed by [`Side`].
#[derive(Debug, Default)]
struct PerSide<T> {
    a: T,
    b: T,
}

impl<T> PerSide<T> {
    fn get(&self, side: Side) -> &T {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }
}

struct Room<L> {
    conns: PerSide<Option<Arc<L>>>,
    sids: PerSide<Option<String>>,
    mailboxes: PerSide<Mailbox>,
    last_activity: Instant,
}

impl<L> Room<L> {
    fn new() -> Self {
        Self {
            conns: PerSide::default(),
            sids: PerSide::default(),
            mailboxes: PerSide::default(),
            last_activity: Instant::now(),
        }
    }

    fn conn_count(&self) -> usize {
        [Side::A, Side::B]
            .into_iter()
            .filter(|&s| self.conns.get(s).is_some())
            .count()
    }
}

struct State<L> {
    rooms: HashMap<String, Room<L>>,
    // Reverse index, maintained in lockstep with the room slots.
    by_conn: HashMap<u64, (String, Side)>,
}

/// Room and mailbox engine.
///
/// Generic over the connection type so tests can drive it with an in-memory
/// link. Shared as `Arc<Switchboard<_>>` between the connection supervisor
/// tasks and the room GC.
pub struct Switchboard<L: Link> {
    cfg: SwitchboardConfig,
    state: Mutex<State<L>>,
}

impl<L: Link> Switchboard<L> {
    pub fn new(cfg: SwitchboardConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(State {
                rooms: HashMap::new(),
                by_conn: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.cfg
    }

    /// Bind `link` as the connection for `(app_id, side)`.
    ///
    /// Creates the room (with both mailboxes) on first use. Any existing
    /// connection for the side is displaced: it receives a normal-closure
    /// frame with reason `"replaced"` and is dropped. Pending mailbox
    /// entries above the side's current watermark are pushed opportunistically;
    /// the definitive resume happens on the client's `hello`.
    pub async fn register(&self, app_id: &str, side: Side, sid: Option<&str>, link: Arc<L>) {
        let displaced = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let room = state
                .rooms
                .entry(app_id.to_owned())
                .or_insert_with(Room::new);
            let old = room.conns.get_mut(side).replace(Arc::clone(&link));
            *room.sids.get_mut(side) = sid.map(str::to_owned);
            room.last_activity = Instant::now();
            if let Some(old) = &old {
                state.by_conn.remove(&old.id());
            }
            state.by_conn.insert(link.id(), (app_id.to_owned(), side));
            old
        };

        if let Some(old) = displaced {
            if old.id() != link.id() {
                info!(app = %app_id, %side, old = old.id(), new = link.id(), "connection replaced");
                old.close(CLOSE_NORMAL, REASON_REPLACED).await;
            }
        }

        self.push(app_id, side).await;
    }

    /// Drop the connection iff it is still the registered handle for its
    /// side. A connection that was already replaced is a no-op.
    pub fn unregister(&self, app_id: &str, conn_id: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(room) = state.rooms.get_mut(app_id) else {
            return;
        };
        for side in [Side::A, Side::B] {
            let slot = room.conns.get_mut(side);
            if slot.as_ref().is_some_and(|c| c.id() == conn_id) {
                *slot = None;
                *room.sids.get_mut(side) = None;
                room.last_activity = Instant::now();
                state.by_conn.remove(&conn_id);
                debug!(app = %app_id, %side, conn = conn_id, "connection unregistered");
                return;
            }
        }
    }

    /// Resume a side: record its session id, advance its watermark if the
    /// reported value is higher, trim, and push what remains. No-op when the
    /// room does not exist.
    pub async fn hello(&self, app_id: &str, side: Side, sid: Option<&str>, delivered_up_to: u64) {
        {
            let mut guard = self.state.lock();
            let Some(room) = guard.rooms.get_mut(app_id) else {
                return;
            };
            if sid.is_some() {
                *room.sids.get_mut(side) = sid.map(str::to_owned);
            }
            room.mailboxes.get_mut(side).advance(delivered_up_to);
            room.last_activity = Instant::now();
        }
        self.push(app_id, side).await;
    }

    /// Queue a message for `to`'s mailbox and push it if that side is
    /// connected. Creates the room lazily so a sender can run ahead of its
    /// peer. Returns the assigned sequence number.
    pub async fn enqueue(
        &self,
        app_id: &str,
        from: Side,
        to: Side,
        payload: Box<serde_json::value::RawValue>,
    ) -> Result<u64, SwitchboardError> {
        let result = {
            let mut guard = self.state.lock();
            let room = guard
                .rooms
                .entry(app_id.to_owned())
                .or_insert_with(Room::new);
            room.last_activity = Instant::now();
            room.mailboxes
                .get_mut(to)
                .enqueue(from, payload, self.cfg.max_backlog)
        };
        let seq = result?;
        self.push(app_id, to).await;
        Ok(seq)
    }

    /// Advance `side`'s watermark and trim. Unlike `hello` this never
    /// pushes, but it always counts as room activity.
    pub fn ack_up_to(&self, app_id: &str, side: Side, up_to: u64) {
        let mut guard = self.state.lock();
        let Some(room) = guard.rooms.get_mut(app_id) else {
            return;
        };
        room.mailboxes.get_mut(side).advance(up_to);
        room.last_activity = Instant::now();
    }

    /// Forward `text` byte-for-byte to every registered connection in the
    /// room except `sender_id`. Used for transient signaling frames; a write
    /// failure tears the failing connection down.
    pub async fn broadcast(&self, app_id: &str, sender_id: u64, text: &str) {
        let targets = {
            let mut guard = self.state.lock();
            let Some(room) = guard.rooms.get_mut(app_id) else {
                return;
            };
            room.last_activity = Instant::now();
            [Side::A, Side::B]
                .into_iter()
                .filter_map(|s| room.conns.get(s).clone())
                .filter(|c| c.id() != sender_id)
                .collect::<Vec<_>>()
        };

        for link in targets {
            if let Err(e) = link.send_text(text.to_owned(), self.cfg.write_wait).await {
                warn!(app = %app_id, conn = link.id(), error = %e, "broadcast write failed");
                self.unregister(app_id, link.id());
                link.close(CLOSE_NORMAL, "").await;
            }
        }
    }

    /// Serialize `evt` and send it to every connection in the room,
    /// including the side that triggered it.
    pub async fn broadcast_event<E: Serialize>(&self, app_id: &str, evt: &E) {
        let text = match serde_json::to_string(evt) {
            Ok(t) => t,
            Err(e) => {
                warn!(app = %app_id, error = %e, "event serialization failed");
                return;
            }
        };

        let targets = {
            let guard = self.state.lock();
            let Some(room) = guard.rooms.get(app_id) else {
                return;
            };
            [Side::A, Side::B]
                .into_iter()
                .filter_map(|s| room.conns.get(s).clone())
                .collect::<Vec<_>>()
        };

        for link in targets {
            if let Err(e) = link.send_text(text.clone(), self.cfg.write_wait).await {
                warn!(app = %app_id, conn = link.id(), error = %e, "event write failed");
                self.unregister(app_id, link.id());
                link.close(CLOSE_NORMAL, "").await;
            }
        }
    }

    /// Number of live connections in the room (0, 1, or 2).
    pub fn room_size(&self, app_id: &str) -> usize {
        self.state
            .lock()
            .rooms
            .get(app_id)
            .map_or(0, Room::conn_count)
    }

    /// Write a ping to exactly the connection identified by `conn_id`,
    /// verifying first that it is still the registered handle for its side.
    pub async fn write_ping_conn(
        &self,
        app_id: &str,
        conn_id: u64,
        deadline: Duration,
    ) -> Result<(), SwitchboardError> {
        let link = {
            let guard = self.state.lock();
            let room = guard.rooms.get(app_id).ok_or(SwitchboardError::RoomMissing)?;
            let (_, side) = guard
                .by_conn
                .get(&conn_id)
                .ok_or(SwitchboardError::NotRegistered)?;
            let cur = room
                .conns
                .get(*side)
                .as_ref()
                .ok_or(SwitchboardError::Replaced)?;
            if cur.id() != conn_id {
                return Err(SwitchboardError::Replaced);
            }
            Arc::clone(cur)
        };
        link.send_ping(deadline).await?;
        Ok(())
    }

    /// Push every undelivered mailbox entry for `side` to its current
    /// connection, in ascending sequence order.
    ///
    /// Snapshots the undelivered entries and the connection handle under the
    /// lock, then writes with the lock released, re-checking before each
    /// frame that the handle is still the registered one. Delivery is
    /// at-least-once: a frame can be written twice across a replacement
    /// boundary, and the client watermark filters the duplicate.
    pub async fn push(&self, app_id: &str, side: Side) {
        let (entries, cur): (Vec<QueuedFrame>, Arc<L>) = {
            let guard = self.state.lock();
            let Some(room) = guard.rooms.get(app_id) else {
                return;
            };
            let Some(cur) = room.conns.get(side).clone() else {
                return;
            };
            (room.mailboxes.get(side).undelivered(), cur)
        };

        for entry in entries {
            let still_current = {
                let guard = self.state.lock();
                guard
                    .rooms
                    .get(app_id)
                    .and_then(|r| r.conns.get(side).as_ref().map(|c| c.id()))
                    == Some(cur.id())
            };
            if !still_current {
                // A newer connection will be pushed to independently.
                return;
            }

            let frame = ServerFrame::Deliver(Deliver {
                seq: entry.seq,
                from: entry.from,
                payload: entry.payload,
            });
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!(app = %app_id, %side, seq = entry.seq, error = %e, "deliver serialization failed");
                    return;
                }
            };

            if let Err(e) = cur.send_text(text, self.cfg.write_wait).await {
                warn!(app = %app_id, %side, conn = cur.id(), error = %e, "push write failed");
                self.unregister(app_id, cur.id());
                cur.close(CLOSE_NORMAL, "").await;
                return;
            }
        }

        let mut guard = self.state.lock();
        if let Some(room) = guard.rooms.get_mut(app_id) {
            room.last_activity = Instant::now();
        }
    }

    /// Evict rooms that have no live connections and have been idle longer
    /// than the configured TTL. Their mailboxes (and any undelivered
    /// entries) are dropped with them. Returns the number of rooms removed.
    pub fn sweep_idle_rooms(&self) -> usize {
        let ttl = self.cfg.room_ttl;
        let mut guard = self.state.lock();
        let before = guard.rooms.len();
        guard
            .rooms
            .retain(|_, room| room.conn_count() > 0 || room.last_activity.elapsed() <= ttl);
        let removed = before - guard.rooms.len();
        if removed > 0 {
            info!(removed, remaining = guard.rooms.len(), "idle rooms evicted");
        }
        removed
    }

    /// Periodic room GC, driven until `cancel` fires.
    pub async fn run_gc(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_idle_rooms();
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}
