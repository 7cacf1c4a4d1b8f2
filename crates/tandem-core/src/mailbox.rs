//! Per-side mailbox: a sequenced inbox with an acknowledgment watermark.

use std::collections::VecDeque;

use serde_json::value::RawValue;

use crate::error::SwitchboardError;
use crate::frame::Side;

/// One queued application message.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub seq: u64,
    pub from: Side,
    pub payload: Box<RawValue>,
}

/// Inbox for messages addressed *to* one side of a room.
///
/// `seq` values are assigned at enqueue time, start at 1, and are never
/// reused for the lifetime of the mailbox, even after trimming. Entries are
/// kept in strictly ascending `seq` order; everything at or below
/// `delivered_up_to` is dropped by [`advance`](Self::advance).
///
/// Mailboxes live only in memory. If durability is added later, this type is
/// the insertion point: enqueue/advance/undelivered are the whole surface,
/// and `seq` assignment must stay monotonic across restarts.
#[derive(Debug, Default)]
pub struct Mailbox {
    next_seq: u64,
    delivered_up_to: u64,
    queue: VecDeque<QueuedFrame>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence the owning side has acknowledged.
    pub fn delivered_up_to(&self) -> u64 {
        self.delivered_up_to
    }

    /// Number of queued (undelivered or unacknowledged) entries.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a message, assigning it the next sequence number.
    ///
    /// Rejects with [`SwitchboardError::BacklogLimit`] when the queue is
    /// already at `cap`, without mutating the queue or consuming a sequence
    /// number.
    pub fn enqueue(
        &mut self,
        from: Side,
        payload: Box<RawValue>,
        cap: usize,
    ) -> Result<u64, SwitchboardError> {
        if self.queue.len() >= cap {
            return Err(SwitchboardError::BacklogLimit {
                queued: self.queue.len(),
                cap,
            });
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.queue.push_back(QueuedFrame { seq, from, payload });
        Ok(seq)
    }

    /// Advance the watermark to `up_to` if it is higher than the current
    /// one, trimming every entry at or below it. Returns whether the
    /// watermark moved. The watermark never decreases and never passes
    /// `next_seq`, so a client cannot acknowledge sequences that were never
    /// assigned.
    pub fn advance(&mut self, up_to: u64) -> bool {
        let up_to = up_to.min(self.next_seq);
        if up_to <= self.delivered_up_to {
            return false;
        }
        self.delivered_up_to = up_to;
        while self
            .queue
            .front()
            .is_some_and(|f| f.seq <= self.delivered_up_to)
        {
            self.queue.pop_front();
        }
        true
    }

    /// Snapshot every entry above the watermark, in ascending `seq` order.
    pub fn undelivered(&self) -> Vec<QueuedFrame> {
        self.queue
            .iter()
            .filter(|f| f.seq > self.delivered_up_to)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Box<RawValue> {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn seq_starts_at_one_and_ascends() {
        let mut m = Mailbox::new();
        assert_eq!(m.enqueue(Side::A, payload("1"), 10).unwrap(), 1);
        assert_eq!(m.enqueue(Side::A, payload("2"), 10).unwrap(), 2);
        assert_eq!(m.enqueue(Side::B, payload("3"), 10).unwrap(), 3);
        let seqs: Vec<u64> = m.undelivered().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn advance_trims_prefix_and_is_monotonic() {
        let mut m = Mailbox::new();
        for i in 1..=5 {
            m.enqueue(Side::A, payload(&i.to_string()), 10).unwrap();
        }
        assert!(m.advance(3));
        assert_eq!(m.delivered_up_to(), 3);
        assert_eq!(m.len(), 2);
        assert!(m.undelivered().iter().all(|f| f.seq > 3));

        // A lower (or equal) watermark never rewinds.
        assert!(!m.advance(2));
        assert!(!m.advance(3));
        assert_eq!(m.delivered_up_to(), 3);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn seq_not_reused_after_trim() {
        let mut m = Mailbox::new();
        m.enqueue(Side::A, payload("1"), 10).unwrap();
        m.enqueue(Side::A, payload("2"), 10).unwrap();
        m.advance(2);
        assert!(m.is_empty());
        assert_eq!(m.enqueue(Side::A, payload("3"), 10).unwrap(), 3);
    }

    #[test]
    fn enqueue_rejects_at_cap_without_mutation() {
        let mut m = Mailbox::new();
        for _ in 0..3 {
            m.enqueue(Side::B, payload("{}"), 3).unwrap();
        }
        let err = m.enqueue(Side::B, payload("{}"), 3).unwrap_err();
        assert!(matches!(
            err,
            SwitchboardError::BacklogLimit { queued: 3, cap: 3 }
        ));
        assert_eq!(m.len(), 3);
        // The rejected enqueue did not burn a sequence number.
        m.advance(3);
        assert_eq!(m.enqueue(Side::B, payload("{}"), 3).unwrap(), 4);
    }

    #[test]
    fn advance_is_clamped_to_assigned_sequences() {
        let mut m = Mailbox::new();
        m.enqueue(Side::A, payload("1"), 10).unwrap();
        assert!(m.advance(100));
        assert!(m.is_empty());
        assert_eq!(m.delivered_up_to(), 1);
        // Fresh entries still get fresh sequence numbers above the watermark.
        assert_eq!(m.enqueue(Side::A, payload("2"), 10).unwrap(), 2);
    }
}
