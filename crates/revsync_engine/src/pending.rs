//! Tracks which remote sequences are safe to checkpoint.

use revsync_protocol::RemoteSeq;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Remote sequences in arrival order, split into pending and completed.
///
/// Remote sequences are opaque, so ordering comes from arrival tickets. The
/// checkpoint is the sequence of the newest completed ticket older than every
/// pending one. An entry that never completes holds the checkpoint back for
/// the rest of the session. Between two pending tickets only the newest
/// completion is kept, so a stuck entry costs constant memory.
#[derive(Debug, Default)]
pub struct PendingSequences {
    next_ticket: u64,
    pending: BTreeMap<u64, RemoteSeq>,
    completed: BTreeMap<u64, RemoteSeq>,
}

impl PendingSequences {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sequence as in flight and returns its ticket.
    pub fn add(&mut self, sequence: RemoteSeq) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending.insert(ticket, sequence);
        ticket
    }

    /// Marks a ticket done. Returns the new checkpoint if it moved.
    pub fn complete(&mut self, ticket: u64) -> Option<RemoteSeq> {
        let sequence = self.pending.remove(&ticket)?;
        self.completed.insert(ticket, sequence);

        let floor = self.pending.keys().next().copied().unwrap_or(u64::MAX);
        let still_blocked = self.completed.split_off(&floor);
        let releasable = std::mem::replace(&mut self.completed, still_blocked);
        let released = releasable.into_values().next_back();
        self.collapse_around(ticket);
        released
    }

    /// Drops all but the newest completion between the pending tickets
    /// surrounding `ticket`.
    fn collapse_around(&mut self, ticket: u64) {
        let below = self
            .pending
            .range(..ticket)
            .next_back()
            .map_or(Unbounded, |(&t, _)| Excluded(t));
        let above = self
            .pending
            .range(ticket..)
            .next()
            .map_or(Unbounded, |(&t, _)| Excluded(t));
        let mut superseded: Vec<u64> = self
            .completed
            .range((below, above))
            .map(|(&t, _)| t)
            .collect();
        superseded.pop();
        for t in superseded {
            self.completed.remove(&t);
        }
    }

    /// Returns `sequence` as the checkpoint if nothing is in flight.
    ///
    /// Used when the feed reports it is caught up at a sequence past the last
    /// entry it delivered, e.g. because a filter rejected the rest.
    pub fn advance_idle(&self, sequence: RemoteSeq) -> Option<RemoteSeq> {
        (self.is_empty() && self.completed.is_empty()).then_some(sequence)
    }

    /// Number of sequences in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
