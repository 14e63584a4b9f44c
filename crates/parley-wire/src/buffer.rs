//! Bounded ring of unacknowledged outbound messages.
//!
//! Every outbound envelope is assigned a monotonically increasing sequence
//! number and held here until the client acknowledges it. A reconnecting
//! client replays everything after its last processed sequence number. When
//! the ring overflows while nobody is reading, the oldest entries are evicted
//! and a gap marker records the lost range.

use crate::frame::StreamFrame;
use parley_types::envelope::Envelope;
use std::collections::VecDeque;

/// Outcome of pushing into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored under this sequence number.
    Stored(u64),
    /// Stored under this sequence number after evicting the oldest entry.
    StoredWithEviction { seq: u64, evicted: u64 },
}

impl PushOutcome {
    pub fn seq(self) -> u64 {
        match self {
            PushOutcome::Stored(seq) => seq,
            PushOutcome::StoredWithEviction { seq, .. } => seq,
        }
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferCounters {
    /// Entries currently held.
    pub buffered: usize,
    /// Events dropped under backpressure.
    pub dropped_events: u64,
    /// Entries evicted to make room (covered by gap markers).
    pub evicted: u64,
}

#[derive(Debug)]
pub struct OutboundBuffer {
    capacity: usize,
    entries: VecDeque<(u64, Envelope)>,
    next_seq: u64,
    /// Highest acknowledged sequence number.
    acked: u64,
    /// Evicted, never-delivered range still ahead of the ack cursor.
    gap: Option<(u64, u64)>,
    dropped_events: u64,
    evicted: u64,
}

impl OutboundBuffer {
    /// Create an empty buffer. Sequence numbers start at 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            next_seq: 1,
            acked: 0,
            gap: None,
            dropped_events: 0,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number the next stored envelope will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// Store an envelope. The caller must check [`is_full`](Self::is_full)
    /// first if it wants to avoid eviction.
    pub fn push(&mut self, envelope: Envelope) -> PushOutcome {
        let seq = self.next_seq;
        self.next_seq += 1;

        let evicted = if self.is_full() {
            self.entries.pop_front().map(|(old, _)| {
                self.evicted += 1;
                self.gap = Some(match self.gap {
                    Some((from, _)) => (from, old),
                    None => (old, old),
                });
                old
            })
        } else {
            None
        };

        self.entries.push_back((seq, envelope));
        match evicted {
            Some(evicted) => PushOutcome::StoredWithEviction { seq, evicted },
            None => PushOutcome::Stored(seq),
        }
    }

    /// Count an event that was refused because the buffer was full.
    pub fn record_dropped_event(&mut self) {
        self.dropped_events += 1;
    }

    /// Drop everything up to and including `seq`. Returns the number of
    /// entries released. Acks never move backwards.
    pub fn ack(&mut self, seq: u64) -> usize {
        if seq <= self.acked {
            return 0;
        }
        let seq = seq.min(self.next_seq.saturating_sub(1));
        self.acked = seq;
        let before = self.entries.len();
        while self.entries.front().is_some_and(|(s, _)| *s <= seq) {
            self.entries.pop_front();
        }
        if self.gap.is_some_and(|(_, to)| to <= seq) {
            self.gap = None;
        }
        before - self.entries.len()
    }

    /// Frames to redeliver to a client that has processed everything up to
    /// `after_seq`, in original order: an optional gap marker followed by
    /// the buffered data frames.
    pub fn replay(&self, after_seq: u64) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        if let Some((from, to)) = self.gap {
            if to > after_seq {
                frames.push(StreamFrame::Gap {
                    from_seq: from.max(after_seq + 1),
                    to_seq: to,
                });
            }
        }
        frames.extend(
            self.entries
                .iter()
                .filter(|(seq, _)| *seq > after_seq)
                .map(|(seq, envelope)| StreamFrame::Data {
                    seq: *seq,
                    envelope: envelope.clone(),
                }),
        );
        frames
    }

    pub fn counters(&self) -> BufferCounters {
        BufferCounters {
            buffered: self.entries.len(),
            dropped_events: self.dropped_events,
            evicted: self.evicted,
        }
    }
}
