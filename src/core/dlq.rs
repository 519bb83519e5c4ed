//! Dead letter handling.
//!
//! Entries the client gives up on (overflow, expiry, broker rejection, a
//! connection that reached DEAD) are handed to a [`DeadLetterSink`]. The
//! default sink is a bounded in-memory ring the application can drain.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use tokio::time::Instant;
use tracing::warn;

use crate::core::queue::QueueEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// Queue full with the `deadMessage` overflow policy.
    Overflow,
    /// Lifetime ran out while waiting in the queue.
    Expired,
    /// Connection reached DEAD with the `deadMessage` failure policy.
    Exhausted,
    /// The broker refused the request.
    Rejected,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterReason::Overflow => "overflow",
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::Exhausted => "exhausted",
            DeadLetterReason::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: DeadLetterReason,
    pub at: Instant,
}

pub trait DeadLetterSink: Send + Sync + fmt::Debug {
    fn dead_letter(&self, entry: QueueEntry, reason: DeadLetterReason);
}

/// Bounded ring of dead letters. When full the oldest letter is overwritten.
#[derive(Debug)]
pub struct DeadLetterQueue {
    letters: ArrayQueue<DeadLetter>,
    received: AtomicU64,
    overwritten: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: ArrayQueue::new(capacity.max(1)),
            received: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.letters.capacity()
    }

    /// Total letters ever received, including overwritten ones.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Removes and returns every letter, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::iter::from_fn(|| self.letters.pop()).collect()
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter(&self, entry: QueueEntry, reason: DeadLetterReason) {
        warn!(
            target: "blipmq_client::dlq",
            unique_id = entry.unique_id(),
            key = entry.key(),
            method = %entry.method(),
            %reason,
            "entry moved to dead letter queue"
        );
        self.received.fetch_add(1, Ordering::Relaxed);
        let letter = DeadLetter {
            entry,
            reason,
            at: Instant::now(),
        };
        if self.letters.force_push(letter).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }
}
