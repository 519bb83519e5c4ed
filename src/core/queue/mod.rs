//! Client side queue.
//!
//! Requests that cannot be sent right away wait here, ordered by priority and
//! then by insertion. Storage sits behind [`EntryStore`] so a persistent
//! backend can replace the built-in RAM store.

pub mod client_queue;
pub mod entry;
pub mod policy;
pub mod ram;

pub use client_queue::{ClientQueue, PutOutcome, QueueSize};
pub use entry::{EntryKey, QueueEntry, UniqueIdClock};
pub use policy::{FailurePolicy, OverflowPolicy, Relating};
pub use ram::RamStore;

use std::fmt::Debug;

/// Storage backend of a [`ClientQueue`].
///
/// The queue serializes all access, so implementations need no locking of
/// their own. Iteration is always in dispatch order.
pub trait EntryStore: Send + Debug {
    /// Stores the entry. Returns `false` if its unique id is already present.
    fn insert(&mut self, entry: QueueEntry) -> bool;

    fn contains(&self, unique_id: u64) -> bool;

    fn remove(&mut self, unique_id: u64) -> Option<QueueEntry>;

    fn get_mut(&mut self, unique_id: u64) -> Option<&mut QueueEntry>;

    /// All entries in dispatch order.
    fn iter_ordered(&self) -> Box<dyn DoubleEndedIterator<Item = &QueueEntry> + '_>;

    fn drain(&mut self) -> Vec<QueueEntry>;

    fn len(&self) -> usize;

    fn bytes(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
