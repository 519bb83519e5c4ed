use std::collections::{BTreeMap, HashMap};

use crate::core::queue::entry::{EntryKey, QueueEntry};
use crate::core::queue::EntryStore;

/// In-memory store, the `RAM` queue type.
#[derive(Debug, Default)]
pub struct RamStore {
    entries: BTreeMap<EntryKey, QueueEntry>,
    keys: HashMap<u64, EntryKey>,
    bytes: u64,
}

impl RamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntryStore for RamStore {
    fn insert(&mut self, entry: QueueEntry) -> bool {
        if self.keys.contains_key(&entry.unique_id()) {
            return false;
        }
        let key = entry.sort_key();
        self.bytes += entry.size_in_bytes();
        self.keys.insert(entry.unique_id(), key);
        self.entries.insert(key, entry);
        true
    }

    fn contains(&self, unique_id: u64) -> bool {
        self.keys.contains_key(&unique_id)
    }

    fn remove(&mut self, unique_id: u64) -> Option<QueueEntry> {
        let key = self.keys.remove(&unique_id)?;
        let entry = self.entries.remove(&key)?;
        self.bytes -= entry.size_in_bytes();
        Some(entry)
    }

    fn get_mut(&mut self, unique_id: u64) -> Option<&mut QueueEntry> {
        let key = self.keys.get(&unique_id)?;
        self.entries.get_mut(key)
    }

    fn iter_ordered(&self) -> Box<dyn DoubleEndedIterator<Item = &QueueEntry> + '_> {
        Box::new(self.entries.values())
    }

    fn drain(&mut self) -> Vec<QueueEntry> {
        self.keys.clear();
        self.bytes = 0;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn bytes(&self) -> u64 {
        self.bytes
    }
}
