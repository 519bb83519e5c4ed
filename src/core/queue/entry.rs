use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::message::{MessageUnit, MethodName};
use crate::core::qos::{MsgQos, Priority};

/// One request waiting in the client queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    unique_id: u64,
    method: MethodName,
    unit: MessageUnit,
    oneway: bool,
    redeliver_count: u32,
}

impl QueueEntry {
    /// Creates an entry without an id; the queue assigns one on `put`.
    pub fn new(method: MethodName, unit: MessageUnit) -> Self {
        Self {
            unique_id: 0,
            method,
            unit,
            oneway: false,
            redeliver_count: 0,
        }
    }

    pub fn with_unique_id(mut self, unique_id: u64) -> Self {
        self.unique_id = unique_id;
        self
    }

    /// Marks a publish whose broker acknowledgement is not awaited.
    pub fn oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    #[inline]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub(crate) fn set_unique_id(&mut self, unique_id: u64) {
        self.unique_id = unique_id;
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.unit.qos.priority
    }

    pub fn is_persistent(&self) -> bool {
        self.unit.qos.persistent
    }

    pub fn method(&self) -> MethodName {
        self.method
    }

    pub fn is_oneway(&self) -> bool {
        self.oneway
    }

    pub fn unit(&self) -> &MessageUnit {
        &self.unit
    }

    pub fn unit_mut(&mut self) -> &mut MessageUnit {
        &mut self.unit
    }

    pub fn into_unit(self) -> MessageUnit {
        self.unit
    }

    pub fn qos(&self) -> &MsgQos {
        &self.unit.qos
    }

    pub fn key(&self) -> &str {
        &self.unit.key
    }

    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        self.unit.size_in_bytes()
    }

    pub fn redeliver_count(&self) -> u32 {
        self.redeliver_count
    }

    pub(crate) fn increment_redeliver(&mut self) {
        self.redeliver_count += 1;
        self.unit.qos.redeliver = self.redeliver_count;
    }

    /// Dispatch order: higher priority first, then insertion order.
    #[inline]
    pub fn sort_key(&self) -> EntryKey {
        EntryKey {
            priority: Reverse(self.priority()),
            unique_id: self.unique_id,
        }
    }
}

/// Ordering key of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub priority: Reverse<Priority>,
    pub unique_id: u64,
}

/// Hands out strictly increasing nanosecond timestamps.
///
/// Two calls within the same nanosecond get consecutive values.
#[derive(Debug, Default)]
pub struct UniqueIdClock {
    last: AtomicU64,
}

impl UniqueIdClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
