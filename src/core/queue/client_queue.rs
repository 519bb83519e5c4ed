use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::QueueConfig;
use crate::core::dlq::{DeadLetterReason, DeadLetterSink};
use crate::core::error::{ClientError, ClientResult};
use crate::core::queue::entry::{QueueEntry, UniqueIdClock};
use crate::core::queue::policy::OverflowPolicy;
use crate::core::queue::ram::RamStore;
use crate::core::queue::EntryStore;
use crate::core::shutdown::ShutdownSignal;
use crate::metrics::ClientMetrics;

type PutListener = Arc<dyn Fn() + Send + Sync>;

/// Current fill level of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSize {
    pub entries: usize,
    pub bytes: u64,
}

/// What a successful `put` did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored, possibly after evicting `evicted` older entries.
    Queued { evicted: usize },
    /// Dropped by the overflow policy.
    Discarded,
    /// Redirected to the dead letter sink by the overflow policy.
    DeadLettered,
}

enum Attempt {
    Done(PutOutcome),
    Wait(QueueEntry),
}

/// Bounded, priority ordered queue of outgoing requests.
///
/// Every mutating operation runs under one lock, so `entries <= maxEntries`
/// and `bytes <= maxBytes` hold whenever the queue can be observed.
pub struct ClientQueue {
    config: QueueConfig,
    store: Mutex<Box<dyn EntryStore>>,
    clock: UniqueIdClock,
    space: Notify,
    shutdown: ShutdownSignal,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<ClientMetrics>,
    put_listener: Mutex<Option<PutListener>>,
}

impl ClientQueue {
    /// Builds a queue with the built-in store for `config.queue_type`.
    pub fn new(
        config: QueueConfig,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<ClientMetrics>,
    ) -> ClientResult<Self> {
        if !config.queue_type.eq_ignore_ascii_case("RAM") {
            return Err(ClientError::UnsupportedQueueType(config.queue_type));
        }
        Ok(Self::with_store(
            config,
            Box::new(RamStore::new()),
            dead_letters,
            metrics,
        ))
    }

    /// Builds a queue over an externally provided store.
    pub fn with_store(
        config: QueueConfig,
        store: Box<dyn EntryStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        debug!(
            target: "blipmq_client::queue",
            queue_type = %config.queue_type,
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            on_overflow = %config.on_overflow,
            "client queue created"
        );
        Self {
            config,
            store: Mutex::new(store),
            clock: UniqueIdClock::new(),
            space: Notify::new(),
            shutdown: ShutdownSignal::new(),
            dead_letters,
            metrics,
            put_listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Called after every successful insert, outside the queue lock.
    pub fn set_put_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.put_listener.lock() = Some(Arc::new(listener));
    }

    /// Stores an entry, applying the overflow policy when there is no room.
    ///
    /// With the `block` policy the call waits up to the configured block
    /// timeout for room before failing with `QueueFull`.
    pub async fn put(&self, entry: QueueEntry) -> ClientResult<PutOutcome> {
        let deadline = Instant::now() + Duration::from_millis(self.config.block_timeout_ms);
        let mut entry = entry;
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.attempt(entry)? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Wait(pending) => entry = pending,
            }

            trace!(target: "blipmq_client::queue", unique_id = entry.unique_id(), "queue full, blocking");
            tokio::select! {
                _ = &mut space => {}
                _ = time::sleep_until(deadline) => {
                    let size = self.size();
                    warn!(
                        target: "blipmq_client::queue",
                        entries = size.entries,
                        bytes = size.bytes,
                        timeout_ms = self.config.block_timeout_ms,
                        "blocking put timed out"
                    );
                    return Err(ClientError::QueueFull { entries: size.entries, bytes: size.bytes });
                }
                _ = self.shutdown.wait() => return Err(ClientError::Shutdown),
            }
        }
    }

    /// Like [`put`](Self::put) but never waits; `block` behaves like `exception`.
    pub fn try_put(&self, entry: QueueEntry) -> ClientResult<PutOutcome> {
        match self.attempt(entry)? {
            Attempt::Done(outcome) => Ok(outcome),
            Attempt::Wait(_) => {
                let size = self.size();
                Err(ClientError::QueueFull {
                    entries: size.entries,
                    bytes: size.bytes,
                })
            }
        }
    }

    fn attempt(&self, mut entry: QueueEntry) -> ClientResult<Attempt> {
        if self.shutdown.is_shutting_down() {
            return Err(ClientError::Shutdown);
        }

        let mut store = self.store.lock();
        let unique_id = entry.unique_id();
        if unique_id != 0 && store.contains(unique_id) {
            drop(store);
            error!(
                target: "blipmq_client::queue",
                unique_id,
                "entry with identical unique id already queued, ignoring put"
            );
            return Err(ClientError::DuplicateEntry(unique_id));
        }

        // Ids are stamped under the store lock once the entry's fate is
        // decided, so FIFO order within a priority is insertion order.
        if self.has_room(&**store, entry.size_in_bytes()) {
            self.stamp(&mut entry);
            store.insert(entry);
            drop(store);
            self.after_insert();
            return Ok(Attempt::Done(PutOutcome::Queued { evicted: 0 }));
        }

        let full = QueueSize {
            entries: store.len(),
            bytes: store.bytes(),
        };
        match self.config.on_overflow {
            OverflowPolicy::Exception => Err(ClientError::QueueFull {
                entries: full.entries,
                bytes: full.bytes,
            }),
            OverflowPolicy::Block => {
                if entry.size_in_bytes() > self.config.max_bytes {
                    return Err(ClientError::QueueFull {
                        entries: full.entries,
                        bytes: full.bytes,
                    });
                }
                Ok(Attempt::Wait(entry))
            }
            OverflowPolicy::Discard => {
                self.stamp(&mut entry);
                drop(store);
                self.discard(&entry, full);
                Ok(Attempt::Done(PutOutcome::Discarded))
            }
            OverflowPolicy::DeadMessage => {
                self.stamp(&mut entry);
                drop(store);
                self.metrics.inc_dead_lettered(1);
                self.dead_letters
                    .dead_letter(entry, DeadLetterReason::Overflow);
                Ok(Attempt::Done(PutOutcome::DeadLettered))
            }
            OverflowPolicy::DiscardOldest => {
                self.stamp(&mut entry);
                let Some(victims) = plan_evictions(
                    &**store,
                    &entry,
                    self.max_entries(),
                    self.config.max_bytes,
                ) else {
                    drop(store);
                    self.discard(&entry, full);
                    return Ok(Attempt::Done(PutOutcome::Discarded));
                };
                let evicted: Vec<QueueEntry> = victims
                    .into_iter()
                    .filter_map(|id| store.remove(id))
                    .collect();
                store.insert(entry);
                drop(store);

                for victim in &evicted {
                    warn!(
                        target: "blipmq_client::queue",
                        unique_id = victim.unique_id(),
                        priority = %victim.priority(),
                        key = victim.key(),
                        "queue full, evicted oldest entry"
                    );
                }
                self.metrics.inc_evicted_overflow(evicted.len() as u64);
                self.after_insert();
                Ok(Attempt::Done(PutOutcome::Queued {
                    evicted: evicted.len(),
                }))
            }
        }
    }

    /// Caller-supplied ids are kept.
    #[inline]
    fn stamp(&self, entry: &mut QueueEntry) {
        if entry.unique_id() == 0 {
            entry.set_unique_id(self.clock.next_id());
        }
    }

    fn has_room(&self, store: &dyn EntryStore, size: u64) -> bool {
        store.len() < self.max_entries() && store.bytes() + size <= self.config.max_bytes
    }

    fn discard(&self, entry: &QueueEntry, full: QueueSize) {
        self.metrics.inc_discarded_overflow(1);
        warn!(
            target: "blipmq_client::queue",
            unique_id = entry.unique_id(),
            key = entry.key(),
            entries = full.entries,
            bytes = full.bytes,
            "queue full, discarding entry"
        );
    }

    fn after_insert(&self) {
        self.metrics.inc_queued(1);
        let listener = self.put_listener.lock().clone();
        if let Some(listener) = listener {
            listener();
        }
    }

    #[inline]
    fn max_entries(&self) -> usize {
        usize::try_from(self.config.max_entries).unwrap_or(usize::MAX)
    }

    /// Copies entries in dispatch order without removing them.
    ///
    /// Stops at `max_entries` entries or before `max_bytes` would be exceeded,
    /// but always returns at least one entry when the queue is not empty.
    pub fn peek(&self, max_entries: Option<usize>, max_bytes: Option<u64>) -> Vec<QueueEntry> {
        let store = self.store.lock();
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        for entry in store.iter_ordered() {
            if max_entries.is_some_and(|n| batch.len() >= n) {
                break;
            }
            let size = entry.size_in_bytes();
            if max_bytes.is_some_and(|limit| !batch.is_empty() && bytes + size > limit) {
                break;
            }
            bytes += size;
            batch.push(entry.clone());
        }
        batch
    }

    /// Removes the given entries. Entries no longer queued are ignored.
    pub fn remove(&self, entries: &[QueueEntry]) -> usize {
        let removed = {
            let mut store = self.store.lock();
            entries
                .iter()
                .filter(|e| store.remove(e.unique_id()).is_some())
                .count()
        };
        if removed > 0 {
            self.space.notify_waiters();
        }
        removed
    }

    /// Drops every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        self.take_all().len()
    }

    /// Removes and returns every entry in dispatch order.
    pub fn take_all(&self) -> Vec<QueueEntry> {
        let drained = self.store.lock().drain();
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }

    /// Bumps the redeliver counter of entries that are still queued.
    pub fn mark_redelivered(&self, entries: &[QueueEntry]) -> usize {
        let marked = {
            let mut store = self.store.lock();
            let mut marked = 0;
            for e in entries {
                if let Some(queued) = store.get_mut(e.unique_id()) {
                    queued.increment_redeliver();
                    marked += 1;
                }
            }
            marked
        };
        self.metrics.inc_redeliveries(marked as u64);
        marked
    }

    pub fn size(&self) -> QueueSize {
        let store = self.store.lock();
        QueueSize {
            entries: store.len(),
            bytes: store.bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Fails blocked and future puts with `Shutdown`. Queued entries stay.
    pub fn close(&self) {
        if self.shutdown.trigger() {
            self.space.notify_waiters();
        }
    }
}

impl fmt::Debug for ClientQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientQueue")
            .field("config", &self.config)
            .field("size", &self.size())
            .finish()
    }
}

/// Picks the entries to evict so `incoming` fits: lowest priority first and
/// the oldest within a priority. Returns `None` when `incoming` itself is the
/// best victim, i.e. room can only be made by evicting higher priorities.
fn plan_evictions(
    store: &dyn EntryStore,
    incoming: &QueueEntry,
    max_entries: usize,
    max_bytes: u64,
) -> Option<Vec<u64>> {
    let mut need_entries = (store.len() + 1).saturating_sub(max_entries);
    let mut need_bytes = (store.bytes() + incoming.size_in_bytes()).saturating_sub(max_bytes);
    let mut victims = Vec::new();
    let mut lowest_first = store.iter_ordered().rev().peekable();

    while need_entries > 0 || need_bytes > 0 {
        let priority = lowest_first.peek()?.priority();
        if priority > incoming.priority() {
            return None;
        }
        let mut group = Vec::new();
        while let Some(e) = lowest_first.next_if(|e| e.priority() == priority) {
            group.push(e);
        }
        // group is newest first
        for e in group.into_iter().rev() {
            if need_entries == 0 && need_bytes == 0 {
                break;
            }
            victims.push(e.unique_id());
            need_entries = need_entries.saturating_sub(1);
            need_bytes = need_bytes.saturating_sub(e.size_in_bytes());
        }
    }
    Some(victims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dlq::DeadLetterQueue;
    use crate::core::message::{MessageUnit, MethodName};
    use crate::core::qos::{MsgQos, Priority};

    fn config(max_entries: u64, policy: OverflowPolicy) -> QueueConfig {
        QueueConfig {
            max_entries,
            on_overflow: policy,
            ..QueueConfig::default()
        }
    }

    fn queue(cfg: QueueConfig) -> (ClientQueue, Arc<DeadLetterQueue>) {
        let dlq = Arc::new(DeadLetterQueue::new(16));
        let q = ClientQueue::new(cfg, dlq.clone(), Arc::new(ClientMetrics::new())).unwrap();
        (q, dlq)
    }

    fn entry(priority: u8, content: &str) -> QueueEntry {
        let qos = MsgQos::new().with_priority(Priority::new(priority).unwrap());
        QueueEntry::new(MethodName::Publish, MessageUnit::new("t", content.to_owned(), qos))
    }

    fn contents(entries: &[QueueEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|e| String::from_utf8_lossy(&e.unit().content).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn peek_follows_priority_then_fifo() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        q.put(entry(5, "a")).await.unwrap();
        q.put(entry(9, "b")).await.unwrap();
        q.put(entry(5, "c")).await.unwrap();
        q.put(entry(1, "d")).await.unwrap();

        assert_eq!(contents(&q.peek(None, None)), vec!["b", "a", "c", "d"]);
        assert_eq!(contents(&q.peek(Some(2), None)), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn peek_respects_bytes_but_returns_one() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        q.put(entry(5, "aaaa")).await.unwrap(); // 5 bytes with key
        q.put(entry(5, "bbbb")).await.unwrap();
        q.put(entry(5, "cccc")).await.unwrap();

        assert_eq!(q.peek(None, Some(10)).len(), 2);
        assert_eq!(q.peek(None, Some(9)).len(), 1);
        assert_eq!(q.peek(None, Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn exception_policy_fails_when_full() {
        let (q, _) = queue(config(2, OverflowPolicy::Exception));
        q.put(entry(5, "a")).await.unwrap();
        q.put(entry(5, "b")).await.unwrap();
        let err = q.put(entry(5, "c")).await.unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { entries: 2, .. }));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn byte_limit_is_enforced() {
        let cfg = QueueConfig {
            max_bytes: 10,
            ..config(100, OverflowPolicy::Exception)
        };
        let (q, _) = queue(cfg);
        q.put(entry(5, "aaaa")).await.unwrap();
        q.put(entry(5, "bbbb")).await.unwrap();
        assert!(q.put(entry(5, "c")).await.is_err());
        assert_eq!(q.size(), QueueSize { entries: 2, bytes: 10 });
    }

    #[tokio::test]
    async fn discard_policy_counts_and_drops() {
        let (q, dlq) = queue(config(1, OverflowPolicy::Discard));
        q.put(entry(5, "a")).await.unwrap();
        assert_eq!(q.put(entry(9, "b")).await.unwrap(), PutOutcome::Discarded);
        assert_eq!(contents(&q.peek(None, None)), vec!["a"]);
        assert!(dlq.is_empty());
        assert_eq!(q.metrics.snapshot().discarded_overflow, 1);
    }

    #[tokio::test]
    async fn dead_message_policy_redirects_incoming() {
        let (q, dlq) = queue(config(1, OverflowPolicy::DeadMessage));
        q.put(entry(5, "a")).await.unwrap();
        assert_eq!(q.put(entry(5, "b")).await.unwrap(), PutOutcome::DeadLettered);
        let letters = dlq.drain();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::Overflow);
        assert_eq!(&letters[0].entry.unit().content[..], b"b");
    }

    #[tokio::test]
    async fn discard_oldest_evicts_lowest_priority_oldest() {
        let (q, _) = queue(config(3, OverflowPolicy::DiscardOldest));
        q.put(entry(5, "a")).await.unwrap();
        q.put(entry(3, "b")).await.unwrap();
        q.put(entry(3, "c")).await.unwrap();

        let outcome = q.put(entry(5, "d")).await.unwrap();
        assert_eq!(outcome, PutOutcome::Queued { evicted: 1 });
        assert_eq!(contents(&q.peek(None, None)), vec!["a", "d", "c"]);
    }

    #[tokio::test]
    async fn discard_oldest_drops_incoming_when_it_ranks_lowest() {
        let (q, _) = queue(config(2, OverflowPolicy::DiscardOldest));
        q.put(entry(7, "a")).await.unwrap();
        q.put(entry(7, "b")).await.unwrap();

        assert_eq!(q.put(entry(3, "c")).await.unwrap(), PutOutcome::Discarded);
        assert_eq!(contents(&q.peek(None, None)), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn duplicate_unique_id_is_rejected() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        q.put(entry(5, "a").with_unique_id(42)).await.unwrap();
        let err = q.put(entry(5, "b").with_unique_id(42)).await.unwrap_err();
        assert!(matches!(err, ClientError::DuplicateEntry(42)));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        q.put(entry(5, "a")).await.unwrap();
        q.put(entry(5, "b")).await.unwrap();
        let batch = q.peek(Some(1), None);

        assert_eq!(q.remove(&batch), 1);
        assert_eq!(q.remove(&batch), 0);
        assert_eq!(contents(&q.peek(None, None)), vec!["b"]);
    }

    #[tokio::test]
    async fn mark_redelivered_touches_only_queued_entries() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        q.put(entry(5, "a")).await.unwrap();
        let batch = q.peek(None, None);
        assert_eq!(q.mark_redelivered(&batch), 1);
        assert_eq!(q.peek(None, None)[0].redeliver_count(), 1);

        q.clear();
        assert_eq!(q.mark_redelivered(&batch), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn block_times_out() {
        let cfg = QueueConfig {
            block_timeout_ms: 100,
            ..config(1, OverflowPolicy::Block)
        };
        let (q, _) = queue(cfg);
        q.put(entry(5, "a")).await.unwrap();

        let started = Instant::now();
        let err = q.put(entry(5, "b")).await.unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn close_releases_blocked_put() {
        let (q, _) = queue(config(1, OverflowPolicy::Block));
        let q = Arc::new(q);
        q.put(entry(5, "a")).await.unwrap();

        let blocked = {
            let q = q.clone();
            tokio::spawn(async move { q.put(entry(5, "b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let res = blocked.await.unwrap();
        assert!(matches!(res, Err(ClientError::Shutdown)));
    }

    #[tokio::test]
    async fn blocked_put_is_stamped_when_it_gets_in() {
        let (q, _) = queue(config(1, OverflowPolicy::Block));
        let q = Arc::new(q);
        q.put(entry(5, "e1")).await.unwrap();

        let blocked = {
            let q = q.clone();
            tokio::spawn(async move { q.put(entry(5, "e2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // e3 takes the freed slot before the waiter is polled again
        q.remove(&q.peek(None, None));
        q.try_put(entry(5, "e3")).unwrap();

        let mut delivered = Vec::new();
        while delivered.len() < 2 {
            let batch = q.peek(Some(1), None);
            if batch.is_empty() {
                tokio::task::yield_now().await;
                continue;
            }
            q.remove(&batch);
            delivered.extend(batch);
        }
        assert!(blocked.await.unwrap().is_ok());

        assert_eq!(contents(&delivered), vec!["e3", "e2"]);
        assert!(delivered[0].unique_id() < delivered[1].unique_id());
    }

    #[tokio::test]
    async fn unique_ids_follow_insertion_order() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        for c in ["a", "b", "c"] {
            q.put(entry(5, c)).await.unwrap();
        }
        let ids: Vec<u64> = q.peek(None, None).iter().map(|e| e.unique_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|&id| id != 0));
    }

    #[tokio::test]
    async fn put_listener_runs_after_insert() {
        let (q, _) = queue(config(10, OverflowPolicy::Exception));
        let (tx, rx) = flume::unbounded();
        q.set_put_listener(move || {
            let _ = tx.send(());
        });
        q.put(entry(5, "a")).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn non_ram_type_needs_a_store() {
        for queue_type in ["JDBC", "CACHE"] {
            let cfg = QueueConfig {
                queue_type: queue_type.into(),
                max_entries_cache: 1,
                ..QueueConfig::default()
            };
            let err = ClientQueue::new(
                cfg,
                Arc::new(DeadLetterQueue::new(1)),
                Arc::new(ClientMetrics::new()),
            )
            .unwrap_err();
            assert!(matches!(err, ClientError::UnsupportedQueueType(t) if t == queue_type));
        }
    }
}
