use std::sync::atomic::{AtomicU64, Ordering};

/// Per-client counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    direct_sends: AtomicU64,
    queued: AtomicU64,
    dispatched_batches: AtomicU64,
    dispatched_entries: AtomicU64,
    dispatched_bytes: AtomicU64,
    discarded_overflow: AtomicU64,
    evicted_overflow: AtomicU64,
    dead_lettered: AtomicU64,
    dropped_expired: AtomicU64,
    redeliveries: AtomicU64,
    ping_failures: AtomicU64,
    reconnects: AtomicU64,
    reached_dead: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub direct_sends: u64,
    pub queued: u64,
    pub dispatched_batches: u64,
    pub dispatched_entries: u64,
    pub dispatched_bytes: u64,
    pub discarded_overflow: u64,
    pub evicted_overflow: u64,
    pub dead_lettered: u64,
    pub dropped_expired: u64,
    pub redeliveries: u64,
    pub ping_failures: u64,
    pub reconnects: u64,
    pub reached_dead: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_direct_sends(&self, n: u64) {
        self.direct_sends.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_queued(&self, n: u64) {
        self.queued.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_dispatched(&self, entries: u64, bytes: u64) {
        self.dispatched_batches.fetch_add(1, Ordering::Relaxed);
        self.dispatched_entries.fetch_add(entries, Ordering::Relaxed);
        self.dispatched_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_discarded_overflow(&self, n: u64) {
        self.discarded_overflow.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_evicted_overflow(&self, n: u64) {
        self.evicted_overflow.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_dead_lettered(&self, n: u64) {
        self.dead_lettered.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_dropped_expired(&self, n: u64) {
        self.dropped_expired.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_redeliveries(&self, n: u64) {
        self.redeliveries.fetch_add(n, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_ping_failures(&self) {
        self.ping_failures.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_reached_dead(&self) {
        self.reached_dead.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            direct_sends: self.direct_sends.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dispatched_batches: self.dispatched_batches.load(Ordering::Relaxed),
            dispatched_entries: self.dispatched_entries.load(Ordering::Relaxed),
            dispatched_bytes: self.dispatched_bytes.load(Ordering::Relaxed),
            discarded_overflow: self.discarded_overflow.load(Ordering::Relaxed),
            evicted_overflow: self.evicted_overflow.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped_expired: self.dropped_expired.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            reached_dead: self.reached_dead.load(Ordering::Relaxed),
        }
    }

    /// Prometheus-style text, one `blipmq_client_*` line per counter.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        format!(
            "blipmq_client_direct_sends {}\nblipmq_client_queued {}\nblipmq_client_dispatched_batches {}\nblipmq_client_dispatched_entries {}\nblipmq_client_dispatched_bytes {}\nblipmq_client_discarded_overflow {}\nblipmq_client_evicted_overflow {}\nblipmq_client_dead_lettered {}\nblipmq_client_dropped_expired {}\nblipmq_client_redeliveries {}\nblipmq_client_ping_failures {}\nblipmq_client_reconnects {}\nblipmq_client_reached_dead {}\n",
            s.direct_sends,
            s.queued,
            s.dispatched_batches,
            s.dispatched_entries,
            s.dispatched_bytes,
            s.discarded_overflow,
            s.evicted_overflow,
            s.dead_lettered,
            s.dropped_expired,
            s.redeliveries,
            s.ping_failures,
            s.reconnects,
            s.reached_dead,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_counters() {
        let m = ClientMetrics::new();
        m.inc_dispatched(3, 120);
        m.inc_dispatched(1, 10);
        m.inc_reconnects();

        let snap = m.snapshot();
        assert_eq!(snap.dispatched_batches, 2);
        assert_eq!(snap.dispatched_entries, 4);
        assert_eq!(snap.dispatched_bytes, 130);

        let text = m.render();
        assert!(text.contains("blipmq_client_dispatched_entries 4\n"));
        assert!(text.contains("blipmq_client_reconnects 1\n"));
    }
}
