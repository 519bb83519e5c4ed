//! Single-loop timer service.
//!
//! Registrations are kept in a map ordered by their wake time in nanoseconds
//! (relative to the service's creation). One background task sleeps until the
//! earliest wake time, fires every due callback outside the lock and goes back
//! to sleep. A registration that would collide with an existing wake time is
//! shifted by one nanosecond until its key is unique.
//!
//! Callbacks run on the timer task itself and must not block; hand longer work
//! to a channel.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace};

use crate::core::error::{ClientError, ClientResult};
use crate::core::shutdown::ShutdownSignal;

/// Opaque value handed back to a callback when it fires.
pub type UserData = Arc<dyn Any + Send + Sync>;

type Callback = Box<dyn FnOnce(Option<UserData>) + Send + 'static>;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Identifies one registration. Stale handles are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    wake_nanos: u64,
    seq: u64,
}

struct Registration {
    seq: u64,
    callback: Callback,
    user_data: Option<UserData>,
}

struct TimerShared {
    name: String,
    origin: Instant,
    entries: Mutex<BTreeMap<u64, Registration>>,
    next_seq: AtomicU64,
    wake: Notify,
    shutdown: ShutdownSignal,
}

impl TimerShared {
    #[inline]
    fn now_nanos(&self) -> u64 {
        Instant::now().saturating_duration_since(self.origin).as_nanos() as u64
    }
}

pub struct TimerService {
    shared: Arc<TimerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Starts the scheduling loop. Must be called from within a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(TimerShared {
            name: name.into(),
            origin: Instant::now(),
            entries: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            wake: Notify::new(),
            shutdown: ShutdownSignal::new(),
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        debug!(target: "blipmq_client::timer", timer = %shared.name, "timer service started");
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Calls `callback(user_data)` once, no earlier than `delay_ms` from now.
    pub fn register<F>(
        &self,
        delay_ms: u64,
        callback: F,
        user_data: Option<UserData>,
    ) -> ClientResult<TimerHandle>
    where
        F: FnOnce(Option<UserData>) + Send + 'static,
    {
        if delay_ms < 1 {
            return Err(ClientError::InvalidArgument(
                "timer delay must be at least 1 ms".into(),
            ));
        }
        if self.shared.shutdown.is_shutting_down() {
            return Err(ClientError::Shutdown);
        }
        let registration = Registration {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            callback: Box::new(callback),
            user_data,
        };
        Ok(self.schedule(delay_ms, registration))
    }

    /// Moves a pending registration to `delay_ms` from now.
    ///
    /// Returns `Ok(None)` when the handle already fired or was cancelled.
    pub fn refresh(&self, handle: TimerHandle, delay_ms: u64) -> ClientResult<Option<TimerHandle>> {
        if delay_ms < 1 {
            return Err(ClientError::InvalidArgument(
                "timer delay must be at least 1 ms".into(),
            ));
        }
        let registration = {
            let mut entries = self.shared.entries.lock();
            match entries.get(&handle.wake_nanos) {
                Some(reg) if reg.seq == handle.seq => entries.remove(&handle.wake_nanos),
                _ => None,
            }
        };
        Ok(registration.map(|reg| self.schedule(delay_ms, reg)))
    }

    /// Drops a pending registration. Unknown handles are ignored.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut entries = self.shared.entries.lock();
        match entries.get(&handle.wake_nanos) {
            Some(reg) if reg.seq == handle.seq => {
                entries.remove(&handle.wake_nanos);
                true
            }
            _ => false,
        }
    }

    /// `true` once the registration fired or was cancelled.
    pub fn is_expired(&self, handle: TimerHandle) -> bool {
        !self.is_pending(handle)
    }

    /// Milliseconds left until the callback fires, `None` if not pending.
    pub fn time_to_expiry(&self, handle: TimerHandle) -> Option<u64> {
        if !self.is_pending(handle) {
            return None;
        }
        let now = self.shared.now_nanos();
        Some(handle.wake_nanos.saturating_sub(now) / NANOS_PER_MILLI)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the loop and drops every pending registration without firing it.
    pub fn shutdown(&self) {
        if self.shared.shutdown.trigger() {
            let dropped = {
                let mut entries = self.shared.entries.lock();
                std::mem::take(&mut *entries)
            };
            debug!(
                target: "blipmq_client::timer",
                timer = %self.shared.name,
                dropped = dropped.len(),
                "timer service shutting down"
            );
        }
    }

    /// Waits for the scheduling loop to exit after [`shutdown`](Self::shutdown).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn is_pending(&self, handle: TimerHandle) -> bool {
        matches!(
            self.shared.entries.lock().get(&handle.wake_nanos),
            Some(reg) if reg.seq == handle.seq
        )
    }

    fn schedule(&self, delay_ms: u64, registration: Registration) -> TimerHandle {
        let seq = registration.seq;
        let mut key = self
            .shared
            .now_nanos()
            .saturating_add(delay_ms.saturating_mul(NANOS_PER_MILLI));
        let earliest = {
            let mut entries = self.shared.entries.lock();
            while entries.contains_key(&key) {
                key += 1;
            }
            let earliest = entries.keys().next().map_or(true, |first| key < *first);
            entries.insert(key, registration);
            earliest
        };
        if earliest {
            self.shared.wake.notify_one();
        }
        trace!(target: "blipmq_client::timer", delay_ms, key, "timer registered");
        TimerHandle {
            wake_nanos: key,
            seq,
        }
    }
}

impl fmt::Debug for TimerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerService")
            .field("name", &self.shared.name)
            .field("pending", &self.len())
            .finish()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shared.shutdown.trigger();
    }
}

async fn run(shared: Arc<TimerShared>) {
    loop {
        if shared.shutdown.is_shutting_down() {
            break;
        }

        let now = shared.now_nanos();
        let (due, next) = {
            let mut entries = shared.entries.lock();
            let pending = entries.split_off(&now.saturating_add(1));
            let due = std::mem::replace(&mut *entries, pending);
            (due, entries.keys().next().copied())
        };

        for (key, registration) in due {
            fire(&shared.name, key, registration);
        }

        let deadline = next.map(|key| shared.origin + Duration::from_nanos(key));
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = shared.shutdown.wait() => break,
            _ = sleep_until(deadline) => {}
        }
    }
    debug!(target: "blipmq_client::timer", timer = %shared.name, "timer loop stopped");
}

fn fire(timer: &str, key: u64, registration: Registration) {
    let Registration {
        callback,
        user_data,
        ..
    } = registration;
    if panic::catch_unwind(AssertUnwindSafe(move || callback(user_data))).is_err() {
        error!(
            target: "blipmq_client::timer",
            timer, key, "timer callback panicked, continuing"
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(Option<UserData>) + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        (hits, move |_| {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn zero_delay_is_rejected() {
        let timer = TimerService::new("test");
        let err = timer.register(0, |_| {}, None).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_not_before_delay() {
        let timer = TimerService::new("test");
        let (hits, cb) = counter();
        let handle = timer.register(100, cb, None).unwrap();

        time::sleep(Duration::from_millis(99)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timer.is_expired(handle));

        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timer.is_expired(handle));
        assert_eq!(timer.time_to_expiry(handle), None);
    }

    #[tokio::test(start_paused = true)]
    async fn colliding_registrations_fire_once_each() {
        let timer = TimerService::new("test");
        let (hits_a, cb_a) = counter();
        let (hits_b, cb_b) = counter();
        let a = timer.register(50, cb_a, None).unwrap();
        let b = timer.register(50, cb_b, None).unwrap();
        assert_ne!(a, b);

        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits_a.load(Ordering::SeqCst), 1);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let timer = TimerService::new("test");
        let (hits, cb) = counter();
        let handle = timer.register(20, cb, None).unwrap();
        assert!(timer.cancel(handle));
        assert!(!timer.cancel(handle));

        time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_moves_wake_time() {
        let timer = TimerService::new("test");
        let (hits, cb) = counter();
        let handle = timer.register(20, cb, None).unwrap();

        time::sleep(Duration::from_millis(10)).await;
        let moved = timer.refresh(handle, 50).unwrap().expect("still pending");
        assert!(timer.is_expired(handle));
        assert_eq!(timer.time_to_expiry(moved), Some(50));

        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(25)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(timer.refresh(moved, 10).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_registration_wakes_loop() {
        let timer = TimerService::new("test");
        let (late, late_cb) = counter();
        let (early, early_cb) = counter();
        timer.register(1_000, late_cb, None).unwrap();
        tokio::task::yield_now().await;
        timer.register(10, early_cb, None).unwrap();

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_stop_loop() {
        let timer = TimerService::new("test");
        let (hits, cb) = counter();
        timer.register(5, |_| panic!("boom"), None).unwrap();
        timer.register(10, cb, None).unwrap();

        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_data_is_passed_back() {
        let timer = TimerService::new("test");
        let (tx, rx) = flume::bounded::<u32>(1);
        let data: UserData = Arc::new(42u32);
        timer
            .register(
                5,
                move |data| {
                    let value = data
                        .and_then(|d| d.downcast_ref::<u32>().copied())
                        .unwrap_or(0);
                    let _ = tx.send(value);
                },
                Some(data),
            )
            .unwrap();
        assert_eq!(rx.recv_async().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn register_after_shutdown_fails() {
        let timer = TimerService::new("test");
        timer.register(1_000, |_| {}, None).unwrap();
        timer.shutdown();
        timer.join().await;
        assert!(timer.is_empty());
        assert!(matches!(
            timer.register(10, |_| {}, None),
            Err(ClientError::Shutdown)
        ));
    }
}
