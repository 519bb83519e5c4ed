//! Drains the client queue into batched transport calls.
//!
//! The dispatcher is an event driven task. It wakes when an entry was queued,
//! when the connection changed state, when a burst-mode collect window closed
//! or when a flush was requested. While the connection is ALIVE it peeks up to
//! the burst limits, drops expired entries, optionally waits `collectTime` for
//! the batch to fill up and then sends it in one call. Entries leave the queue
//! only after the transport accepted the whole batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::AddressConfig;
use crate::core::connection::{ConnectionState, ConnectionStateMachine};
use crate::core::dlq::{DeadLetterReason, DeadLetterSink};
use crate::core::error::TransportError;
use crate::core::queue::{ClientQueue, QueueEntry};
use crate::core::timer::{TimerHandle, TimerService};
use crate::core::transport::{self, Transport};
use crate::metrics::ClientMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    EntryQueued,
    /// The connection finished a transition. `flush` is the listener's answer
    /// to `reached_alive` and always `false` for other states.
    StateChanged {
        state: ConnectionState,
        flush: bool,
    },
    CollectElapsed {
        token: u64,
    },
    /// Send whatever is queued now, ignoring collect windows and held backlogs.
    Flush,
    Shutdown,
}

pub struct DispatcherSetup {
    pub address: AddressConfig,
    pub queue: Arc<ClientQueue>,
    pub machine: Arc<ConnectionStateMachine>,
    pub transport: Arc<dyn Transport>,
    pub timer: Arc<TimerService>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub metrics: Arc<ClientMetrics>,
}

/// Handle to the dispatch task.
#[derive(Debug)]
pub struct Dispatcher {
    events: flume::Sender<DispatchEvent>,
    held: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Event channel shared by the dispatcher, the queue and the connection.
    pub fn channel() -> (flume::Sender<DispatchEvent>, flume::Receiver<DispatchEvent>) {
        flume::unbounded()
    }

    pub fn spawn(
        setup: DispatcherSetup,
        events: flume::Sender<DispatchEvent>,
        rx: flume::Receiver<DispatchEvent>,
    ) -> Self {
        let held = Arc::new(AtomicBool::new(false));
        let worker = DispatchWorker {
            address: setup.address,
            queue: setup.queue,
            machine: setup.machine,
            transport: setup.transport,
            timer: setup.timer,
            dead_letters: setup.dead_letters,
            metrics: setup.metrics,
            events: events.clone(),
            held: Arc::clone(&held),
            view: ConnectionState::Alive,
            collecting: None,
            next_token: 0,
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            events,
            held,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn wake(&self) {
        let _ = self.events.send(DispatchEvent::EntryQueued);
    }

    /// Releases a backlog held back by the listener and sends it right away.
    pub fn flush(&self) {
        let _ = self.events.send(DispatchEvent::Flush);
    }

    /// `true` while a reconnect listener asked to keep the backlog queued.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(DispatchEvent::Shutdown);
    }

    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct DispatchWorker {
    address: AddressConfig,
    queue: Arc<ClientQueue>,
    machine: Arc<ConnectionStateMachine>,
    transport: Arc<dyn Transport>,
    timer: Arc<TimerService>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<ClientMetrics>,
    events: flume::Sender<DispatchEvent>,
    held: Arc<AtomicBool>,
    // last state reported through StateChanged
    view: ConnectionState,
    collecting: Option<(u64, TimerHandle)>,
    next_token: u64,
}

impl DispatchWorker {
    async fn run(mut self, rx: flume::Receiver<DispatchEvent>) {
        while let Ok(event) = rx.recv_async().await {
            let force = match event {
                DispatchEvent::Shutdown => break,
                DispatchEvent::EntryQueued => false,
                DispatchEvent::Flush => {
                    self.held.store(false, Ordering::SeqCst);
                    true
                }
                DispatchEvent::StateChanged { state, flush } => {
                    self.view = state;
                    if state != ConnectionState::Alive {
                        self.cancel_collect();
                        continue;
                    }
                    self.held.store(!flush, Ordering::SeqCst);
                    if !flush {
                        debug!(target: "blipmq_client::dispatch", queued = self.queue.len(), "reconnected, backlog held");
                        continue;
                    }
                    debug!(target: "blipmq_client::dispatch", queued = self.queue.len(), "reconnected, flushing backlog");
                    false
                }
                DispatchEvent::CollectElapsed { token } => match self.collecting {
                    Some((current, _)) if current == token => {
                        self.collecting = None;
                        true
                    }
                    _ => continue,
                },
            };
            self.drain(force).await;
        }
        self.cancel_collect();
        debug!(target: "blipmq_client::dispatch", "dispatcher stopped");
    }

    fn may_send(&self) -> bool {
        self.view == ConnectionState::Alive
            && self.machine.state() == ConnectionState::Alive
            && !self.held.load(Ordering::SeqCst)
    }

    async fn drain(&mut self, mut force: bool) {
        let burst = self.address.burst_mode.clone();
        loop {
            if !self.may_send() {
                return;
            }

            let batch = self.queue.peek(burst.entry_limit(), burst.byte_limit());
            if batch.is_empty() {
                self.cancel_collect();
                return;
            }
            let truncated = batch.len() < self.queue.len();

            // forceDestroy entries are delivered even after their lifetime
            let now = Instant::now();
            let (expired, mut live): (Vec<QueueEntry>, Vec<QueueEntry>) = batch
                .into_iter()
                .partition(|e| e.qos().is_expired_at(now) && !e.qos().force_destroy);
            if !expired.is_empty() {
                self.drop_expired(expired);
            }
            if live.is_empty() {
                continue;
            }

            // oneway and acknowledged requests never share a call
            let first_oneway = live[0].is_oneway();
            let split = live.iter().position(|e| e.is_oneway() != first_oneway);
            if let Some(cut) = split {
                live.truncate(cut);
            }

            if let Some(collect) = burst.collect_time() {
                if !force && !truncated && split.is_none() {
                    if self.collecting.is_none() {
                        self.start_collect(collect);
                    }
                    return;
                }
            }
            self.cancel_collect();
            force = false;

            if !self.send_batch(live).await {
                return;
            }
        }
    }

    /// Returns `false` when the connection was lost.
    async fn send_batch(&mut self, batch: Vec<QueueEntry>) -> bool {
        let oneway = self.address.oneway || batch[0].is_oneway();
        let sender = self.machine.session_name();
        let size = batch.len();
        let bytes: u64 = batch.iter().map(|e| e.size_in_bytes()).sum();
        let outgoing: Vec<QueueEntry> = batch
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let mut entry = entry.clone();
                let qos = &mut entry.unit_mut().qos;
                qos.queue_index = index as i64;
                qos.queue_size = size as i64;
                if qos.sender.is_none() {
                    qos.sender = sender.clone();
                }
                entry
            })
            .collect();

        let result = transport::within(
            self.address.response_timeout(),
            self.transport.send(&outgoing, oneway),
        )
        .await;

        match result {
            Ok(_) => {
                self.queue.remove(&batch);
                self.metrics.inc_dispatched(size as u64, bytes);
                trace!(target: "blipmq_client::dispatch", entries = size, bytes, oneway, "batch delivered");
                true
            }
            Err(TransportError::Rejected(reason)) => {
                self.queue.remove(&batch);
                warn!(
                    target: "blipmq_client::dispatch",
                    entries = size,
                    %reason,
                    "broker rejected batch, moving it to dead letters"
                );
                self.metrics.inc_dead_lettered(size as u64);
                for entry in batch {
                    self.dead_letters
                        .dead_letter(entry, DeadLetterReason::Rejected);
                }
                true
            }
            Err(err) => {
                self.queue.mark_redelivered(&batch);
                warn!(
                    target: "blipmq_client::dispatch",
                    entries = size,
                    error = %err,
                    "batch send failed, entries stay queued"
                );
                self.machine.report_failure(&err);
                false
            }
        }
    }

    fn drop_expired(&self, expired: Vec<QueueEntry>) {
        self.queue.remove(&expired);
        self.metrics.inc_dropped_expired(expired.len() as u64);
        warn!(
            target: "blipmq_client::dispatch",
            entries = expired.len(),
            "dropping expired entries"
        );
        for entry in expired {
            self.dead_letters
                .dead_letter(entry, DeadLetterReason::Expired);
        }
    }

    fn start_collect(&mut self, window: Duration) {
        self.next_token += 1;
        let token = self.next_token;
        let events = self.events.clone();
        let delay_ms = (window.as_millis() as u64).max(1);
        match self.timer.register(
            delay_ms,
            move |_| {
                let _ = events.send(DispatchEvent::CollectElapsed { token });
            },
            None,
        ) {
            Ok(handle) => {
                trace!(target: "blipmq_client::dispatch", delay_ms, "collect window opened");
                self.collecting = Some((token, handle));
            }
            Err(err) => debug!(target: "blipmq_client::dispatch", error = %err, "collect window not opened"),
        }
    }

    fn cancel_collect(&mut self) {
        if let Some((_, handle)) = self.collecting.take() {
            self.timer.cancel(handle);
        }
    }
}
