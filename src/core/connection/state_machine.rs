//! Failsafe connection state machine.
//!
//! ```text
//!            ping fails / call fails
//!   ALIVE ───────────────────────────▶ POLLING ──── `retries` failed ───▶ DEAD
//!     ▲                                   │          reconnects
//!     └────── one reconnect succeeds ─────┘
//! ```
//!
//! Timer callbacks only post `Tick` events; a single driver task runs the
//! pings and reconnect attempts and delivers listener notifications in order.
//! Each transition bumps an attempt counter, results of a ping started under an
//! older attempt are dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::AddressConfig;
use crate::core::connection::{ConnectionContext, ConnectionListener, ConnectionState};
use crate::core::dispatch::DispatchEvent;
use crate::core::dlq::{DeadLetterReason, DeadLetterSink};
use crate::core::error::TransportError;
use crate::core::message::{ConnectQos, ConnectReturnQos};
use crate::core::queue::{ClientQueue, FailurePolicy};
use crate::core::shutdown::ShutdownSignal;
use crate::core::timer::{TimerHandle, TimerService};
use crate::core::transport::{self, Transport};
use crate::metrics::ClientMetrics;

pub(crate) enum MachineEvent {
    Tick {
        attempt: u64,
    },
    Transition {
        old: ConnectionState,
        new: ConnectionState,
        automatic: bool,
    },
}

/// Collaborators of a [`ConnectionStateMachine`].
pub struct MachineSetup {
    pub address: AddressConfig,
    pub on_failure: FailurePolicy,
    pub transport: Arc<dyn Transport>,
    pub timer: Arc<TimerService>,
    pub queue: Arc<ClientQueue>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub listener: Option<Arc<dyn ConnectionListener>>,
    pub metrics: Arc<ClientMetrics>,
    /// Receives a `StateChanged` after each transition was handled.
    pub dispatch: flume::Sender<DispatchEvent>,
}

struct MachineInner {
    state: ConnectionState,
    current_retry: i64,
    timer: Option<TimerHandle>,
    attempt: u64,
}

pub struct ConnectionStateMachine {
    address: AddressConfig,
    on_failure: FailurePolicy,
    inner: Mutex<MachineInner>,
    connect_qos: Mutex<Option<ConnectQos>>,
    session: Mutex<Option<ConnectReturnQos>>,
    transport: Arc<dyn Transport>,
    timer: Arc<TimerService>,
    queue: Arc<ClientQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    listener: Option<Arc<dyn ConnectionListener>>,
    metrics: Arc<ClientMetrics>,
    events: flume::Sender<MachineEvent>,
    dispatch: flume::Sender<DispatchEvent>,
    shutdown: ShutdownSignal,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionStateMachine {
    /// Creates the machine in ALIVE and starts its driver task.
    pub fn spawn(setup: MachineSetup) -> Arc<Self> {
        let (events, rx) = flume::unbounded();
        let machine = Arc::new(Self {
            address: setup.address,
            on_failure: setup.on_failure,
            inner: Mutex::new(MachineInner {
                state: ConnectionState::Alive,
                current_retry: 0,
                timer: None,
                attempt: 0,
            }),
            connect_qos: Mutex::new(None),
            session: Mutex::new(None),
            transport: setup.transport,
            timer: setup.timer,
            queue: setup.queue,
            dead_letters: setup.dead_letters,
            listener: setup.listener,
            metrics: setup.metrics,
            events,
            dispatch: setup.dispatch,
            shutdown: ShutdownSignal::new(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&machine).drive(rx));
        *machine.task.lock() = Some(task);
        machine
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_failsafe(&self) -> bool {
        self.address.is_failsafe()
    }

    /// Failed reconnect attempts since POLLING was entered.
    pub fn current_retry(&self) -> i64 {
        self.inner.lock().current_retry
    }

    pub fn address(&self) -> &AddressConfig {
        &self.address
    }

    /// Login data replayed on reconnect attempts.
    pub fn set_connect_qos(&self, qos: ConnectQos) {
        *self.connect_qos.lock() = Some(qos);
    }

    /// Broker assigned session name of the last successful connect.
    pub fn session_name(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.session_name.clone())
    }

    /// A connect succeeded: go ALIVE and restart pinging.
    pub fn connected(&self, ret: ConnectReturnQos) {
        self.remember_session(ret);
        self.to_alive();
    }

    /// A request to the broker failed. Only communication failures observed
    /// while ALIVE change the state.
    pub fn report_failure(&self, err: &TransportError) -> ConnectionState {
        if !err.is_retryable() {
            return self.state();
        }
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Alive {
            return inner.state;
        }
        let old = inner.state;
        let new = self.enter_polling_or_dead(&mut inner);
        warn!(
            target: "blipmq_client::connection",
            error = %err,
            "lost connection to broker"
        );
        self.notify(&inner, old, true);
        new
    }

    /// An explicit connect failed. Starts polling in failsafe mode, otherwise
    /// the connection is DEAD.
    pub fn connect_failed(&self, err: &TransportError) -> ConnectionState {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Polling || !err.is_retryable() {
            return inner.state;
        }
        let old = inner.state;
        let new = self.enter_polling_or_dead(&mut inner);
        warn!(
            target: "blipmq_client::connection",
            error = %err,
            "connect failed"
        );
        if old != new {
            self.notify(&inner, old, true);
        }
        new
    }

    /// Stops pinging and moves to DEAD without applying the failure policy.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        let old = inner.state;
        if old == ConnectionState::Dead {
            return;
        }
        inner.state = ConnectionState::Dead;
        inner.attempt += 1;
        self.rearm(&mut inner, None);
        self.notify(&inner, old, false);
    }

    /// Cancels pending timers and stops the driver task.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.attempt += 1;
            self.rearm(&mut inner, None);
        }
        self.shutdown.trigger();
    }

    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn remember_session(&self, ret: ConnectReturnQos) {
        if ret.session_name.is_some() {
            if let Some(qos) = self.connect_qos.lock().as_mut() {
                qos.session_name = ret.session_name.clone();
            }
        }
        *self.session.lock() = Some(ret);
    }

    fn to_alive(&self) {
        let mut inner = self.inner.lock();
        let old = inner.state;
        inner.state = ConnectionState::Alive;
        inner.current_retry = 0;
        inner.attempt += 1;
        self.rearm(&mut inner, self.address.ping_interval());
        if old != ConnectionState::Alive {
            self.notify(&inner, old, false);
        }
    }

    fn enter_polling_or_dead(&self, inner: &mut MachineInner) -> ConnectionState {
        inner.attempt += 1;
        if self.address.is_failsafe() {
            inner.state = ConnectionState::Polling;
            inner.current_retry = 0;
            let first = Duration::from_millis(self.address.initial_ping_delay_ms);
            self.rearm(inner, Some(first));
        } else {
            inner.state = ConnectionState::Dead;
            self.rearm(inner, None);
        }
        inner.state
    }

    /// Replaces the pending tick, if any, with one `delay` from now.
    fn rearm(&self, inner: &mut MachineInner, delay: Option<Duration>) {
        if let Some(handle) = inner.timer.take() {
            self.timer.cancel(handle);
        }
        let Some(delay) = delay else {
            return;
        };
        let attempt = inner.attempt;
        let events = self.events.clone();
        let delay_ms = (delay.as_millis() as u64).max(1);
        match self.timer.register(
            delay_ms,
            move |_| {
                let _ = events.send(MachineEvent::Tick { attempt });
            },
            None,
        ) {
            Ok(handle) => inner.timer = Some(handle),
            Err(err) => debug!(target: "blipmq_client::connection", error = %err, "tick not scheduled"),
        }
    }

    /// Queues the transition to `inner.state`. Called with the state lock
    /// held so the driver sees transitions in the order they happened.
    fn notify(&self, inner: &MachineInner, old: ConnectionState, automatic: bool) {
        let new = inner.state;
        info!(
            target: "blipmq_client::connection",
            %old,
            %new,
            "connection state changed"
        );
        let _ = self.events.send(MachineEvent::Transition {
            old,
            new,
            automatic,
        });
    }

    async fn drive(self: Arc<Self>, rx: flume::Receiver<MachineEvent>) {
        loop {
            let event = tokio::select! {
                event = rx.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = self.shutdown.wait() => break,
            };
            match event {
                MachineEvent::Tick { attempt } => self.on_tick(attempt).await,
                MachineEvent::Transition { old, new, automatic } => {
                    self.on_transition(old, new, automatic)
                }
            }
        }
        debug!(target: "blipmq_client::connection", "connection driver stopped");
    }

    async fn on_tick(&self, attempt: u64) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt {
                trace!(target: "blipmq_client::connection", attempt, "stale tick ignored");
                return;
            }
            inner.timer = None;
            inner.state
        };

        match state {
            ConnectionState::Alive => {
                let result = transport::within(self.address.response_timeout(), self.transport.ping()).await;
                self.after_ping(attempt, result);
            }
            ConnectionState::Polling => {
                let result = self.reconnect_once().await;
                self.after_reconnect(attempt, result);
            }
            ConnectionState::Dead => {}
        }
    }

    fn after_ping(&self, attempt: u64, result: Result<(), TransportError>) {
        let mut inner = self.inner.lock();
        if inner.attempt != attempt {
            trace!(target: "blipmq_client::connection", attempt, "stale ping result ignored");
            return;
        }
        match result {
            Ok(()) => self.rearm(&mut inner, self.address.ping_interval()),
            Err(err) => {
                self.enter_polling_or_dead(&mut inner);
                self.metrics.inc_ping_failures();
                warn!(target: "blipmq_client::connection", error = %err, "ping failed");
                self.notify(&inner, ConnectionState::Alive, true);
            }
        }
    }

    async fn reconnect_once(&self) -> Result<Option<ConnectReturnQos>, TransportError> {
        let timeout = self.address.response_timeout();
        let qos = self.connect_qos.lock().clone();
        match qos {
            Some(qos) => transport::within(timeout, self.transport.connect(&qos))
                .await
                .map(Some),
            None => transport::within(timeout, self.transport.ping())
                .await
                .map(|_| None),
        }
    }

    fn after_reconnect(&self, attempt: u64, result: Result<Option<ConnectReturnQos>, TransportError>) {
        let mut inner = self.inner.lock();
        if inner.attempt != attempt {
            trace!(target: "blipmq_client::connection", attempt, "stale reconnect result ignored");
            return;
        }
        match result {
            Ok(ret) => {
                drop(inner);
                if let Some(ret) = ret {
                    self.remember_session(ret);
                }
                self.to_alive();
            }
            Err(err) => {
                inner.current_retry += 1;
                let retries = self.address.retries;
                if retries >= 0 && inner.current_retry >= retries {
                    inner.state = ConnectionState::Dead;
                    inner.attempt += 1;
                    self.rearm(&mut inner, None);
                    warn!(
                        target: "blipmq_client::connection",
                        error = %err,
                        failed = inner.current_retry,
                        "giving up on broker"
                    );
                    self.notify(&inner, ConnectionState::Polling, true);
                } else {
                    debug!(
                        target: "blipmq_client::connection",
                        error = %err,
                        retry = inner.current_retry,
                        retries,
                        "reconnect attempt failed"
                    );
                    self.rearm(&mut inner, Some(self.address.retry_delay()));
                }
            }
        }
    }

    fn on_transition(&self, old: ConnectionState, new: ConnectionState, automatic: bool) {
        let ctx = ConnectionContext::new(new, &self.queue);
        let flush = match new {
            ConnectionState::Alive => {
                if old == ConnectionState::Polling {
                    self.metrics.inc_reconnects();
                }
                self.listener
                    .as_ref()
                    .map_or(true, |l| l.reached_alive(old, &ctx))
            }
            ConnectionState::Polling => {
                if let Some(l) = &self.listener {
                    l.reached_polling(old, &ctx);
                }
                false
            }
            ConnectionState::Dead => {
                self.metrics.inc_reached_dead();
                if let Some(l) = &self.listener {
                    l.reached_dead(old, &ctx);
                }
                if automatic && self.state() == ConnectionState::Dead {
                    self.apply_failure_policy();
                }
                false
            }
        };
        let _ = self.dispatch.send(DispatchEvent::StateChanged { state: new, flush });
    }

    fn apply_failure_policy(&self) {
        match self.on_failure {
            FailurePolicy::Keep => {}
            FailurePolicy::Discard => {
                let dropped = self.queue.clear();
                if dropped > 0 {
                    warn!(target: "blipmq_client::connection", dropped, "connection dead, discarded queued entries");
                }
            }
            FailurePolicy::DeadMessage => {
                let entries = self.queue.take_all();
                self.metrics.inc_dead_lettered(entries.len() as u64);
                for entry in entries {
                    self.dead_letters
                        .dead_letter(entry, DeadLetterReason::Exhausted);
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionStateMachine")
            .field("state", &inner.state)
            .field("current_retry", &inner.current_retry)
            .field("attempt", &inner.attempt)
            .finish()
    }
}
