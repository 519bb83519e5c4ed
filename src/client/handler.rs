//! Failsafe client facade.
//!
//! Routes every request according to the connection state:
//!
//! | state   | publish / subscribe / unsubscribe / erase       | get     |
//! |---------|--------------------------------------------------|---------|
//! | ALIVE   | direct call, or queued behind an existing backlog | direct  |
//! | POLLING | queued, answered with `RequestState::Queued`      | error   |
//! | DEAD    | `ClientError::Dead`                               | error   |

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::core::connection::{
    ConnectionListener, ConnectionState, ConnectionStateMachine, MachineSetup,
};
use crate::core::dispatch::{DispatchEvent, Dispatcher, DispatcherSetup};
use crate::core::dlq::{DeadLetterQueue, DeadLetterSink};
use crate::core::error::{ClientError, ClientResult};
use crate::core::message::{
    ConnectQos, ConnectReturnQos, DisconnectQos, MessageUnit, MethodName, RequestState,
    ReturnQos,
};
use crate::core::qos::MsgQos;
use crate::core::queue::{ClientQueue, EntryStore, PutOutcome, QueueEntry};
use crate::core::shutdown::ShutdownSignal;
use crate::core::timer::TimerService;
use crate::core::transport::{self, Transport};
use crate::metrics::ClientMetrics;

/// Assembles a [`FailsafeClient`] and starts its background tasks.
pub struct ClientBuilder {
    name: String,
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    listener: Option<Arc<dyn ConnectionListener>>,
    store: Option<Box<dyn EntryStore>>,
}

impl ClientBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ClientConfig::default(),
            transport: None,
            listener: None,
            store: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Storage for queue types other than `RAM`.
    pub fn store(mut self, store: Box<dyn EntryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> ClientResult<FailsafeClient> {
        let ClientBuilder {
            name,
            config,
            transport,
            listener,
            store,
        } = self;
        let mut config = config;
        config.normalize();
        config.validate()?;
        let transport = transport
            .ok_or_else(|| ClientError::InvalidArgument("a transport is required".into()))?;

        let metrics = Arc::new(ClientMetrics::new());
        let dead_letters = Arc::new(DeadLetterQueue::new(config.dead_letter.capacity));
        let sink: Arc<dyn DeadLetterSink> = dead_letters.clone();
        let queue = Arc::new(match store {
            Some(store) => {
                ClientQueue::with_store(config.queue.clone(), store, sink.clone(), metrics.clone())
            }
            None => ClientQueue::new(config.queue.clone(), sink.clone(), metrics.clone())?,
        });
        let timer = Arc::new(TimerService::new(format!("{name}-timer")));

        let (events, rx) = Dispatcher::channel();
        let machine = ConnectionStateMachine::spawn(MachineSetup {
            address: config.address.clone(),
            on_failure: config.queue.on_failure,
            transport: transport.clone(),
            timer: timer.clone(),
            queue: queue.clone(),
            dead_letters: sink.clone(),
            listener,
            metrics: metrics.clone(),
            dispatch: events.clone(),
        });

        let wake = events.clone();
        queue.set_put_listener(move || {
            let _ = wake.send(DispatchEvent::EntryQueued);
        });

        let dispatcher = Dispatcher::spawn(
            DispatcherSetup {
                address: config.address.clone(),
                queue: queue.clone(),
                machine: machine.clone(),
                transport: transport.clone(),
                timer: timer.clone(),
                dead_letters: sink,
                metrics: metrics.clone(),
            },
            events,
            rx,
        );

        info!(
            target: "blipmq_client::client",
            client = %name,
            failsafe = config.address.is_failsafe(),
            "client created"
        );

        Ok(FailsafeClient {
            instance_id: Uuid::new_v4().to_string(),
            subscriptions: AtomicU64::new(0),
            name,
            config,
            transport,
            timer,
            queue,
            machine,
            dispatcher,
            dead_letters,
            metrics,
            closed: ShutdownSignal::new(),
        })
    }
}

/// Client API that keeps working while the broker is unreachable.
pub struct FailsafeClient {
    name: String,
    instance_id: String,
    subscriptions: AtomicU64,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    timer: Arc<TimerService>,
    queue: Arc<ClientQueue>,
    machine: Arc<ConnectionStateMachine>,
    dispatcher: Dispatcher,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<ClientMetrics>,
    closed: ShutdownSignal,
}

impl FailsafeClient {
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_failsafe(&self) -> bool {
        self.machine.is_failsafe()
    }

    pub fn queue(&self) -> &ClientQueue {
        &self.queue
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Session name assigned by the broker on the last successful connect.
    pub fn session_name(&self) -> Option<String> {
        self.machine.session_name()
    }

    /// Logs in. In failsafe mode an unreachable broker is not an error: the
    /// client starts polling and the returned QoS is marked `Queued`.
    pub async fn connect(&self, qos: ConnectQos) -> ClientResult<ConnectReturnQos> {
        self.ensure_open()?;
        self.machine.set_connect_qos(qos.clone());
        let result = transport::within(
            self.config.address.response_timeout(),
            self.transport.connect(&qos),
        )
        .await;

        match result {
            Ok(ret) => {
                info!(
                    target: "blipmq_client::client",
                    client = %self.name,
                    session = ret.session_name.as_deref().unwrap_or("-"),
                    "connected"
                );
                self.machine.connected(ret.clone());
                Ok(ret)
            }
            Err(err) if err.is_retryable() => {
                if self.machine.connect_failed(&err) == ConnectionState::Polling {
                    Ok(ConnectReturnQos::queued())
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Logs out and moves to DEAD. Calling it again is a no-op.
    pub async fn disconnect(&self, qos: DisconnectQos) -> ClientResult<()> {
        if qos.clear_client_queue {
            let cleared = self.queue.clear();
            debug!(target: "blipmq_client::client", cleared, "client queue cleared on disconnect");
        }
        let result = if self.state() == ConnectionState::Alive {
            transport::within(
                self.config.address.response_timeout(),
                self.transport.disconnect(&qos),
            )
            .await
        } else {
            Ok(())
        };
        self.machine.disconnect();
        result.map_err(Into::into)
    }

    pub async fn publish(&self, unit: MessageUnit) -> ClientResult<ReturnQos> {
        self.submit(MethodName::Publish, unit, false).await
    }

    /// Publishes several messages, stopping at the first error.
    pub async fn publish_arr(&self, units: Vec<MessageUnit>) -> ClientResult<Vec<ReturnQos>> {
        let mut rets = Vec::with_capacity(units.len());
        for unit in units {
            rets.push(self.publish(unit).await?);
        }
        Ok(rets)
    }

    /// Publishes without waiting for a broker acknowledgement.
    pub async fn publish_oneway(&self, units: Vec<MessageUnit>) -> ClientResult<()> {
        for unit in units {
            self.submit(MethodName::Publish, unit, true).await?;
        }
        Ok(())
    }

    /// Every subscribe carries its own id in the QoS, so a queued one is
    /// answered now and replayed later under the same id.
    pub async fn subscribe(&self, key: impl Into<String>, mut qos: MsgQos) -> ClientResult<ReturnQos> {
        if qos.subscription_id.is_none() {
            qos.subscription_id = Some(format!(
                "__subId:{}-{}-{}",
                self.name,
                self.instance_id,
                self.subscriptions.fetch_add(1, Ordering::Relaxed)
            ));
        }
        self.submit(MethodName::Subscribe, MessageUnit::control(key, qos), false)
            .await
    }

    pub async fn unsubscribe(&self, key: impl Into<String>, qos: MsgQos) -> ClientResult<ReturnQos> {
        self.submit(MethodName::Unsubscribe, MessageUnit::control(key, qos), false)
            .await
    }

    pub async fn erase(&self, key: impl Into<String>, qos: MsgQos) -> ClientResult<ReturnQos> {
        self.submit(MethodName::Erase, MessageUnit::control(key, qos), false)
            .await
    }

    /// Synchronous read, only possible while ALIVE.
    pub async fn get(&self, key: &str, qos: MsgQos) -> ClientResult<Vec<MessageUnit>> {
        self.ensure_open()?;
        match self.state() {
            ConnectionState::Dead => return Err(ClientError::Dead),
            ConnectionState::Polling => {
                return Err(ClientError::NotConnected(ConnectionState::Polling))
            }
            ConnectionState::Alive => {}
        }
        let result = transport::within(
            self.config.address.response_timeout(),
            self.transport.get(key, &qos),
        )
        .await;
        result.map_err(|err| {
            self.machine.report_failure(&err);
            err.into()
        })
    }

    pub async fn ping(&self) -> ClientResult<()> {
        self.ensure_open()?;
        if self.state() == ConnectionState::Dead {
            return Err(ClientError::Dead);
        }
        let result =
            transport::within(self.config.address.response_timeout(), self.transport.ping()).await;
        result.map_err(|err| {
            self.machine.report_failure(&err);
            err.into()
        })
    }

    /// Sends the queued backlog now, also when a listener held it back.
    pub fn flush_queue(&self) {
        self.dispatcher.flush();
    }

    /// Stops all background tasks and fails blocked puts with `Shutdown`.
    /// Entries still queued are kept.
    pub async fn shutdown(&self) {
        if !self.closed.trigger() {
            return;
        }
        self.stop_tasks();
        self.dispatcher.join().await;
        self.machine.join().await;
        self.timer.join().await;
        self.transport.shutdown().await;
        info!(
            target: "blipmq_client::client",
            client = %self.name,
            queued = self.queue.len(),
            "client shut down"
        );
    }

    fn stop_tasks(&self) {
        self.dispatcher.shutdown();
        self.machine.shutdown();
        self.queue.close();
        self.timer.shutdown();
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.is_shutting_down() {
            return Err(ClientError::Shutdown);
        }
        Ok(())
    }

    async fn submit(
        &self,
        method: MethodName,
        unit: MessageUnit,
        oneway: bool,
    ) -> ClientResult<ReturnQos> {
        self.ensure_open()?;
        let entry = QueueEntry::new(method, unit).oneway(oneway);

        match self.state() {
            ConnectionState::Dead => Err(ClientError::Dead),
            ConnectionState::Polling => self.enqueue(entry, false).await,
            ConnectionState::Alive => {
                let bursting = self.config.address.burst_mode.collect_time().is_some();
                if self.dispatcher.is_held() || (!bursting && self.queue.is_empty()) {
                    self.send_direct(entry).await
                } else {
                    // keep order behind the backlog
                    self.enqueue(entry, true).await
                }
            }
        }
    }

    async fn send_direct(&self, mut entry: QueueEntry) -> ClientResult<ReturnQos> {
        if entry.qos().sender.is_none() {
            entry.unit_mut().qos.sender = self.machine.session_name();
        }
        let oneway = entry.is_oneway() || self.config.address.oneway;
        let result = transport::within(
            self.config.address.response_timeout(),
            self.transport.send(std::slice::from_ref(&entry), oneway),
        )
        .await;

        match result {
            Ok(mut rets) => {
                self.metrics.inc_direct_sends(1);
                Ok(rets.pop().unwrap_or_else(|| ReturnQos::ok(entry.key())))
            }
            Err(err) if err.is_retryable() && self.machine.is_failsafe() => {
                self.machine.report_failure(&err);
                self.enqueue(entry, false).await
            }
            Err(err) => {
                self.machine.report_failure(&err);
                Err(err.into())
            }
        }
    }

    async fn enqueue(&self, entry: QueueEntry, alive: bool) -> ClientResult<ReturnQos> {
        if !alive && entry.method() == MethodName::Publish && !entry.qos().allows_queuing() {
            return Err(ClientError::NotConnected(self.state()));
        }
        let method = entry.method();
        let key = entry.key().to_string();
        let subscription_id = entry.qos().subscription_id.clone();
        let outcome = self.queue.put(entry).await?;

        let mut ret = match outcome {
            PutOutcome::Queued { .. } => ReturnQos::with_state(key, RequestState::Queued),
            PutOutcome::Discarded => ReturnQos::with_state(key, RequestState::Discarded),
            PutOutcome::DeadLettered => ReturnQos::with_state(key, RequestState::DeadLettered),
        };
        if method == MethodName::Subscribe && ret.is_queued() {
            ret.subscription_id = subscription_id;
        }
        debug!(
            target: "blipmq_client::client",
            %method,
            key = %ret.key,
            state = ?ret.state,
            "request queued"
        );
        Ok(ret)
    }
}

impl fmt::Debug for FailsafeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailsafeClient")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("queue", &self.queue.size())
            .finish()
    }
}

impl Drop for FailsafeClient {
    fn drop(&mut self) {
        if self.closed.trigger() {
            self.stop_tasks();
        }
    }
}
