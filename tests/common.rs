#![allow(dead_code)]

use std::sync::{Arc, Once};

use parking_lot::Mutex;

use blipmq_client::config::ClientConfig;
use blipmq_client::{
    ConnectionContext, ConnectionListener, ConnectionState, FailsafeClient, LoopbackTransport,
    MessageUnit, MsgQos, Priority,
};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = blipmq_client::logging::try_init_logging();
    });
}

/// Failsafe settings with short intervals so paused-time tests stay small.
pub fn failsafe_config(retries: i64, delay_ms: i64) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.address.retries = retries;
    cfg.address.delay_ms = delay_ms;
    cfg.address.ping_interval_ms = 1_000;
    cfg.address.initial_ping_delay_ms = 50;
    cfg.address.response_timeout_ms = 500;
    cfg
}

pub fn client_with(
    cfg: ClientConfig,
    listener: Option<Arc<RecordingListener>>,
) -> (FailsafeClient, Arc<LoopbackTransport>) {
    init_logging();
    let broker = Arc::new(LoopbackTransport::new());
    let mut builder = FailsafeClient::builder("test-client")
        .config(cfg)
        .transport(broker.clone());
    if let Some(listener) = listener {
        builder = builder.listener(listener);
    }
    let client = builder.build().expect("client builds");
    (client, broker)
}

pub fn msg(key: &str, priority: Priority) -> MessageUnit {
    MessageUnit::new(key, format!("payload-{key}"), MsgQos::new().with_priority(priority))
}

/// Records every transition and answers `reached_alive` with `flush`.
#[derive(Default)]
pub struct RecordingListener {
    pub transitions: Mutex<Vec<(ConnectionState, ConnectionState)>>,
    pub hold_backlog: bool,
}

impl RecordingListener {
    pub fn holding() -> Self {
        Self {
            transitions: Mutex::new(Vec::new()),
            hold_backlog: true,
        }
    }

    pub fn seen(&self) -> Vec<(ConnectionState, ConnectionState)> {
        self.transitions.lock().clone()
    }
}

impl ConnectionListener for RecordingListener {
    fn reached_alive(&self, old: ConnectionState, _ctx: &ConnectionContext<'_>) -> bool {
        self.transitions.lock().push((old, ConnectionState::Alive));
        !self.hold_backlog
    }

    fn reached_polling(&self, old: ConnectionState, _ctx: &ConnectionContext<'_>) {
        self.transitions.lock().push((old, ConnectionState::Polling));
    }

    fn reached_dead(&self, old: ConnectionState, _ctx: &ConnectionContext<'_>) {
        self.transitions.lock().push((old, ConnectionState::Dead));
    }
}
