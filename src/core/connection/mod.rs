//! Connection health tracking: ALIVE, POLLING and DEAD.

pub mod state_machine;

pub use state_machine::{ConnectionStateMachine, MachineSetup};

use std::fmt;

use crate::core::queue::ClientQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Broker reachable, requests go out directly or via the dispatcher.
    Alive,
    /// Broker lost, requests are queued while reconnect attempts run.
    Polling,
    /// Given up. Only an explicit connect leaves this state.
    Dead,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Alive => "ALIVE",
            ConnectionState::Polling => "POLLING",
            ConnectionState::Dead => "DEAD",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a listener may look at and act on while handling a transition.
pub struct ConnectionContext<'a> {
    state: ConnectionState,
    queue: &'a ClientQueue,
}

impl<'a> ConnectionContext<'a> {
    pub(crate) fn new(state: ConnectionState, queue: &'a ClientQueue) -> Self {
        Self { state, queue }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The client queue, e.g. to clear a stale backlog before it is flushed.
    pub fn queue(&self) -> &ClientQueue {
        self.queue
    }
}

/// Observer of connection transitions.
///
/// Calls are made one at a time from the connection's driver task, in the
/// order the transitions happened.
pub trait ConnectionListener: Send + Sync {
    /// Return `false` to keep queued entries from being sent automatically;
    /// they stay queued until `FailsafeClient::flush_queue` is called.
    fn reached_alive(&self, old: ConnectionState, ctx: &ConnectionContext<'_>) -> bool {
        let _ = (old, ctx);
        true
    }

    fn reached_polling(&self, old: ConnectionState, ctx: &ConnectionContext<'_>) {
        let _ = (old, ctx);
    }

    fn reached_dead(&self, old: ConnectionState, ctx: &ConnectionContext<'_>) {
        let _ = (old, ctx);
    }
}
