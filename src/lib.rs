//! BlipMQ client – a failsafe publish/subscribe client runtime.
//!
//! This crate exports
//!  * `client`  – the `FailsafeClient` facade and a registry of named clients
//!  * `core`    – timer service, client queue, connection state machine, dispatcher
//!  * `config`  – TOML-driven client configuration with env overrides
//!
//! While the broker is unreachable, requests are queued locally and replayed
//! in priority order once the connection is back.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use client::{ClientBuilder, ConnectionRegistry, FailsafeClient};
pub use config::{load_config, ClientConfig};
pub use core::connection::{ConnectionContext, ConnectionListener, ConnectionState};
pub use core::error::{ClientError, ClientResult, TransportError};
pub use core::message::{
    ConnectQos, ConnectReturnQos, DisconnectQos, MessageUnit, MethodName, RequestState,
    ReturnQos,
};
pub use core::qos::{Destination, MsgQos, Priority};
pub use core::transport::{LoopbackTransport, Transport};
