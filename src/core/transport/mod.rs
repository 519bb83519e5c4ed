//! Seam between the failsafe runtime and the wire protocol.

pub mod loopback;

pub use loopback::LoopbackTransport;

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::core::error::TransportError;
use crate::core::message::{ConnectQos, ConnectReturnQos, DisconnectQos, MessageUnit, ReturnQos};
use crate::core::qos::MsgQos;
use crate::core::queue::QueueEntry;

/// Connection to one broker address.
///
/// Implementations report an unreachable broker as
/// [`TransportError::Communication`]; the runtime then switches to polling.
pub trait Transport: Send + Sync + Debug {
    fn connect<'a>(
        &'a self,
        qos: &'a ConnectQos,
    ) -> BoxFuture<'a, Result<ConnectReturnQos, TransportError>>;

    fn disconnect<'a>(&'a self, qos: &'a DisconnectQos) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Sends a batch in one call. All or nothing: on error none of the
    /// entries count as delivered. Oneway calls return an empty vector.
    fn send<'a>(
        &'a self,
        batch: &'a [QueueEntry],
        oneway: bool,
    ) -> BoxFuture<'a, Result<Vec<ReturnQos>, TransportError>>;

    fn get<'a>(
        &'a self,
        key: &'a str,
        qos: &'a MsgQos,
    ) -> BoxFuture<'a, Result<Vec<MessageUnit>, TransportError>>;

    fn ping(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Releases the underlying connection. Must not fail.
    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Awaits a transport call, mapping an elapsed `limit` to `TransportError::Timeout`.
pub(crate) async fn within<T, F>(limit: Duration, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit.as_millis() as u64)),
    }
}
