use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

use crate::core::error::TransportError;
use crate::core::message::{
    ConnectQos, ConnectReturnQos, DisconnectQos, MessageUnit, MethodName, ReturnQos,
};
use crate::core::qos::MsgQos;
use crate::core::queue::QueueEntry;
use crate::core::transport::Transport;

/// In-process broker stand-in.
///
/// Accepts everything while available and records what it received. Taking
/// it down makes every call fail with a communication error.
#[derive(Debug)]
pub struct LoopbackTransport {
    available: AtomicBool,
    latency_ms: AtomicU64,
    delivered: Mutex<Vec<QueueEntry>>,
    batches: Mutex<Vec<usize>>,
    rejected_keys: Mutex<HashSet<String>>,
    sessions: AtomicU64,
    pings: AtomicU64,
    connects: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            delivered: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            rejected_keys: Mutex::new(HashSet::new()),
            sessions: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay applied to every call before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Batches containing `key` are refused as a broker side error.
    pub fn reject_key(&self, key: impl Into<String>) {
        self.rejected_keys.lock().insert(key.into());
    }

    pub fn delivered(&self) -> Vec<QueueEntry> {
        self.delivered.lock().clone()
    }

    pub fn delivered_keys(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|e| e.key().to_string())
            .collect()
    }

    /// Sizes of the batches received so far, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    pub fn ping_count(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    async fn answer(&self) -> Result<(), TransportError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(TransportError::Communication(
                "loopback broker is down".into(),
            ))
        }
    }
}

impl Transport for LoopbackTransport {
    fn connect<'a>(
        &'a self,
        qos: &'a ConnectQos,
    ) -> BoxFuture<'a, Result<ConnectReturnQos, TransportError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::Relaxed);
            self.answer().await?;
            let session = match &qos.session_name {
                Some(name) => name.clone(),
                None => {
                    let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    format!("client/{}/session/{id}", qos.login_name)
                }
            };
            Ok(ConnectReturnQos::connected(session))
        })
    }

    fn disconnect<'a>(&'a self, _qos: &'a DisconnectQos) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move { self.answer().await })
    }

    fn send<'a>(
        &'a self,
        batch: &'a [QueueEntry],
        oneway: bool,
    ) -> BoxFuture<'a, Result<Vec<ReturnQos>, TransportError>> {
        Box::pin(async move {
            self.answer().await?;
            {
                let rejected = self.rejected_keys.lock();
                if let Some(e) = batch.iter().find(|e| rejected.contains(e.key())) {
                    return Err(TransportError::Rejected(format!(
                        "key '{}' is not accepted",
                        e.key()
                    )));
                }
            }
            trace!(target: "blipmq_client::loopback", entries = batch.len(), oneway, "batch received");
            self.delivered.lock().extend(batch.iter().cloned());
            self.batches.lock().push(batch.len());
            if oneway {
                return Ok(Vec::new());
            }
            Ok(batch
                .iter()
                .map(|e| {
                    let mut ret = ReturnQos::ok(e.key());
                    if e.method() == MethodName::Subscribe {
                        ret.subscription_id = Some(
                            e.qos()
                                .subscription_id
                                .clone()
                                .unwrap_or_else(|| format!("__subId:{}", e.unique_id())),
                        );
                    }
                    ret
                })
                .collect())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
        _qos: &'a MsgQos,
    ) -> BoxFuture<'a, Result<Vec<MessageUnit>, TransportError>> {
        Box::pin(async move {
            self.answer().await?;
            let latest = self
                .delivered
                .lock()
                .iter()
                .rev()
                .find(|e| e.method() == MethodName::Publish && e.key() == key)
                .map(|e| e.unit().clone());
            Ok(latest.into_iter().collect())
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.pings.fetch_add(1, Ordering::Relaxed);
            self.answer().await
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(key: &str) -> QueueEntry {
        QueueEntry::new(MethodName::Publish, MessageUnit::new(key, "x", MsgQos::new()))
    }

    #[tokio::test]
    async fn records_batches_while_available() {
        let t = LoopbackTransport::new();
        let batch = vec![publish("a"), publish("b")];
        let rets = t.send(&batch, false).await.unwrap();
        assert_eq!(rets.len(), 2);
        assert_eq!(t.delivered_keys(), vec!["a", "b"]);
        assert_eq!(t.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn down_means_communication_error() {
        let t = LoopbackTransport::new();
        t.set_available(false);
        let err = t.ping().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(t.send(&[publish("a")], false).await.is_err());
        assert!(t.delivered().is_empty());
    }

    #[tokio::test]
    async fn rejected_key_fails_whole_batch() {
        let t = LoopbackTransport::new();
        t.reject_key("bad");
        let err = t
            .send(&[publish("ok"), publish("bad")], false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
        assert!(t.delivered().is_empty());
    }

    #[tokio::test]
    async fn get_returns_latest_publish() {
        let t = LoopbackTransport::new();
        let first = QueueEntry::new(MethodName::Publish, MessageUnit::new("k", "1", MsgQos::new()));
        let second = QueueEntry::new(MethodName::Publish, MessageUnit::new("k", "2", MsgQos::new()));
        t.send(&[first, second], true).await.unwrap();
        let units = t.get("k", &MsgQos::new()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0].content[..], b"2");
    }
}
