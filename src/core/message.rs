use std::fmt;

use bytes::Bytes;

use crate::core::qos::MsgQos;

/// Broker operation a queued request stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodName {
    Publish,
    Subscribe,
    Unsubscribe,
    Erase,
    Get,
    Connect,
}

impl MethodName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::Publish => "publish",
            MethodName::Subscribe => "subscribe",
            MethodName::Unsubscribe => "unsubscribe",
            MethodName::Erase => "erase",
            MethodName::Get => "get",
            MethodName::Connect => "connect",
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key, content and QoS of one request, the payload of a queue entry.
#[derive(Debug, Clone)]
pub struct MessageUnit {
    /// Topic oid for publish/erase, subscription key or id otherwise.
    pub key: String,
    pub content: Bytes,
    pub qos: MsgQos,
}

impl MessageUnit {
    pub fn new(key: impl Into<String>, content: impl Into<Bytes>, qos: MsgQos) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            qos,
        }
    }

    /// A unit without content, used for subscribe/unsubscribe/erase/get.
    pub fn control(key: impl Into<String>, qos: MsgQos) -> Self {
        Self::new(key, Bytes::new(), qos)
    }

    /// Bytes the unit accounts for against queue limits.
    #[inline]
    pub fn size_in_bytes(&self) -> u64 {
        (self.key.len() + self.content.len()) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Processed by the broker.
    Ok,
    /// Held in the client queue until the connection is back.
    Queued,
    /// Dropped by the queue's overflow policy.
    Discarded,
    /// Redirected to the dead letter queue by the overflow policy.
    DeadLettered,
}

/// Answer for publish, subscribe, unsubscribe and erase requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnQos {
    pub state: RequestState,
    pub key: String,
    /// Set for subscribes, generated locally when the request was queued.
    pub subscription_id: Option<String>,
}

impl ReturnQos {
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            state: RequestState::Ok,
            key: key.into(),
            subscription_id: None,
        }
    }

    pub fn with_state(key: impl Into<String>, state: RequestState) -> Self {
        Self {
            state,
            key: key.into(),
            subscription_id: None,
        }
    }

    pub fn is_queued(&self) -> bool {
        self.state == RequestState::Queued
    }
}

/// Login data, kept by the client and replayed on every reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectQos {
    pub login_name: String,
    pub password: Option<String>,
    /// Reuse the broker side session of a previous login.
    pub session_name: Option<String>,
}

impl ConnectQos {
    pub fn new(login_name: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            password: None,
            session_name: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReturnQos {
    pub state: RequestState,
    /// Absolute session name assigned by the broker, used as message sender.
    pub session_name: Option<String>,
}

impl ConnectReturnQos {
    pub fn connected(session_name: impl Into<String>) -> Self {
        Self {
            state: RequestState::Ok,
            session_name: Some(session_name.into()),
        }
    }

    pub fn queued() -> Self {
        Self {
            state: RequestState::Queued,
            session_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectQos {
    /// Drop everything still waiting in the client queue.
    pub clear_client_queue: bool,
}
