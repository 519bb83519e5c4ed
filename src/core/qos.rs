//! Message quality-of-service attributes carried by every queued request.
//!
//! Only the attributes the client queue and dispatcher reason about live here:
//! priority, lifetime/expiry, persistence, sender, point-to-point destinations,
//! queue position and redelivery count.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::error::{ClientError, ClientResult};

/// Message priority, `0` (lowest) to `9` (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const LOW: Priority = Priority(3);
    pub const NORM: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const MAX: Priority = Priority(9);

    pub fn new(value: u8) -> ClientResult<Self> {
        if value > Self::MAX.0 {
            return Err(ClientError::InvalidArgument(format!(
                "priority {value} is outside 0..=9"
            )));
        }
        Ok(Priority(value))
    }

    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORM
    }
}

impl TryFrom<u8> for Priority {
    type Error = ClientError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point-to-point receiver of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: String,
    /// Queue the message on the client while the broker is unreachable
    /// instead of rejecting the publish.
    pub force_queuing: bool,
}

impl Destination {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            force_queuing: false,
        }
    }

    pub fn force_queuing(mut self, yes: bool) -> Self {
        self.force_queuing = yes;
        self
    }
}

/// Lifetime value meaning "never expires".
pub const LIFETIME_FOREVER: i64 = -1;

#[derive(Debug)]
pub struct MsgQos {
    pub priority: Priority,
    lifetime_ms: i64,
    pub force_destroy: bool,
    pub persistent: bool,
    pub subscribable: bool,
    pub sender: Option<String>,
    pub destinations: Vec<Destination>,
    /// Position inside the batch it was sent with, `-1` until dispatched.
    pub queue_index: i64,
    pub queue_size: i64,
    pub redeliver: u32,
    /// Id a queued subscribe was answered with, replayed so the broker
    /// hands out the same one.
    pub subscription_id: Option<String>,
    rcv_timestamp: Instant,
    // latched once observed, expiry never reverts
    expired: AtomicBool,
}

impl MsgQos {
    pub fn new() -> Self {
        Self {
            priority: Priority::NORM,
            lifetime_ms: LIFETIME_FOREVER,
            force_destroy: false,
            persistent: false,
            subscribable: true,
            sender: None,
            destinations: Vec::new(),
            queue_index: -1,
            queue_size: -1,
            redeliver: 0,
            subscription_id: None,
            rcv_timestamp: Instant::now(),
            expired: AtomicBool::new(false),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// `-1` lives forever, `0` marks a volatile message.
    pub fn with_lifetime_ms(mut self, lifetime_ms: i64) -> Self {
        self.lifetime_ms = lifetime_ms.max(LIFETIME_FOREVER);
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_force_destroy(mut self, force_destroy: bool) -> Self {
        self.force_destroy = force_destroy;
        self
    }

    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_id = Some(id.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self.subscribable = false;
        self
    }

    pub fn lifetime_ms(&self) -> i64 {
        self.lifetime_ms
    }

    pub fn rcv_timestamp(&self) -> Instant {
        self.rcv_timestamp
    }

    /// Volatile messages are delivered to whoever is listening right now and
    /// never stored on the broker.
    pub fn is_volatile(&self) -> bool {
        self.lifetime_ms == 0 && !self.force_destroy
    }

    pub fn is_ptp(&self) -> bool {
        !self.destinations.is_empty()
    }

    /// A point-to-point message may wait in the client queue only when at
    /// least one destination asked for it.
    pub fn allows_queuing(&self) -> bool {
        !self.is_ptp() || self.destinations.iter().any(|d| d.force_queuing)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        if self.lifetime_ms <= 0 {
            return false;
        }
        if self.expired.load(Ordering::Relaxed) {
            return true;
        }
        let deadline = self.rcv_timestamp + Duration::from_millis(self.lifetime_ms as u64);
        if now >= deadline {
            self.expired.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Remaining lifetime in milliseconds, `-1` for unlimited.
    pub fn remaining_life_ms(&self) -> i64 {
        if self.lifetime_ms <= 0 {
            return LIFETIME_FOREVER;
        }
        let deadline = self.rcv_timestamp + Duration::from_millis(self.lifetime_ms as u64);
        deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as i64
    }
}

impl Default for MsgQos {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MsgQos {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            lifetime_ms: self.lifetime_ms,
            force_destroy: self.force_destroy,
            persistent: self.persistent,
            subscribable: self.subscribable,
            sender: self.sender.clone(),
            destinations: self.destinations.clone(),
            queue_index: self.queue_index,
            queue_size: self.queue_size,
            redeliver: self.redeliver,
            subscription_id: self.subscription_id.clone(),
            rcv_timestamp: self.rcv_timestamp,
            expired: AtomicBool::new(self.expired.load(Ordering::Relaxed)),
        }
    }
}
