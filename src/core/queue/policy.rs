use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What `put` does when the queue has no room left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Wait up to the configured block timeout for room.
    Block,
    /// Hand the incoming entry to the dead letter queue.
    #[default]
    DeadMessage,
    /// Drop the incoming entry.
    Discard,
    /// Evict the lowest priority, oldest entries to make room.
    DiscardOldest,
    /// Fail the put with `QueueFull`.
    Exception,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Block => "block",
            OverflowPolicy::DeadMessage => "deadMessage",
            OverflowPolicy::Discard => "discard",
            OverflowPolicy::DiscardOldest => "discardOldest",
            OverflowPolicy::Exception => "exception",
        }
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(OverflowPolicy::Block),
            "deadMessage" => Ok(OverflowPolicy::DeadMessage),
            "discard" => Ok(OverflowPolicy::Discard),
            "discardOldest" => Ok(OverflowPolicy::DiscardOldest),
            "exception" => Ok(OverflowPolicy::Exception),
            other => Err(format!("unknown onOverflow policy '{other}'")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to queued entries once the connection is given up (DEAD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    #[default]
    DeadMessage,
    Discard,
    /// Leave them queued for an explicit reconnect.
    Keep,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::DeadMessage => "deadMessage",
            FailurePolicy::Discard => "discard",
            FailurePolicy::Keep => "keep",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deadMessage" => Ok(FailurePolicy::DeadMessage),
            "discard" => Ok(FailurePolicy::Discard),
            "keep" => Ok(FailurePolicy::Keep),
            other => Err(format!("unknown onFailure policy '{other}'")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner side of a queue. The client runtime only ever creates `client`
/// queues, the other names are accepted so shared configs still load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relating {
    Callback,
    Subject,
    #[default]
    Client,
}
