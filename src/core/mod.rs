pub mod connection;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod message;
pub mod qos;
pub mod queue;
pub mod shutdown;
pub mod timer;
pub mod transport;
