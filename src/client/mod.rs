//! Application facing client API.

pub mod handler;
pub mod registry;

pub use handler::{ClientBuilder, FailsafeClient};
pub use registry::ConnectionRegistry;
