//! Typed access to the Perfect Storm API server.
//!
//! The client exposes one [`Collection`] per resource kind plus the
//! [`Shortcuts`] resolution facade and the [`TriggerDriver`] for
//! submitting asynchronous work.

mod client;
mod error;
mod shortcuts;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod testutil;
mod trigger;

pub use client::{ApiClient, ApiResource, Collection, DEFAULT_SERVER};
pub use error::{ApiError, ApiResult};
pub use shortcuts::Shortcuts;
pub use trigger::{
    claim, complete, fail, Heartbeat, TriggerDriver, DEFAULT_POLL_INTERVAL, HEARTBEAT_INTERVAL,
};
