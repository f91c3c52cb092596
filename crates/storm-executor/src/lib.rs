//! Convergence-loop substrate.
//!
//! A [`Reconciler`] drives observed state toward desired state; the
//! [`PollingExecutor`] runs it forever, re-reconciling whenever
//! `poll()` reports a change. [`HandlerHost`] is the consuming side:
//! it dequeues triggers and dispatches them to a worker.

mod error;
mod executor;
mod handler;
mod monitor;
mod watch;

pub use error::{ExecutorError, ExecutorResult};
pub use executor::{PollingExecutor, Reconciler};
pub use handler::{HandlerHost, TriggerWorker};
pub use monitor::{ApplicationsDiff, ApplicationsMonitor};
pub use watch::GroupWatch;
