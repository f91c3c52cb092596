//! Domain model for Perfect Storm.
//!
//! These types mirror the resources held by the API server: nodes and
//! group members, groups with their declared services, applications,
//! recipes, and triggers. All types serialize to/from the JSON shapes
//! the API server speaks.

mod convert;
mod query;
mod types;

pub use convert::{ConvertError, UserApplication, UserLink};
pub use query::Query;
pub use types::*;
