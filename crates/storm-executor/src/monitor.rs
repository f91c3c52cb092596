//! Differential change feeds over API collections.
//!
//! A monitor tracks one collection and emits the delta against its
//! last emission, giving reconcilers change-driven work instead of
//! full-sweep work.

use std::collections::BTreeMap;

use storm_api::{ApiClient, ApiResult};
use storm_core::Application;
use tracing::debug;

/// The delta between two observations of the applications collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationsDiff {
    pub added: Vec<Application>,
    pub updated: Vec<Application>,
    pub deleted: Vec<Application>,
}

impl ApplicationsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Tracks the set of `applications` resources.
#[derive(Debug, Default)]
pub struct ApplicationsMonitor {
    last: BTreeMap<String, Application>,
}

impl ApplicationsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the collection and emit the diff against the last poll.
    pub async fn poll(&mut self, api: &ApiClient) -> ApiResult<ApplicationsDiff> {
        let current = api.apps().all().await?;
        let diff = diff_applications(&self.last, &current);

        self.last = current
            .into_iter()
            .map(|app| (app.name.clone(), app))
            .collect();

        if !diff.is_empty() {
            debug!(
                added = diff.added.len(),
                updated = diff.updated.len(),
                deleted = diff.deleted.len(),
                "applications changed"
            );
        }
        Ok(diff)
    }
}

fn diff_applications(
    previous: &BTreeMap<String, Application>,
    current: &[Application],
) -> ApplicationsDiff {
    let mut diff = ApplicationsDiff::default();

    for app in current {
        match previous.get(&app.name) {
            None => diff.added.push(app.clone()),
            Some(old) if old != app => diff.updated.push(app.clone()),
            Some(_) => {}
        }
    }

    for (name, old) in previous {
        if !current.iter().any(|app| &app.name == name) {
            diff.deleted.push(old.clone());
        }
    }

    diff
}
