//! Group-membership change detection.

use storm_api::{ApiClient, ApiResult};
use tracing::debug;

/// Tracks the membership snapshot of one group.
///
/// The snapshot is replaced before the comparison is made, so a change
/// is reported exactly once.
#[derive(Debug)]
pub struct GroupWatch {
    group: String,
    snapshot: Option<Vec<String>>,
}

impl GroupWatch {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            snapshot: None,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Refresh the snapshot and report whether membership changed.
    /// The first call always reports a change.
    pub async fn changed(&mut self, api: &ApiClient) -> ApiResult<bool> {
        let mut ids: Vec<String> = api
            .groups()
            .members(&self.group, None)
            .await?
            .into_iter()
            .map(|member| member.cloud_id)
            .collect();
        ids.sort_unstable();

        let previous = self.snapshot.replace(ids);
        let changed = snapshot_changed(previous.as_deref(), self.snapshot.as_deref().unwrap_or(&[]));
        if changed {
            debug!(group = %self.group, "group membership changed");
        }
        Ok(changed)
    }
}

/// A snapshot changed when there was none before, the cardinality
/// differs, or any member id differs.
fn snapshot_changed(previous: Option<&[String]>, current: &[String]) -> bool {
    match previous {
        None => true,
        Some(previous) => previous != current,
    }
}
