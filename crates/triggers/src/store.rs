//! In-process assignment store backed by DashMap.

use dashmap::DashMap;
use paywall_core::collaborators::AssignmentStore;
use paywall_core::types::StoredAssignment;
use paywall_core::PaywallResult;

/// Assignment store that lives as long as the process. Hosts with a durable
/// store implement `AssignmentStore` themselves.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    records: DashMap<(String, String), StoredAssignment>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every assignment of `user_id`.
    pub fn clear_user(&self, user_id: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|(user, _), _| user != user_id);
        before - self.records.len()
    }
}

impl AssignmentStore for InMemoryAssignmentStore {
    fn get(&self, user_id: &str, experiment_id: &str) -> PaywallResult<Option<StoredAssignment>> {
        Ok(self
            .records
            .get(&(user_id.to_string(), experiment_id.to_string()))
            .map(|r| r.value().clone()))
    }

    fn put(
        &self,
        user_id: &str,
        experiment_id: &str,
        assignment: StoredAssignment,
    ) -> PaywallResult<()> {
        self.records
            .insert((user_id.to_string(), experiment_id.to_string()), assignment);
        Ok(())
    }
}
