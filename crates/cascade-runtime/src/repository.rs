use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use cascade_core::error::{CascadeError, Result};

use crate::state::{InstanceState, InstanceStatus};

/// Boxed future returned by repository operations.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence capability for workflow instances.
///
/// The driver depends only on this contract; the persisted layout is the
/// implementation's concern as long as field identity and status
/// transitions are preserved. `update` compare-and-sets on `updated_at` to
/// detect concurrent writers and returns the freshly assigned timestamp.
pub trait StateRepository: Send + Sync {
    /// Persist a new instance.
    fn create<'a>(&'a self, state: &'a InstanceState) -> RepoFuture<'a, ()>;

    /// Load an instance by id.
    fn load(&self, instance_id: Uuid) -> RepoFuture<'_, Option<InstanceState>>;

    /// Persist an updated instance. Fails with [`CascadeError::Conflict`]
    /// when the stored `updated_at` no longer matches the caller's copy.
    fn update<'a>(&'a self, state: &'a InstanceState) -> RepoFuture<'a, DateTime<Utc>>;

    /// Instances waiting for a signal whose deadline has passed, oldest
    /// deadline first, capped at `limit`.
    fn query_waiting_with_timeout(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepoFuture<'_, Vec<InstanceState>>;

    /// Remove an instance.
    fn delete(&self, instance_id: Uuid) -> RepoFuture<'_, ()>;
}

/// In-memory repository for tests and embedders without a durable store.
#[derive(Default)]
pub struct InMemoryStateRepository {
    instances: RwLock<HashMap<Uuid, InstanceState>>,
}

impl InMemoryStateRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances.
    pub fn len(&self) -> usize {
        self.instances.read().unwrap().len()
    }

    /// Check if the repository is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.read().unwrap().is_empty()
    }
}

impl StateRepository for InMemoryStateRepository {
    fn create<'a>(&'a self, state: &'a InstanceState) -> RepoFuture<'a, ()> {
        Box::pin(async move {
            let mut instances = self.instances.write().unwrap();
            if instances.contains_key(&state.instance_id) {
                return Err(CascadeError::Conflict(format!(
                    "Instance {} already exists",
                    state.instance_id
                )));
            }
            instances.insert(state.instance_id, state.clone());
            Ok(())
        })
    }

    fn load(&self, instance_id: Uuid) -> RepoFuture<'_, Option<InstanceState>> {
        Box::pin(async move { Ok(self.instances.read().unwrap().get(&instance_id).cloned()) })
    }

    fn update<'a>(&'a self, state: &'a InstanceState) -> RepoFuture<'a, DateTime<Utc>> {
        Box::pin(async move {
            let mut instances = self.instances.write().unwrap();
            let stored = instances.get_mut(&state.instance_id).ok_or_else(|| {
                CascadeError::NotFound(format!("Instance {} not found", state.instance_id))
            })?;

            if stored.updated_at != state.updated_at {
                return Err(CascadeError::Conflict(format!(
                    "Instance {} was modified concurrently",
                    state.instance_id
                )));
            }

            // Keep updated_at strictly increasing even under coarse clocks.
            let stamped = Utc::now().max(stored.updated_at + Duration::microseconds(1));
            *stored = state.clone();
            stored.updated_at = stamped;
            Ok(stamped)
        })
    }

    fn query_waiting_with_timeout(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepoFuture<'_, Vec<InstanceState>> {
        Box::pin(async move {
            let instances = self.instances.read().unwrap();
            let mut expired: Vec<InstanceState> = instances
                .values()
                .filter(|s| {
                    s.status == InstanceStatus::WaitingForSignal
                        && s.signal_timeout_at.is_some_and(|at| at < now)
                })
                .cloned()
                .collect();
            expired.sort_by_key(|s| s.signal_timeout_at);
            expired.truncate(limit);
            Ok(expired)
        })
    }

    fn delete(&self, instance_id: Uuid) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            self.instances.write().unwrap().remove(&instance_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting_state(deadline: DateTime<Utc>) -> InstanceState {
        let mut state = InstanceState::new("wf.test", "Test", serde_json::json!({}));
        state.wait_for_signal("approval", deadline);
        state
    }

    #[tokio::test]
    async fn test_create_load_roundtrip() {
        let repo = InMemoryStateRepository::new();
        let state = InstanceState::new("wf.test", "Test", serde_json::json!({"n": 1}));

        repo.create(&state).await.unwrap();
        let loaded = repo.load(state.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, "wf.test");
        assert_eq!(loaded.context, serde_json::json!({"n": 1}));

        assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let repo = InMemoryStateRepository::new();
        let state = InstanceState::new("wf.test", "Test", serde_json::json!({}));

        repo.create(&state).await.unwrap();
        assert!(matches!(
            repo.create(&state).await,
            Err(CascadeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_compare_and_sets_on_updated_at() {
        let repo = InMemoryStateRepository::new();
        let mut state = InstanceState::new("wf.test", "Test", serde_json::json!({}));
        repo.create(&state).await.unwrap();

        state.complete();
        let stamped = repo.update(&state).await.unwrap();
        assert!(stamped > state.updated_at);

        // A second write from the same stale copy loses the race.
        assert!(matches!(
            repo.update(&state).await,
            Err(CascadeError::Conflict(_))
        ));

        // Refreshing the timestamp wins again.
        state.updated_at = stamped;
        repo.update(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_waiting_filters_and_caps() {
        let repo = InMemoryStateRepository::new();
        let now = Utc::now();

        let expired_a = waiting_state(now - Duration::minutes(10));
        let expired_b = waiting_state(now - Duration::minutes(5));
        let pending = waiting_state(now + Duration::minutes(5));
        let mut running = InstanceState::new("wf.test", "Test", serde_json::json!({}));
        running.signal_timeout_at = Some(now - Duration::minutes(1));

        for state in [&expired_a, &expired_b, &pending, &running] {
            repo.create(state).await.unwrap();
        }

        let hits = repo.query_waiting_with_timeout(now, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].instance_id, expired_a.instance_id);
        assert_eq!(hits[1].instance_id, expired_b.instance_id);

        let capped = repo.query_waiting_with_timeout(now, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].instance_id, expired_a.instance_id);
    }

    #[tokio::test]
    async fn test_delete_removes_instance() {
        let repo = InMemoryStateRepository::new();
        let state = InstanceState::new("wf.test", "Test", serde_json::json!({}));
        repo.create(&state).await.unwrap();
        assert_eq!(repo.len(), 1);

        repo.delete(state.instance_id).await.unwrap();
        assert!(repo.is_empty());
    }
}
