use ulid::Ulid;

use crate::limits::PAGE_LIMIT;
use crate::model::*;

use super::{Engine, EngineError, SharedEnvironmentState};

impl Engine {
    fn environment_handles(&self) -> Vec<SharedEnvironmentState> {
        self.environments.iter().map(|e| e.value().clone()).collect()
    }

    /// Environments ordered by id, optionally only those changed at or after `since`.
    pub async fn list_environments(&self, since: Option<Ms>) -> Vec<EnvironmentInfo> {
        let mut out = Vec::new();
        for es in self.environment_handles() {
            let guard = es.read().await;
            if since.is_none_or(|s| guard.last_changed >= s) {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|e| e.id);
        out.truncate(PAGE_LIMIT);
        out
    }

    pub async fn get_environment(&self, id: Ulid) -> Result<EnvironmentInfo, EngineError> {
        let es = self
            .get_environment_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = es.read().await;
        Ok(guard.info())
    }

    /// Reservations across all environments ordered by `range.begin` (ties by id),
    /// filtered on `last_changed >= since` when given.
    pub async fn list_reservations(&self, since: Option<Ms>) -> Vec<Reservation> {
        let mut out = Vec::new();
        for es in self.environment_handles() {
            let guard = es.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| since.is_none_or(|s| r.last_changed >= s))
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.range.begin, r.id));
        out.truncate(PAGE_LIMIT);
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let env_id = self
            .environment_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let es = self
            .get_environment_state(&env_id)
            .ok_or(EngineError::NotFound(env_id))?;
        let guard = es.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub fn environment_count(&self) -> usize {
        self.environments.len()
    }
}
