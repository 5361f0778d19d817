use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, next_change_stamp, validate_note, validate_range};
use super::{Engine, EngineError, WalCommand, append_event, run_detached};

impl Engine {
    // ── Environment registry (provisioning boundary) ─────────

    pub async fn create_environment(
        &self,
        id: Ulid,
        org_id: String,
        owner: String,
        note: Option<String>,
    ) -> Result<EnvironmentInfo, EngineError> {
        if self.environments.len() >= MAX_ENVIRONMENTS {
            return Err(EngineError::LimitExceeded("too many environments"));
        }
        if org_id.len() > MAX_ORG_ID_LEN {
            return Err(EngineError::LimitExceeded("org id too long"));
        }
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner too long"));
        }
        validate_note(note.as_deref())?;
        let gate = self.commit_gate.clone().write_owned().await;
        if self.environments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let at = next_change_stamp(None);
        let event = Event::EnvironmentCreated {
            id,
            org_id: org_id.clone(),
            owner: owner.clone(),
            note: note.clone(),
            at,
        };
        let wal_tx = self.wal_tx.clone();
        let environments = self.environments.clone();
        let info = run_detached(async move {
            let _gate = gate;
            append_event(&wal_tx, &event).await?;
            let es = EnvironmentState::new(id, org_id, owner, note, at);
            let info = es.info();
            environments.insert(id, Arc::new(RwLock::new(es)));
            Ok(info)
        })
        .await?;
        metrics::gauge!(observability::ENVIRONMENTS_ACTIVE).set(self.environments.len() as f64);
        tracing::info!("environment {id} created");
        Ok(info)
    }

    pub async fn update_environment(
        &self,
        id: Ulid,
        owner: String,
        note: Option<String>,
    ) -> Result<EnvironmentInfo, EngineError> {
        if owner.len() > MAX_OWNER_LEN {
            return Err(EngineError::LimitExceeded("owner too long"));
        }
        validate_note(note.as_deref())?;
        let (gate, guard) = self.lock_environment(id).await?;

        let at = next_change_stamp(Some(guard.last_changed));
        let event = Event::EnvironmentUpdated { id, owner, note, at };
        let guard = self.persist_and_apply(gate, guard, event).await?;
        Ok(guard.info())
    }

    /// Environments referenced by any reservation cannot be deleted.
    pub async fn delete_environment(&self, id: Ulid) -> Result<(), EngineError> {
        let gate = self.commit_gate.clone().write_owned().await;
        let es = self
            .get_environment_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = es.read_owned().await;
        if !guard.reservations.is_empty() {
            return Err(EngineError::HasReservations(id));
        }

        let event = Event::EnvironmentDeleted { id };
        let wal_tx = self.wal_tx.clone();
        let environments = self.environments.clone();
        run_detached(async move {
            let _locks = (gate, guard);
            append_event(&wal_tx, &event).await?;
            environments.remove(&id);
            Ok(())
        })
        .await?;
        metrics::gauge!(observability::ENVIRONMENTS_ACTIVE).set(self.environments.len() as f64);
        tracing::info!("environment {id} deleted");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn create_reservation(
        &self,
        environment_id: Ulid,
        range: TimeRange,
        by_user: String,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let (gate, guard) = self.lock_environment(environment_id).await?;
        validate_range(&range)?;
        validate_note(note.as_deref())?;
        if by_user.len() > MAX_USER_LEN {
            return Err(EngineError::LimitExceeded("user too long"));
        }

        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ENVIRONMENT {
            return Err(EngineError::LimitExceeded("too many reservations on environment"));
        }
        if let Err(e) = check_no_conflict(&guard, &range, None) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            environment_id,
            range,
            by_user: by_user.clone(),
            note: note.clone(),
            at: next_change_stamp(None),
        };
        let guard = self.persist_and_apply(gate, guard, event).await?;
        tracing::info!(
            "reservation {id} created on {environment_id} [{}, {}) by {by_user}",
            range.begin,
            range.end
        );
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// `id` must belong to `environment_id`; a reservation from another
    /// environment is reported as not found and left untouched.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        environment_id: Ulid,
        range: TimeRange,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let (gate, guard) = self.lock_environment(environment_id).await?;
        let previous = guard
            .reservation(id)
            .map(|r| r.last_changed)
            .ok_or(EngineError::NotFound(id))?;

        validate_range(&range)?;
        validate_note(note.as_deref())?;
        if let Err(e) = check_no_conflict(&guard, &range, Some(id)) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::ReservationUpdated {
            id,
            environment_id,
            range,
            note,
            at: next_change_stamp(Some(previous)),
        };
        let guard = self.persist_and_apply(gate, guard, event).await?;
        tracing::info!(
            "reservation {id} on {environment_id} moved to [{}, {})",
            range.begin,
            range.end
        );
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let shared: Vec<_> = self.environments.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for es in shared {
            let guard = es.read().await;
            events.push(Event::EnvironmentCreated {
                id: guard.id,
                org_id: guard.org_id.clone(),
                owner: guard.owner.clone(),
                note: guard.note.clone(),
                at: guard.last_changed,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    environment_id: r.environment_id,
                    range: r.range,
                    by_user: r.by_user.clone(),
                    note: r.note.clone(),
                    at: r.last_changed,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
