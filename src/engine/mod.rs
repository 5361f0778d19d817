mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedEnvironmentState = Arc<RwLock<EnvironmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then issues a single fsync for the batch and acknowledges every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Durable store of environments and their reservations.
///
/// Each environment sits behind its own lock; every reservation write holds
/// that lock across the overlap check, the WAL append and the in-memory apply.
/// The append and the apply run on a detached task (see [`run_detached`]), so
/// a caller dropped mid-commit cannot leave the WAL ahead of memory.
pub struct Engine {
    pub(super) environments: Arc<DashMap<Ulid, SharedEnvironmentState>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → environment id
    pub(super) reservation_index: Arc<DashMap<Ulid, Ulid>>,
    /// Shared by reservation writes; exclusive for compaction and for adding or
    /// removing environments. Compaction holding it means no append can land in
    /// the old WAL file between the snapshot and the swap.
    /// Always acquired before any environment lock.
    pub(super) commit_gate: Arc<RwLock<()>>,
}

pub(super) type EnvironmentWriteGuard = OwnedRwLockWriteGuard<EnvironmentState>;

/// Run a commit on its own task and wait for it. Once spawned, the commit
/// finishes even if the awaiting caller is dropped.
pub(super) async fn run_detached<T, F>(commit: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(commit)
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
}

/// Write event to WAL via the background group-commit writer.
pub(super) async fn append_event(
    wal_tx: &mpsc::Sender<WalCommand>,
    event: &Event,
) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::WalError(e.to_string()))
}

/// Apply an event to an environment's state (caller holds the lock).
fn apply_to_environment(es: &mut EnvironmentState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::EnvironmentUpdated { owner, note, at, .. } => {
            es.owner = owner.clone();
            es.note = note.clone();
            es.last_changed = *at;
        }
        Event::ReservationCreated {
            id,
            environment_id,
            range,
            by_user,
            note,
            at,
        } => {
            es.insert_reservation(Reservation {
                id: *id,
                environment_id: *environment_id,
                range: *range,
                note: note.clone(),
                by_user: by_user.clone(),
                last_changed: *at,
            });
            index.insert(*id, *environment_id);
        }
        Event::ReservationUpdated { id, range, note, at, .. } => {
            if let Some(mut reservation) = es.remove_reservation(*id) {
                reservation.range = *range;
                reservation.note = note.clone();
                reservation.last_changed = *at;
                es.insert_reservation(reservation);
            }
        }
        // Created/Deleted are handled at the map level
        Event::EnvironmentCreated { .. } | Event::EnvironmentDeleted { .. } => {}
    }
}

/// The environment an event belongs to, for events applied inside an environment.
fn event_environment_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::EnvironmentUpdated { id, .. } => Some(*id),
        Event::ReservationCreated { environment_id, .. }
        | Event::ReservationUpdated { environment_id, .. } => Some(*environment_id),
        Event::EnvironmentCreated { .. } | Event::EnvironmentDeleted { .. } => None,
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;

        let reservation_index = DashMap::new();
        let mut replayed: HashMap<Ulid, EnvironmentState> = HashMap::new();
        for event in &events {
            match event {
                Event::EnvironmentCreated { id, org_id, owner, note, at } => {
                    let es = EnvironmentState::new(*id, org_id.clone(), owner.clone(), note.clone(), *at);
                    replayed.insert(*id, es);
                }
                Event::EnvironmentDeleted { id } => {
                    replayed.remove(id);
                }
                other => {
                    if let Some(env_id) = event_environment_id(other)
                        && let Some(es) = replayed.get_mut(&env_id)
                    {
                        apply_to_environment(es, other, &reservation_index);
                    }
                }
            }
        }

        let environments = Arc::new(DashMap::with_capacity(replayed.len()));
        for (id, es) in replayed {
            environments.insert(id, Arc::new(RwLock::new(es)));
        }
        metrics::gauge!(observability::ENVIRONMENTS_ACTIVE).set(environments.len() as f64);
        tracing::info!(
            "engine opened: {} events replayed, {} environments, {} reservations",
            events.len(),
            environments.len(),
            reservation_index.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            environments,
            wal_tx,
            reservation_index: Arc::new(reservation_index),
            commit_gate: Arc::new(RwLock::new(())),
        })
    }

    pub(super) fn get_environment_state(&self, id: &Ulid) -> Option<SharedEnvironmentState> {
        self.environments.get(id).map(|e| e.value().clone())
    }

    pub fn environment_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    /// Shared gate plus the environment's write lock, both owned so they can
    /// move into a detached commit.
    pub(super) async fn lock_environment(
        &self,
        id: Ulid,
    ) -> Result<(OwnedRwLockReadGuard<()>, EnvironmentWriteGuard), EngineError> {
        let gate = self.commit_gate.clone().read_owned().await;
        let es = self
            .get_environment_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        Ok((gate, es.write_owned().await))
    }

    /// WAL-append then apply, detached from the caller. State is untouched if
    /// the append fails. The locks are held until the apply is done.
    pub(super) async fn persist_and_apply(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        mut guard: EnvironmentWriteGuard,
        event: Event,
    ) -> Result<EnvironmentWriteGuard, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.reservation_index.clone();
        run_detached(async move {
            let _gate = gate;
            append_event(&wal_tx, &event).await?;
            apply_to_environment(&mut guard, &event, &index);
            Ok(guard)
        })
        .await
    }
}

#[cfg(test)]
impl Engine {
    /// Replace the WAL writer with one that fails every write.
    pub(crate) fn fail_wal_writes(&mut self) {
        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let disk_full = || Err(io::Error::other("no space left on device"));
                match cmd {
                    WalCommand::Append { response, .. } => {
                        let _ = response.send(disk_full());
                    }
                    WalCommand::Compact { response, .. } => {
                        let _ = response.send(disk_full());
                    }
                    WalCommand::AppendsSinceCompact { response } => {
                        let _ = response.send(0);
                    }
                }
            }
        });
        self.wal_tx = tx;
    }
}
