use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Failure classes reported to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    InvalidInput(String),
    NotFound(String),
    Conflict(String),
    Unauthorized,
    /// Detail is for operators only.
    Internal(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ServiceError::NotFound(msg) => write!(f, "not found: {msg}"),
            ServiceError::Conflict(msg) => write!(f, "conflict: {msg}"),
            ServiceError::Unauthorized => write!(f, "unauthorized"),
            ServiceError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(_) => ServiceError::NotFound(e.to_string()),
            EngineError::Conflict(_)
            | EngineError::AlreadyExists(_)
            | EngineError::HasReservations(_) => ServiceError::Conflict(e.to_string()),
            EngineError::InvalidRange(_) | EngineError::LimitExceeded(_) => {
                ServiceError::InvalidInput(e.to_string())
            }
            EngineError::WalError(_) => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<InvalidRange> for ServiceError {
    fn from(e: InvalidRange) -> Self {
        ServiceError::InvalidInput(e.to_string())
    }
}

/// Parse an RFC 3339 timestamp (timezone required) into Unix milliseconds.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<Ms, ServiceError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.timestamp_millis())
        .map_err(|e| ServiceError::InvalidInput(format!("InvalidTimestamp: {field}: {e}")))
}

/// Unix milliseconds as an RFC 3339 UTC string with millisecond precision.
pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn parse_since(since: Option<&str>) -> Result<Option<Ms>, ServiceError> {
    match since.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_timestamp("since", raw).map(Some),
    }
}

fn required<'a>(field: &str, value: Option<&'a str>) -> Result<&'a str, ServiceError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ServiceError::InvalidInput(format!("missing required field: {field}"))),
    }
}

fn normalize_note(note: Option<String>) -> Option<String> {
    note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Path ids that are not ULIDs can never name a stored row.
fn parse_id(kind: &str, raw: &str) -> Result<Ulid, ServiceError> {
    Ulid::from_string(raw).map_err(|_| ServiceError::NotFound(format!("{kind} {raw}")))
}

/// Present, well-formed `begin` and `end`. Their order is checked once the
/// target rows are known to exist.
fn parse_bounds(begin: Option<&str>, end: Option<&str>) -> Result<(Ms, Ms), ServiceError> {
    let begin = parse_timestamp("begin", required("begin", begin)?)?;
    let end = parse_timestamp("end", required("end", end)?)?;
    Ok((begin, end))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateReservationRequest {
    pub begin: Option<String>,
    pub end: Option<String>,
    pub user: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateReservationRequest {
    pub begin: Option<String>,
    pub end: Option<String>,
    pub note: Option<String>,
}

/// Validates external input and delegates to the engine.
#[derive(Clone)]
pub struct ReservationService {
    engine: Arc<Engine>,
}

impl ReservationService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn list_environments(
        &self,
        since: Option<&str>,
    ) -> Result<Vec<EnvironmentInfo>, ServiceError> {
        let since = parse_since(since)?;
        Ok(self.engine.list_environments(since).await)
    }

    pub async fn list_reservations(
        &self,
        since: Option<&str>,
    ) -> Result<Vec<Reservation>, ServiceError> {
        let since = parse_since(since)?;
        Ok(self.engine.list_reservations(since).await)
    }

    pub async fn create_reservation(
        &self,
        environment_id: &str,
        request: CreateReservationRequest,
    ) -> Result<Reservation, ServiceError> {
        let (begin, end) = parse_bounds(request.begin.as_deref(), request.end.as_deref())?;
        let user = required("user", request.user.as_deref())?.to_string();
        let environment_id = parse_id("environment", environment_id)?;
        let note = normalize_note(request.note);

        self.engine.get_environment(environment_id).await?;
        let range = TimeRange::new(begin, end)?;

        Ok(self
            .engine
            .create_reservation(environment_id, range, user, note)
            .await?)
    }

    pub async fn update_reservation(
        &self,
        environment_id: &str,
        reservation_id: &str,
        request: UpdateReservationRequest,
    ) -> Result<Reservation, ServiceError> {
        let (begin, end) = parse_bounds(request.begin.as_deref(), request.end.as_deref())?;
        let environment_id = parse_id("environment", environment_id)?;
        let reservation_id = parse_id("reservation", reservation_id)?;
        let note = normalize_note(request.note);

        let current = self.engine.get_reservation(reservation_id).await?;
        if current.environment_id != environment_id {
            return Err(EngineError::NotFound(reservation_id).into());
        }
        let range = TimeRange::new(begin, end)?;

        Ok(self
            .engine
            .update_reservation(reservation_id, environment_id, range, note)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("envbook_test_service");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn service_with_env(name: &str) -> (ReservationService, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name)).unwrap());
        let env = Ulid::new();
        engine
            .create_environment(env, "org".into(), "ops".into(), None)
            .await
            .unwrap();
        (ReservationService::new(engine), env)
    }

    fn create_req(begin: &str, end: &str, user: &str) -> CreateReservationRequest {
        CreateReservationRequest {
            begin: Some(begin.into()),
            end: Some(end.into()),
            user: Some(user.into()),
            note: None,
        }
    }

    #[test]
    fn timestamps_parse_with_offsets() {
        let utc = parse_timestamp("t", "2024-01-01T10:00:00Z").unwrap();
        let offset = parse_timestamp("t", "2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(utc, offset);
        assert_eq!(utc, 1_704_103_200_000);
        assert_eq!(format_timestamp(utc), "2024-01-01T10:00:00.000Z");
    }

    #[test]
    fn timestamps_without_zone_rejected() {
        let err = parse_timestamp("since", "2024-01-01T10:00:00").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref m) if m.contains("InvalidTimestamp")));
        assert!(parse_timestamp("since", "yesterday").is_err());
    }

    #[test]
    fn empty_since_is_absent() {
        assert_eq!(parse_since(None).unwrap(), None);
        assert_eq!(parse_since(Some("  ")).unwrap(), None);
        assert!(parse_since(Some("2024-01-01T00:00:00Z")).unwrap().is_some());
    }

    #[test]
    fn engine_errors_map_to_taxonomy() {
        let id = Ulid::new();
        assert!(matches!(ServiceError::from(EngineError::NotFound(id)), ServiceError::NotFound(_)));
        assert!(matches!(ServiceError::from(EngineError::Conflict(id)), ServiceError::Conflict(_)));
        assert!(matches!(
            ServiceError::from(EngineError::HasReservations(id)),
            ServiceError::Conflict(_)
        ));
        assert!(matches!(
            ServiceError::from(EngineError::LimitExceeded("note too long")),
            ServiceError::InvalidInput(_)
        ));
        assert!(matches!(
            ServiceError::from(EngineError::WalError("disk full".into())),
            ServiceError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn create_requires_user() {
        let (svc, env) = service_with_env("requires_user.wal").await;
        let mut req = create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", "   ");
        let err = svc.create_reservation(&env.to_string(), req.clone()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref m) if m.contains("user")));

        req.user = None;
        assert!(svc.create_reservation(&env.to_string(), req).await.is_err());
        assert!(svc.list_reservations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_missing_and_inverted_range() {
        let (svc, env) = service_with_env("inverted_range.wal").await;
        let mut req = create_req("2024-01-01T11:00:00Z", "2024-01-01T10:00:00Z", "alice");
        let err = svc.create_reservation(&env.to_string(), req.clone()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref m) if m.contains("invalid range")));

        req.end = Some("2024-01-01T11:00:00Z".into());
        assert!(matches!(
            svc.create_reservation(&env.to_string(), req.clone()).await,
            Err(ServiceError::InvalidInput(_))
        ));

        req.begin = None;
        let err = svc.create_reservation(&env.to_string(), req).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(ref m) if m.contains("begin")));
        assert!(svc.list_reservations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_normalizes_input() {
        let (svc, env) = service_with_env("normalizes.wal").await;
        let mut req = create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00+00:00", "  alice ");
        req.note = Some("   ".into());
        let r = svc.create_reservation(&env.to_string(), req).await.unwrap();
        assert_eq!(r.by_user, "alice");
        assert_eq!(r.note, None);
        assert_eq!(r.range.end - r.range.begin, 3_600_000);
    }

    #[tokio::test]
    async fn unknown_or_malformed_environment_is_not_found() {
        let (svc, _env) = service_with_env("unknown_env.wal").await;
        let req = create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", "alice");
        assert!(matches!(
            svc.create_reservation("not-a-ulid", req.clone()).await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.create_reservation(&Ulid::new().to_string(), req).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_ids_reported_before_inverted_range() {
        let (svc, env) = service_with_env("ids_before_range.wal").await;
        let inverted = create_req("2024-01-01T11:00:00Z", "2024-01-01T10:00:00Z", "alice");
        assert!(matches!(
            svc.create_reservation(&Ulid::new().to_string(), inverted.clone()).await,
            Err(ServiceError::NotFound(_))
        ));

        let created = svc
            .create_reservation(
                &env.to_string(),
                create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", "alice"),
            )
            .await
            .unwrap();
        let inverted_update = UpdateReservationRequest {
            begin: inverted.begin.clone(),
            end: inverted.end.clone(),
            note: None,
        };
        assert!(matches!(
            svc.update_reservation(&Ulid::new().to_string(), &created.id.to_string(), inverted_update.clone())
                .await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.update_reservation(&env.to_string(), &created.id.to_string(), inverted_update).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert_eq!(svc.list_reservations(None).await.unwrap(), vec![created]);
    }

    #[tokio::test]
    async fn overlap_is_conflict() {
        let (svc, env) = service_with_env("overlap.wal").await;
        let env = env.to_string();
        svc.create_reservation(&env, create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", "a"))
            .await
            .unwrap();
        let err = svc
            .create_reservation(&env, create_req("2024-01-01T10:30:00Z", "2024-01-01T10:45:00Z", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_replaces_note() {
        let (svc, env) = service_with_env("update_note.wal").await;
        let env = env.to_string();
        let mut req = create_req("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", "alice");
        req.note = Some("demo".into());
        let created = svc.create_reservation(&env, req).await.unwrap();
        assert_eq!(created.note.as_deref(), Some("demo"));

        let updated = svc
            .update_reservation(
                &env,
                &created.id.to_string(),
                UpdateReservationRequest {
                    begin: Some("2024-01-01T10:00:00Z".into()),
                    end: Some("2024-01-01T12:00:00Z".into()),
                    note: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.note, None);
        assert_eq!(updated.by_user, "alice");
        assert_eq!(updated.range.end - updated.range.begin, 2 * 3_600_000);
    }

    #[tokio::test]
    async fn list_with_bad_since_is_invalid_input() {
        let (svc, _env) = service_with_env("bad_since.wal").await;
        assert!(matches!(
            svc.list_environments(Some("not-a-time")).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.list_reservations(Some("2024-13-01T00:00:00Z")).await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert_eq!(svc.list_environments(None).await.unwrap().len(), 1);
    }
}
