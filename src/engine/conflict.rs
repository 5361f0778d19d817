use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Next `last_changed` for a row: the current time, but never at or behind `previous`.
pub(crate) fn next_change_stamp(previous: Option<Ms>) -> Ms {
    let now = now_ms();
    match previous {
        Some(prev) => now.max(prev + 1),
        None => now,
    }
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if range.begin >= range.end {
        return Err(InvalidRange { begin: range.begin, end: range.end }.into());
    }
    if range.begin < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

/// Any reservation on `es` overlapping `range`, other than `exclude`, is a conflict.
pub(crate) fn check_no_conflict(
    es: &EnvironmentState,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match es
        .overlapping(range)
        .find(|r| Some(r.id) != exclude)
    {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
