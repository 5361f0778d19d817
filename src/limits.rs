use crate::model::Ms;

/// Rows returned by any list call.
pub const PAGE_LIMIT: usize = 100;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_NOTE_LEN: usize = 4096;
pub const MAX_USER_LEN: usize = 256;
pub const MAX_OWNER_LEN: usize = 256;
pub const MAX_ORG_ID_LEN: usize = 256;

pub const MAX_RESERVATIONS_PER_ENVIRONMENT: usize = 100_000;
pub const MAX_ENVIRONMENTS: usize = 100_000;
