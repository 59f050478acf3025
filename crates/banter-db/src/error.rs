use rusqlite::ErrorCode;
use thiserror::Error;

// Extended result codes for unique-constraint violations; the plain
// ConstraintViolation code also covers CHECK failures, which are not
// duplicates.
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

/// Storage failures, split so callers can tell retryable contention and
/// expected conflicts apart from real errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database is momentarily locked by another writer. Retry with
    /// backoff.
    #[error("storage busy")]
    Busy,

    /// A uniqueness constraint rejected the write (row already exists).
    #[error("duplicate record")]
    Duplicate,

    /// The referenced row does not exist.
    #[error("not found")]
    NotFound,

    #[error("store lock poisoned")]
    Poisoned,

    #[error("storage error: {0}")]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Busy,
                ErrorCode::ConstraintViolation
                    if err.extended_code == SQLITE_CONSTRAINT_UNIQUE
                        || err.extended_code == SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    StoreError::Duplicate
                }
                _ => StoreError::Sqlite(e),
            },
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            _ => StoreError::Sqlite(e),
        }
    }
}
