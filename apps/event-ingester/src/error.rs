use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stage an item was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Validate,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Validate => "validate",
            Stage::Persist => "persist",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unparsable message body: {reason}")]
pub struct DecodeError {
    pub reason: String,
    pub raw_text: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
    #[error("unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchema { found: i64, supported: i64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable")]
    Unavailable,
    #[error("storage connection failed: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("storage query failed: {0}")]
    Query(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        let connectivity = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            // SQLSTATE class 08 is connection exception, 57P0x is operator shutdown.
            sqlx::Error::Database(db) => db
                .code()
                .map(|code| code.starts_with("08") || code.starts_with("57P0"))
                .unwrap_or(false),
            _ => false,
        };
        if connectivity {
            StorageError::Connection(err)
        } else {
            StorageError::Query(err)
        }
    }
}

#[derive(Debug, Error)]
#[error("publish to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// Failure of a single batch item; maps to exactly one dead-letter message.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ItemError {
    pub fn stage(&self) -> Stage {
        match self {
            ItemError::Validation(_) => Stage::Validate,
            ItemError::Storage(_) => Stage::Persist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_connectivity_errors() {
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolTimedOut),
            StorageError::Connection(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolClosed),
            StorageError::Connection(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::RowNotFound),
            StorageError::Query(_)
        ));
    }

    #[test]
    fn item_errors_report_their_stage() {
        let err = ItemError::from(ValidationError::MissingField("event_id"));
        assert_eq!(err.stage(), Stage::Validate);
        assert_eq!(err.to_string(), "missing required field event_id");
        assert_eq!(ItemError::from(StorageError::Unavailable).stage(), Stage::Persist);
    }
}
