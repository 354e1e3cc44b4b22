use thiserror::Error;

/// Details of a constraint a write tripped over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub constraint: Option<String>,
    pub table: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(table: &str, constraint: &str, message: impl Into<String>) -> Self {
        Self {
            constraint: Some(constraint.to_string()),
            table: Some(table.to_string()),
            message: message.into(),
        }
    }

    fn from_database(err: &dyn sqlx::error::DatabaseError) -> Self {
        Self {
            constraint: err.constraint().map(str::to_string),
            table: err.table().map(str::to_string),
            message: err.message().to_string(),
        }
    }
}

/// Storage errors the ledger and job queue report to their callers
#[derive(Error, Debug)]
pub enum DbError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("Unique constraint violation: {}", .0.message)]
    UniqueViolation(Violation),

    #[error("Foreign key constraint violation: {}", .0.message)]
    ForeignKeyViolation(Violation),

    #[error("Check constraint violation: {}", .0.message)]
    CheckViolation(Violation),

    /// A stored value could not be mapped back onto the domain model
    #[error("Corrupt {entity} row: {reason}")]
    Corrupt { entity: &'static str, reason: String },

    /// Connection, pool and other non-recoverable failures
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    pub fn not_found(entity: &'static str) -> Self {
        DbError::NotFound { entity }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let violation = match &err {
            sqlx::Error::RowNotFound => return DbError::NotFound { entity: "Row" },
            sqlx::Error::Database(db_err) => match db_err.kind() {
                sqlx::error::ErrorKind::UniqueViolation => DbError::UniqueViolation(Violation::from_database(&**db_err)),
                sqlx::error::ErrorKind::ForeignKeyViolation => DbError::ForeignKeyViolation(Violation::from_database(&**db_err)),
                sqlx::error::ErrorKind::CheckViolation => DbError::CheckViolation(Violation::from_database(&**db_err)),
                _ => return DbError::Other(anyhow::Error::from(err)),
            },
            _ => return DbError::Other(anyhow::Error::from(err)),
        };
        tracing::debug!(error = %violation, "Constraint violation");
        violation
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
