use std::fmt;

use thiserror::Error;

/// Machine-readable code carried by every [`CellGraphError::Validation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    RecordNotFound,
    VersionMismatch,
    DuplicateLinkTarget,
    InvalidCellValue,
    UniqueViolation,
    NotNullViolation,
    IllegalOperation,
}

impl ValidationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCode::RecordNotFound => "record_not_found",
            ValidationCode::VersionMismatch => "version_mismatch",
            ValidationCode::DuplicateLinkTarget => "duplicate_link_target",
            ValidationCode::InvalidCellValue => "invalid_cell_value",
            ValidationCode::UniqueViolation => "unique_violation",
            ValidationCode::NotNullViolation => "not_null_violation",
            ValidationCode::IllegalOperation => "illegal_operation",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Transient; the statement may be retried with identical inputs.
    Deadlock,
    UniqueViolation { column: String },
    NotNullViolation { column: String },
    /// The snapshot a transaction started from was replaced by another commit.
    WriteConflict,
    Other,
}

/// Debug context attached to a storage failure before it leaves the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageContext {
    pub sql: Option<String>,
    pub table: Option<String>,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub context: Option<StorageContext>,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Deadlock, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Other, message)
    }

    pub fn is_deadlock(&self) -> bool {
        self.kind == StorageErrorKind::Deadlock
    }

    pub fn with_context(mut self, context: StorageContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ctx) = &self.context {
            if let Some(table) = &ctx.table {
                write!(f, " [table={table}]")?;
            }
            if !ctx.fields.is_empty() {
                write!(f, " [fields={}]", ctx.fields.join(","))?;
            }
            if let Some(sql) = &ctx.sql {
                write!(f, " [sql={sql}]")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {}

#[derive(Error, Debug)]
pub enum CellGraphError {
    #[error("Validation error [{code}]: {message}")]
    Validation {
        code: ValidationCode,
        message: String,
    },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CellGraphError {
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn validation_code(&self) -> Option<ValidationCode> {
        match self {
            Self::Validation { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_deadlock())
    }
}

impl From<::config::ConfigError> for CellGraphError {
    fn from(value: config::ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CellGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_renders_context() {
        let err = StorageError::other("boom").with_context(StorageContext {
            sql: Some("UPDATE t SET a = 1".into()),
            table: Some("tbl_orders".into()),
            fields: vec!["fld_total".into()],
        });
        let text = CellGraphError::from(err).to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("table=tbl_orders"));
        assert!(text.contains("fields=fld_total"));
        assert!(text.contains("sql=UPDATE t SET a = 1"));
    }

    #[test]
    fn validation_carries_code() {
        let err = CellGraphError::validation(ValidationCode::RecordNotFound, "rec1 missing");
        assert_eq!(err.validation_code(), Some(ValidationCode::RecordNotFound));
        assert!(err.to_string().contains("record_not_found"));
        assert!(!err.is_deadlock());
    }
}
