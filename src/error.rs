//! Error types for the session schema engine
//!
//! Every error names the entity, attribute and offending value it is about,
//! so callers can fix the input and retry.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::schema::Value;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Schema engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed entity declaration, detected at registration
    #[error("Invalid definition of `{entity}`: {reason}")]
    SchemaDefinition {
        /// Entity being defined
        entity: String,
        /// What is wrong with it
        reason: String,
    },

    /// Circular schema activation
    #[error("Dependency cycle while activating schemas: {}", path.join(" -> "))]
    DependencyCycle {
        /// Activation path, ending with the namespace requested twice
        path: Vec<String>,
    },

    /// Logical schema name already bound with a different definition
    #[error("Schema `{schema}` is already active as `{active}` with a different definition (requested `{requested}`)")]
    AlreadyActiveConflict {
        /// Logical schema name
        schema: String,
        /// Namespace it is active under
        active: String,
        /// Namespace requested by the failing activation
        requested: String,
    },

    /// Insert or update rejected by a constraint
    #[error("Constraint violation: {0}")]
    ConstraintViolation(Violation),

    /// Delete blocked by dependents behind a non-cascading reference
    #[error("Cannot delete {key} from `{entity}`: referenced by {dependents} row(s) of `{dependent}` (on delete restrict)")]
    CascadeBlocked {
        /// Entity of the record being deleted (or reached by cascade)
        entity: String,
        /// Primary key of that record
        key: String,
        /// Entity holding the blocking references
        dependent: String,
        /// Number of blocking rows
        dependents: usize,
    },

    /// Update or delete on an absent key
    #[error("No record {key} in `{entity}`")]
    NotFound {
        /// Entity searched
        entity: String,
        /// Primary key searched for
        key: String,
    },

    /// Bounded lock wait exceeded
    #[error("Timed out after {waited:?} waiting for lock on `{resource}`; retry the operation")]
    LockTimeout {
        /// Namespace or entity whose lock was contended
        resource: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Entity not registered in the registry
    #[error("Unknown entity `{0}`: activate its schema first")]
    UnknownEntity(String),

    /// Restriction or definition text could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error (export/import)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller can fix the input (or wait) and retry.
    ///
    /// Definition errors and activation cycles are fatal to the schema
    /// being declared; write-time errors are recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConstraintViolation(_)
                | Self::CascadeBlocked { .. }
                | Self::NotFound { .. }
                | Self::LockTimeout { .. }
        )
    }

    /// The structured violation, if this is a constraint violation.
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        match self {
            Self::ConstraintViolation(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn definition(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaDefinition {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Which constraint a write violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Non-nullable attribute without default was omitted
    MissingAttribute,
    /// Tuple names an attribute outside the heading
    UnknownAttribute,
    /// Value does not match the attribute type
    TypeMismatch,
    /// Text longer than the declared `varchar(n)`
    ValueTooLong,
    /// Text outside the declared enum values
    NotInEnum,
    /// Null given for a non-nullable attribute
    NullNotAllowed,
    /// Referenced record does not exist
    DanglingForeignKey,
    /// Primary key already present
    DuplicateKey,
    /// Update tried to change a primary-key attribute
    PrimaryKeyImmutable,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingAttribute => "missing required attribute",
            Self::UnknownAttribute => "unknown attribute",
            Self::TypeMismatch => "type mismatch",
            Self::ValueTooLong => "value too long",
            Self::NotInEnum => "value not in enum",
            Self::NullNotAllowed => "null not allowed",
            Self::DanglingForeignKey => "dangling foreign key",
            Self::DuplicateKey => "duplicate primary key",
            Self::PrimaryKeyImmutable => "primary key is immutable",
        };
        f.write_str(s)
    }
}

/// Structured description of a constraint violation.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Violated constraint
    pub kind: ConstraintKind,
    /// Qualified entity name
    pub entity: String,
    /// Offending attribute (or referenced entity for foreign keys)
    pub attribute: Option<String>,
    /// Offending value, if any
    pub value: Option<Value>,
    /// Extra detail
    pub detail: Option<String>,
}

impl Violation {
    pub(crate) fn new(kind: ConstraintKind, entity: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            attribute: None,
            value: None,
            detail: None,
        }
    }

    pub(crate) fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub(crate) fn value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub(crate) fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in `{}`", self.kind, self.entity)?;
        if let Some(attribute) = &self.attribute {
            write!(f, " (attribute `{attribute}`")?;
            if let Some(value) = &self.value {
                write!(f, " = {value}")?;
            }
            f.write_str(")")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Self::ConstraintViolation(v)
    }
}
