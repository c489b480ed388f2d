use std::fmt;

use crate::runtime::ExecutionError;
use crate::service::ServiceKind;
use crate::status::StatusRecord;
use crate::types::EntityId;

/// What went wrong while validating a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Structural problems: empty names, no steps, duplicate step ids.
    Malformed,
    /// A step targets a path that is missing or not available.
    UnknownTarget,
    /// The binding graph contains a cycle.
    Cyclic,
    /// A binding names an output that no step produces.
    UnknownBinding,
}

impl ValidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "Malformed",
            Self::UnknownTarget => "UnknownTarget",
            Self::Cyclic => "Cyclic",
            Self::UnknownBinding => "UnknownBinding",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An active entry with the same name and version exists. `kind` is the
    /// kind of that existing entry.
    #[error("{} {name} version {version} already exists", .kind.label())]
    Duplicate {
        kind: ServiceKind,
        name: String,
        version: String,
        identifier: EntityId,
        status: StatusRecord,
    },

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed state file {path}: {source}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Container execution failed: {0}")]
    ContainerExecution(#[from] ExecutionError),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn validation(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::new(kind, message))
    }

    /// Storage errors are the only ones worth retrying blindly.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
