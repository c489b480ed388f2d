//! Service entries: the registry records describing algorithms and workflows.

use serde::{Deserialize, Serialize};

use crate::naming::service_path;
use crate::status::StatusRecord;
use crate::types::{new_id, EntityId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Algorithm,
    Workflow,
}

impl ServiceKind {
    /// Capitalized name used in messages and error types.
    pub fn label(self) -> &'static str {
        match self {
            Self::Algorithm => "Algorithm",
            Self::Workflow => "Workflow",
        }
    }

    /// Plural path segment / folder name for this kind.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Algorithm => "algorithms",
            Self::Workflow => "workflows",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Algorithm => f.write_str("algorithm"),
            Self::Workflow => f.write_str("workflow"),
        }
    }
}

/// How an algorithm is run by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    /// Container image reference.
    pub image: String,
    /// Command and arguments run inside the container.
    #[serde(default)]
    pub command: Vec<String>,
    /// Per-algorithm execution timeout. Falls back to the queue default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub identifier: EntityId,
    pub name: String,
    pub version: String,
    pub path: String,
    pub kind: ServiceKind,
    pub status: StatusRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Only algorithms carry an execution spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
    pub created_at: Timestamp,
}

impl ServiceEntry {
    pub fn new(
        kind: ServiceKind,
        name: impl Into<String>,
        version: impl Into<String>,
        status: StatusRecord,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        Self {
            identifier: new_id(),
            path: service_path(kind, &name, &version),
            name,
            version,
            kind,
            status,
            description: None,
            execution: None,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn algorithm(
        name: impl Into<String>,
        version: impl Into<String>,
        execution: ExecutionSpec,
    ) -> Self {
        let mut entry = Self::new(
            ServiceKind::Algorithm,
            name,
            version,
            StatusRecord::done("algorithm available"),
        );
        entry.execution = Some(execution);
        entry
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_tombstoned()
    }

    /// Active and in the terminal "available" status.
    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    pub fn same_identity(&self, name: &str, version: &str) -> bool {
        self.name == name && self.version == version
    }
}

/// Discoverable summary written to the root index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootIndexEntry {
    pub identifier: EntityId,
    pub name: String,
    pub version: String,
    pub path: String,
    pub kind: ServiceKind,
    pub status_code: crate::status::StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&ServiceEntry> for RootIndexEntry {
    fn from(entry: &ServiceEntry) -> Self {
        Self {
            identifier: entry.identifier,
            name: entry.name.clone(),
            version: entry.version.clone(),
            path: entry.path.clone(),
            kind: entry.kind,
            status_code: entry.status.status_code,
            description: entry.description.clone(),
        }
    }
}
