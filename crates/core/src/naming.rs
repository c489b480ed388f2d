//! Name validation and routable service paths.
//!
//! Names and versions end up in URL paths and on-disk folder names, so they
//! are restricted to a conservative character set.

use crate::error::{CoreError, ValidationKind};
use crate::service::ServiceKind;

/// Maximum length of a service name, version, step id or collection name.
const MAX_NAME_LEN: usize = 128;

/// Validate a name-like value.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_NAME_LEN` characters.
/// - Must contain only ASCII alphanumeric, hyphen, underscore, or dot characters.
/// - Must not be `.` or `..`.
pub fn validate_name(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            format!("{kind} must not be empty"),
        ));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            format!("{kind} must not exceed {MAX_NAME_LEN} characters"),
        ));
    }
    if value == "." || value == ".." {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            format!("{kind} must not be '{value}'"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::validation(
            ValidationKind::Malformed,
            format!("{kind} '{value}' may only contain ASCII letters, digits, '-', '_' or '.'"),
        ));
    }
    Ok(())
}

/// Routable path of a service entry: `/{kind}s/{name}/{version}`.
///
/// ```
/// use imgflow_core::naming::service_path;
/// use imgflow_core::service::ServiceKind;
///
/// assert_eq!(service_path(ServiceKind::Workflow, "binarize", "1"), "/workflows/binarize/1");
/// ```
pub fn service_path(kind: ServiceKind, name: &str, version: &str) -> String {
    format!("/{}/{name}/{version}", kind.collection())
}

/// Normalize a user-supplied target path (tolerates a missing leading slash
/// and a trailing slash).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
