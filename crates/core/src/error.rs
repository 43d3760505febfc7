use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of record a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Profile,
    ClusterSpec,
    Descriptor,
    Bundle,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Profile => "profile",
            RecordKind::ClusterSpec => "cluster spec",
            RecordKind::Descriptor => "root descriptor",
            RecordKind::Bundle => "bundle",
        })
    }
}

/// Field whose identity an update attempted to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvariantField {
    ProviderTag,
    ClusterName,
    RepoUrl,
    Path,
}

impl fmt::Display for InvariantField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvariantField::ProviderTag => "provider tag",
            InvariantField::ClusterName => "cluster name",
            InvariantField::RepoUrl => "repo url",
            InvariantField::Path => "manifest path",
        })
    }
}

/// Backend a transport failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Git,
    Engine,
    Kube,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Git => "git",
            Backend::Engine => "engine",
            Backend::Kube => "kube",
        })
    }
}

/// Lifecycle errors. Every variant is surfaced to the caller verbatim.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum LifecycleError {
    #[error("not_found: {kind} '{name}'")]
    NotFound { kind: RecordKind, name: String },
    #[error("invariant violated ({field}): {message}")]
    InvariantViolation { field: InvariantField, message: String },
    #[error("malformed path: {0}")]
    MalformedPath(String),
    #[error("ambiguous tag: {0}")]
    AmbiguousTag(String),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("transport ({backend}): {message}")]
    Transport { backend: Backend, message: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("render: {0}")]
    Render(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl LifecycleError {
    pub fn not_found(kind: RecordKind, name: impl Into<String>) -> Self {
        LifecycleError::NotFound { kind, name: name.into() }
    }

    pub fn invariant(field: InvariantField, message: impl Into<String>) -> Self {
        LifecycleError::InvariantViolation { field, message: message.into() }
    }

    pub fn transport(backend: Backend, message: impl fmt::Display) -> Self {
        LifecycleError::Transport { backend, message: message.to_string() }
    }

    /// Whether re-running the whole operation may succeed without caller changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Transport { .. } | LifecycleError::Conflict(_) | LifecycleError::WriteConflict(_)
        )
    }

    /// Short machine-friendly label, used as a metrics/log dimension.
    pub fn kind_label(&self) -> &'static str {
        match self {
            LifecycleError::NotFound { .. } => "not_found",
            LifecycleError::InvariantViolation { .. } => "invariant",
            LifecycleError::MalformedPath(_) => "malformed_path",
            LifecycleError::AmbiguousTag(_) => "ambiguous_tag",
            LifecycleError::Configuration(_) => "configuration",
            LifecycleError::AlreadyExists(_) => "already_exists",
            LifecycleError::Transport { .. } => "transport",
            LifecycleError::Conflict(_) => "conflict",
            LifecycleError::Render(_) => "render",
            LifecycleError::WriteConflict(_) => "write_conflict",
            LifecycleError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_messages_name_the_field() {
        let e = LifecycleError::invariant(InvariantField::RepoUrl, "git reference changed");
        assert_eq!(e.to_string(), "invariant violated (repo url): git reference changed");
        let e = LifecycleError::invariant(InvariantField::ProviderTag, "provider/cloud/type changed");
        assert!(e.to_string().contains("provider tag"));
    }

    #[test]
    fn only_transport_like_errors_are_retryable() {
        assert!(LifecycleError::transport(Backend::Git, "timeout").is_retryable());
        assert!(LifecycleError::Conflict("rv".into()).is_retryable());
        assert!(!LifecycleError::invariant(InvariantField::Path, "x").is_retryable());
        assert!(!LifecycleError::not_found(RecordKind::Profile, "p").is_retryable());
    }
}
