//! Error taxonomy surfaced out of the reconcile loop.
//!
//! Every variant keeps its original message so that status.message carries
//! the concise cause to the user; the queue re-enqueues with backoff.

use thiserror::Error;

/// Why a dependency gate failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyReason {
    NotFound,
    NotInstalled,
}

impl std::fmt::Display for DependencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyReason::NotFound => write!(f, "not found"),
            DependencyReason::NotInstalled => write!(f, "not installed"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("dependency {namespace}/{name}: {reason}")]
    Dependency {
        reason: DependencyReason,
        namespace: String,
        name: String,
    },

    #[error("values reference {kind}/{name}: {detail}")]
    Reference {
        kind: String,
        name: String,
        detail: String,
    },

    #[error("render: {0}")]
    Render(String),

    /// Aggregated per-object apply/delete failures, newline-joined.
    #[error("{}", .0.join("\n"))]
    Apply(Vec<String>),

    #[error("release {name} stuck in {status}: {detail}")]
    PendingRelease {
        name: String,
        status: String,
        detail: String,
    },

    #[error("unknown instance kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when a not-found kube error sits at the root.
    pub fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }

    /// True when the apiserver rejected a write due to a stale object.
    pub fn is_conflict(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_joins_messages_with_newlines() {
        let err = Error::Apply(vec!["a failed".into(), "b failed".into()]);
        assert_eq!(err.to_string(), "a failed\nb failed");
    }

    #[test]
    fn dependency_error_mentions_object_and_reason() {
        let err = Error::Dependency {
            reason: DependencyReason::NotFound,
            namespace: "default".into(),
            name: "non-existent".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("non-existent"));
        assert!(msg.contains("not found"));
    }
}
