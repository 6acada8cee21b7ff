//! Error types for the etcd operator.

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Permanently invalid input. Retrying without a spec change cannot help.
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Fewer than a majority of members are running.
    #[error("lost quorum")]
    LostQuorum,

    /// Setup found the cluster already in the Creating phase.
    #[error("cluster failed to be created")]
    AlreadyCreating,

    /// The cluster is in a state this pass does not handle.
    #[error("Unexpected cluster state: {0}")]
    UnexpectedState(String),

    /// etcd member API error.
    #[error("etcd API error: {0}")]
    EtcdError(String),

    /// etcd reported that the member does not exist.
    #[error("etcd member {0:x} not found")]
    MemberNotFound(u64),

    /// A call exceeded its deadline.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline in seconds.
        seconds: u64,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Sentinel asking the scheduler to run the next pass soon.
    #[error("need requeue")]
    NeedRequeue,
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Whether retrying without a spec change is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OperatorError::Fatal(_))
    }

    /// Whether the error reports a missing object, which deletes treat as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::KubeError(kube::Error::Api(err)) => err.code == 404,
            OperatorError::NotFound { .. } | OperatorError::MemberNotFound(_) => true,
            _ => false,
        }
    }

    /// Whether the error reports an object that already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::KubeError(kube::Error::Api(err)) if err.code == 409)
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(OperatorError::Fatal("bad peer url".into()).is_fatal());
        assert!(!OperatorError::LostQuorum.is_fatal());
        assert!(OperatorError::MemberNotFound(7).is_not_found());
        assert!(
            OperatorError::NotFound {
                kind: "Pod".into(),
                name: "a".into(),
                namespace: "default".into(),
            }
            .is_not_found()
        );
        assert!(!OperatorError::EtcdError("connection refused".into()).is_not_found());
    }

    #[test]
    fn sentinel_messages() {
        assert_eq!(OperatorError::LostQuorum.to_string(), "lost quorum");
        assert_eq!(OperatorError::NeedRequeue.to_string(), "need requeue");
        assert_eq!(
            OperatorError::AlreadyCreating.to_string(),
            "cluster failed to be created"
        );
    }
}
