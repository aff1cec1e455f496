use thiserror::Error;

/// Errors of the cluster management layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Discovery produced no reachable worker node.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// `initialize` was called while another initialization was running or
    /// had already completed.
    #[error("cluster manager is already initialized")]
    AlreadyInitialized,

    /// An operation that needs a running cluster was called before
    /// `initialize` completed.
    #[error("cluster manager is not initialized")]
    NotInitialized,

    /// A node id that is not part of the cluster.
    #[error("unknown node `{0}`")]
    UnknownNode(String),

    /// A backend call failed.
    #[error(transparent)]
    Backend(#[from] llm::LlmError),
}
