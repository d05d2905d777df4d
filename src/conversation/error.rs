use thiserror::Error;

/// Errors surfaced by the conversation engine.
#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// `start` had no node id and no root is configured.
    #[error("No start node configured")]
    NoStartNode,

    /// Redirect/fallback hops in one navigation exceeded the configured limit.
    #[error("Redirect limit of {limit} exceeded at node {node_id}")]
    RedirectLimit { node_id: String, limit: usize },

    /// A host callback (enter action, choice action, dialogue source or
    /// context provider) failed.
    #[error("Callback failed at node {node_id}: {source}")]
    Callback {
        node_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A tree definition document is structurally invalid.
    #[error("Invalid tree definition: {0}")]
    Definition(String),
}
