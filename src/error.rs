use thiserror::Error;

/// Fatal error kinds. Non-fatal conditions (unknown words, back-off,
/// bound-only results) travel in returned values, never through here.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model integrity: {0}")]
    ModelIntegrity(String),

    #[error("topology: {0}")]
    Topology(String),

    #[error("routing: {0}")]
    Routing(String),

    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),
}
