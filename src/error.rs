use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("no node named '{0}' in graph")]
    UnknownNode(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("npy: {0}")]
    Npy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
