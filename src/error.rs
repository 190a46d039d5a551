use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors raised while building, persisting, loading or querying an index.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("corpus is empty")]
    EmptyCorpus,

    #[error("record {id} is invalid: {reason}")]
    InvalidRecord { id: u64, reason: String },

    #[error("corpus line {line}: {reason}")]
    CorpusFormat { line: usize, reason: String },

    #[error("embedding failed for {subject}: {reason}")]
    EmbeddingFailure { subject: String, reason: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("no index loaded")]
    IndexNotLoaded,

    #[error("corrupt artifact '{artifact}': {reason}")]
    CorruptArtifact { artifact: String, reason: String },

    #[error("no index artifacts found under '{}'", .0.display())]
    ArtifactsMissing(PathBuf),

    #[error("index was built with model '{index_model}' but the embedder is '{embedder_model}'")]
    ModelMismatch {
        index_model: String,
        embedder_model: String,
    },

    #[error("invalid search request: {0}")]
    InvalidQuery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RetrievalError {
    pub(crate) fn corrupt(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptArtifact {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }
}
