//! Retrieval core for a support-ticket question answering bot.
//!
//! The [`indexer`] embeds a corpus of query/solution pairs into a flat
//! [`VectorIndex`] and publishes it through an [`IndexStore`]; the
//! [`Retriever`] loads the current generation and answers top-k
//! nearest-neighbour searches against it.

pub mod config;
pub mod corpus;
pub mod embedder;
pub mod error;
pub mod index;
pub mod indexer;
pub mod ollama;
pub mod prompt;
pub mod record;
pub mod retriever;
pub mod store;
pub mod vector_ops;

pub use embedder::{Embedder, HashingEmbedder};
pub use error::{Result, RetrievalError};
pub use index::{Metric, VectorIndex};
pub use indexer::{build_index, reindex, BuildReport, BuiltIndex, ReindexOutcome};
pub use ollama::OllamaEmbedder;
pub use record::{CorpusRecord, RecordStore, SearchResult};
pub use retriever::{search, Retriever};
pub use store::{FileIndexStore, IndexSnapshot, IndexStore, Manifest, MemoryIndexStore};
