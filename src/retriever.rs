use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

use crate::embedder::{embed_text, Embedder};
use crate::error::{Result, RetrievalError};
use crate::record::SearchResult;
use crate::store::{IndexSnapshot, IndexStore};

/// Top-`k` records for `query`, closest first.
///
/// The embedder must be the model the snapshot was built with; only the
/// dimension can be checked here.
pub fn search(
    query: &str,
    k: usize,
    embedder: &dyn Embedder,
    snapshot: &IndexSnapshot,
) -> Result<Vec<SearchResult>> {
    if k == 0 {
        return Err(RetrievalError::InvalidQuery("k must be at least 1".into()));
    }
    if query.trim().is_empty() {
        return Err(RetrievalError::InvalidQuery("query is empty".into()));
    }

    let index = snapshot.index();
    if index.is_empty() {
        return Ok(Vec::new());
    }

    let start = Instant::now();
    let query_vector = embed_text(embedder, query, "query")?;
    if query_vector.len() != index.dimension() {
        return Err(RetrievalError::DimensionMismatch {
            expected: index.dimension(),
            actual: query_vector.len(),
        });
    }

    let hits = index.nearest(&query_vector, k)?;
    let records = snapshot.records();
    let results = hits
        .into_iter()
        .map(|(position, distance)| {
            records
                .get(position)
                .map(|record| SearchResult {
                    record: record.clone(),
                    distance,
                })
                .ok_or_else(|| {
                    RetrievalError::corrupt(
                        snapshot.generation(),
                        format!("no record at position {}", position),
                    )
                })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "Search for k={} returned {} results in {:?}",
        k,
        results.len(),
        start.elapsed()
    );
    Ok(results)
}

/// Serves searches against one installed index generation at a time.
///
/// Searches clone the current `Arc<IndexSnapshot>` and run without holding
/// the lock, so installing a new generation never blocks on or disturbs
/// in-flight queries.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            current: RwLock::new(None),
        }
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Swaps in `snapshot` after checking it was built by this embedder.
    pub fn install(&self, snapshot: IndexSnapshot) -> Result<Arc<IndexSnapshot>> {
        let manifest = snapshot.manifest();
        if manifest.dimension != self.embedder.dimension() {
            return Err(RetrievalError::DimensionMismatch {
                expected: manifest.dimension,
                actual: self.embedder.dimension(),
            });
        }
        if manifest.model_id != self.embedder.model_id() {
            return Err(RetrievalError::ModelMismatch {
                index_model: manifest.model_id.clone(),
                embedder_model: self.embedder.model_id().to_string(),
            });
        }

        let snapshot = Arc::new(snapshot);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::clone(&snapshot));
        info!("Serving index generation {}", snapshot.generation());
        Ok(snapshot)
    }

    /// Loads the store's current generation. The previously installed
    /// generation keeps serving if loading or validation fails.
    pub fn load_from(&self, store: &dyn IndexStore) -> Result<Arc<IndexSnapshot>> {
        let snapshot = store.load()?;
        self.install(snapshot)
    }

    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RetrievalError::IndexNotLoaded)
    }

    pub fn generation(&self) -> Option<String> {
        self.snapshot().ok().map(|s| s.generation().to_string())
    }

    pub fn search(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let snapshot = self.snapshot()?;
        search(query, k, self.embedder.as_ref(), &snapshot)
    }
}
