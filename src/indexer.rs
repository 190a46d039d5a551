use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Number;
use crate::embedder::{embed_text, Embedder};
use crate::error::{Result, RetrievalError};
use crate::index::{Metric, VectorIndex};
use crate::record::{CorpusRecord, RecordStore};
use crate::store::{IndexStore, Manifest};

/// Summary of a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub record_count: usize,
    pub dimension: usize,
    /// Ids of records indexed with an empty solution.
    pub empty_solutions: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct BuiltIndex {
    pub index: VectorIndex,
    pub records: RecordStore,
    pub report: BuildReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexOutcome {
    pub manifest: Manifest,
    pub report: BuildReport,
}

fn validate_corpus(corpus: &[CorpusRecord]) -> Result<Vec<u64>> {
    if corpus.is_empty() {
        return Err(RetrievalError::EmptyCorpus);
    }

    let mut empty_solutions = Vec::new();
    for record in corpus {
        if record.query.trim().is_empty() {
            return Err(RetrievalError::InvalidRecord {
                id: record.id,
                reason: "query text is empty".into(),
            });
        }
        if record.solution.trim().is_empty() {
            warn!("Record {} has an empty solution", record.id);
            empty_solutions.push(record.id);
        }
    }
    Ok(empty_solutions)
}

fn embed_record(embedder: &dyn Embedder, record: &CorpusRecord, dimension: usize) -> Result<Vec<Number>> {
    let subject = format!("record {}", record.id);
    let vector = embed_text(embedder, &record.query, &subject)?;
    if vector.len() != dimension {
        return Err(RetrievalError::EmbeddingFailure {
            subject,
            reason: format!("expected {} dimensions, got {}", dimension, vector.len()),
        });
    }
    Ok(vector)
}

/// Embeds every record's query text and lines the vectors up with the
/// records. Nothing is returned unless every record embedded cleanly.
pub fn build_index(corpus: Vec<CorpusRecord>, embedder: &dyn Embedder, metric: Metric) -> Result<BuiltIndex> {
    let empty_solutions = validate_corpus(&corpus)?;
    let dimension = embedder.dimension();
    if dimension == 0 {
        return Err(RetrievalError::EmbeddingFailure {
            subject: embedder.model_id().to_string(),
            reason: "embedder reports zero dimensions".into(),
        });
    }

    let start = Instant::now();
    let vectors = corpus
        .par_iter()
        .map(|record| embed_record(embedder, record, dimension))
        .collect::<Result<Vec<_>>>()?;
    debug!(
        "Embedded {} records with '{}' in {:?}",
        vectors.len(),
        embedder.model_id(),
        start.elapsed()
    );

    let index = VectorIndex::from_vectors(dimension, metric, vectors)?;
    let records = RecordStore::from(corpus);
    let report = BuildReport {
        record_count: records.len(),
        dimension,
        empty_solutions,
    };

    Ok(BuiltIndex {
        index,
        records,
        report,
    })
}

/// Full rebuild: builds a fresh index and publishes it as a new generation.
pub fn reindex(
    corpus: Vec<CorpusRecord>,
    embedder: &dyn Embedder,
    store: &dyn IndexStore,
    metric: Metric,
) -> Result<ReindexOutcome> {
    let built = build_index(corpus, embedder, metric)?;
    let manifest = store.save(&built.index, &built.records, embedder.model_id())?;
    info!(
        "Reindexed {} records into generation {}",
        built.report.record_count, manifest.generation
    );
    Ok(ReindexOutcome {
        manifest,
        report: built.report,
    })
}
