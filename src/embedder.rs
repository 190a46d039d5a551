use anyhow::Result as AnyResult;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::config::{EmbedderKind, Number, State};
use crate::error::{Result, RetrievalError};
use crate::ollama::OllamaEmbedder;
use crate::vector_ops::{all_finite, normalize_vector};

/// Text-to-vector model shared by index builds and queries.
///
/// `model_id` is persisted with every index generation; an index is only
/// served to an embedder reporting the same id.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> AnyResult<Vec<Number>>;
}

/// Embeds `text`, turning provider errors and non-finite output into
/// `EmbeddingFailure`. Dimension checks are left to the caller.
pub fn embed_text(embedder: &dyn Embedder, text: &str, subject: &str) -> Result<Vec<Number>> {
    let vector = embedder
        .embed(text)
        .map_err(|e| RetrievalError::EmbeddingFailure {
            subject: subject.to_string(),
            reason: format!("{:#}", e),
        })?;
    if !all_finite(&vector) {
        return Err(RetrievalError::EmbeddingFailure {
            subject: subject.to_string(),
            reason: "embedding contains NaN or infinite values".into(),
        });
    }
    Ok(vector)
}

/// Offline feature-hashing embedder.
///
/// Lowercased word unigrams and bigrams are hashed with SHA-256 into
/// `dimension` signed buckets and the result is L2-normalised, so equal text
/// always yields bit-identical vectors. Text without any word characters is
/// hashed as a single feature.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("hashing-v1-d{}", dimension),
        }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    fn accumulate(&self, feature: &str, weight: Number, vector: &mut [Number]) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> AnyResult<Vec<Number>> {
        anyhow::ensure!(self.dimension > 0, "hashing embedder has zero dimension");

        let tokens = Self::tokens(text);
        let mut vector = vec![0.0; self.dimension];
        // Symbol-only text has no word tokens; hash it whole so it still has a direction.
        let raw = text.trim();
        if tokens.is_empty() && !raw.is_empty() {
            self.accumulate(raw, 1.0, &mut vector);
        }
        for token in &tokens {
            self.accumulate(token, 1.0, &mut vector);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&format!("{} {}", pair[0], pair[1]), 0.5, &mut vector);
        }
        normalize_vector(&mut vector);
        Ok(vector)
    }
}

/// Builds the embedder selected by the configuration.
pub fn from_state(state: &State) -> AnyResult<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match state.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(state.dimensions)),
        EmbedderKind::Ollama => Arc::new(OllamaEmbedder::new(
            &state.ollama_url,
            &state.ollama_model,
            state.dimensions,
        )?),
    };
    debug!(
        "Using embedder '{}' ({} dimensions)",
        embedder.model_id(),
        embedder.dimension()
    );
    Ok(embedder)
}
