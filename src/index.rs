use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::mem::size_of;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::config::Number;
use crate::error::{Result, RetrievalError};
use crate::vector_ops::{cosine_distance_simd, squared_l2_distance_simd};

const MAGIC: &[u8; 4] = b"RGVX";
const FORMAT_VERSION: u32 = 1;
// magic + version + metric + padding + dimension + count
const HEADER_SIZE: usize = 4 + 4 + 1 + 3 + 4 + 8;

/// Distance used for nearest-neighbour ranking. Lower is closer for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// `1 - cosine_similarity`.
    Cosine,
}

#[derive(Debug, Error)]
#[error("unknown metric '{0}' (expected 'l2' or 'cosine')")]
pub struct UnknownMetric(pub String);

impl Metric {
    pub fn distance(self, a: &[Number], b: &[Number]) -> Number {
        match self {
            Metric::L2 => squared_l2_distance_simd(a, b),
            Metric::Cosine => cosine_distance_simd(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
        }
    }

    fn tag(self) -> u8 {
        match self {
            Metric::L2 => 0,
            Metric::Cosine => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::L2),
            1 => Some(Metric::Cosine),
            _ => None,
        }
    }
}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            other => Err(UnknownMetric(other.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat, row-major vector storage searched by exhaustive scan.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    metric: Metric,
    data: Vec<Number>,
}

impl VectorIndex {
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            data: Vec::new(),
        }
    }

    pub fn from_vectors(dimension: usize, metric: Metric, vectors: Vec<Vec<Number>>) -> Result<Self> {
        let mut index = Self::new(dimension, metric);
        index.data.reserve(vectors.len() * dimension);
        for vector in &vectors {
            index.push(vector)?;
        }
        Ok(index)
    }

    pub fn push(&mut self, vector: &[Number]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vector(&self, position: usize) -> Option<&[Number]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Returns up to `k` `(position, distance)` pairs, closest first.
    /// Equal distances keep insertion order.
    pub fn nearest(&self, query: &[Number], k: usize) -> Result<Vec<(usize, Number)>> {
        if k == 0 {
            return Err(RetrievalError::InvalidQuery("k must be at least 1".into()));
        }
        if query.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let metric = self.metric;
        let mut scored: Vec<(usize, Number)> = self
            .data
            .par_chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, vector)| (position, metric.distance(query, vector)))
            .collect();

        let by_distance_then_position =
            |a: &(usize, Number), b: &(usize, Number)| -> Ordering { a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)) };

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance_then_position);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance_then_position);

        debug!(
            "Scanned {} vectors with {} metric, kept {}",
            self.len(),
            metric,
            scored.len()
        );
        Ok(scored)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.data.len() * size_of::<Number>());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.push(self.metric.tag());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend(self.data.iter().flat_map(|&num| num.to_le_bytes()));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| RetrievalError::corrupt("vectors", reason);

        if bytes.len() < HEADER_SIZE {
            return Err(corrupt(format!("file is {} bytes, shorter than its header", bytes.len())));
        }
        if &bytes[0..4] != MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let metric = Metric::from_tag(bytes[8]).ok_or_else(|| corrupt(format!("unknown metric tag {}", bytes[8])))?;
        let dimension = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[16..24]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        if dimension == 0 {
            return Err(corrupt("dimension is zero".into()));
        }
        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(size_of::<Number>()))
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or_else(|| corrupt("header sizes overflow".into()))?;
        if bytes.len() != expected {
            return Err(corrupt(format!(
                "expected {} bytes for {} vectors of dimension {}, found {}",
                expected,
                count,
                dimension,
                bytes.len()
            )));
        }

        let data = bytes[HEADER_SIZE..]
            .chunks_exact(size_of::<Number>())
            .map(|b| Number::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            dimension,
            metric,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(vectors: &[[Number; 3]], metric: Metric) -> VectorIndex {
        VectorIndex::from_vectors(3, metric, vectors.iter().map(|v| v.to_vec()).collect()).unwrap()
    }

    #[test]
    fn nearest_orders_by_distance() {
        let index = index_of(&[[10.0, 0.0, 0.0], [1.0, 0.0, 0.0], [3.0, 0.0, 0.0]], Metric::L2);
        let hits = index.nearest(&[0.0, 0.0, 0.0], 3).unwrap();
        let positions: Vec<usize> = hits.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![1, 2, 0]);
        assert_eq!(hits[0].1, 1.0);
        assert_eq!(hits[1].1, 9.0);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = index_of(
            &[[5.0, 5.0, 5.0], [1.0, 2.0, 3.0], [9.0, 9.0, 9.0], [1.0, 2.0, 3.0], [1.0, 2.0, 3.0]],
            Metric::L2,
        );
        let hits = index.nearest(&[1.0, 2.0, 3.0], 2).unwrap();
        assert_eq!(hits, vec![(1, 0.0), (3, 0.0)]);
        let hits = index.nearest(&[1.0, 2.0, 3.0], 5).unwrap();
        let positions: Vec<usize> = hits.iter().map(|(p, _)| *p).collect();
        assert_eq!(positions, vec![1, 3, 4, 0, 2]);
    }

    #[test]
    fn returns_at_most_len_results() {
        let index = index_of(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]], Metric::Cosine);
        assert_eq!(index.nearest(&[1.0, 1.0, 0.0], 5).unwrap().len(), 2);
        assert_eq!(index.nearest(&[1.0, 1.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn empty_index_yields_no_results() {
        let index = VectorIndex::new(3, Metric::L2);
        assert!(index.nearest(&[0.0, 0.0, 0.0], 4).unwrap().is_empty());
    }

    #[test]
    fn rejects_zero_k_and_wrong_dimension() {
        let index = index_of(&[[1.0, 0.0, 0.0]], Metric::L2);
        assert!(matches!(index.nearest(&[0.0, 0.0, 0.0], 0), Err(RetrievalError::InvalidQuery(_))));
        assert!(matches!(
            index.nearest(&[0.0, 0.0], 1),
            Err(RetrievalError::DimensionMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn push_rejects_wrong_dimension() {
        let mut index = VectorIndex::new(3, Metric::L2);
        assert!(index.push(&[1.0, 2.0, 3.0]).is_ok());
        assert!(index.push(&[1.0, 2.0]).is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn file_format_round_trip_and_truncation() {
        let index = index_of(&[[1.0, -2.0, 0.5], [0.25, 8.0, -1.0]], Metric::Cosine);
        let bytes = index.to_bytes();
        assert_eq!(VectorIndex::from_bytes(&bytes).unwrap(), index);

        let truncated = &bytes[..bytes.len() - 4];
        assert!(matches!(
            VectorIndex::from_bytes(truncated),
            Err(RetrievalError::CorruptArtifact { .. })
        ));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(VectorIndex::from_bytes(&bad_magic).is_err());
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("L2".parse::<Metric>().unwrap(), Metric::L2);
        assert_eq!(" cosine ".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!("dot".parse::<Metric>().is_err());
    }
}
