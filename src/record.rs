use crate::config::Number;
use crate::error::{Result, RetrievalError};
use serde::{Deserialize, Serialize};

/// One query/solution pair from the knowledge corpus.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CorpusRecord {
    pub id: u64,
    pub query: String,
    pub solution: String,
}

impl CorpusRecord {
    pub fn new(id: u64, query: impl Into<String>, solution: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            solution: solution.into(),
        }
    }
}

/// Records in index order; position `i` pairs with vector `i`.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct RecordStore {
    records: Vec<CorpusRecord>,
}

impl RecordStore {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&CorpusRecord> {
        self.records.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CorpusRecord> {
        self.records.iter()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| RetrievalError::corrupt("records", format!("undecodable record store: {}", e)))
    }
}

impl From<Vec<CorpusRecord>> for RecordStore {
    fn from(records: Vec<CorpusRecord>) -> Self {
        Self { records }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SearchResult {
    pub record: CorpusRecord,
    pub distance: Number,
}
