use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::MIN_KEEP_GENERATIONS;
use crate::error::{Result, RetrievalError};
use crate::index::{Metric, VectorIndex};
use crate::record::RecordStore;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.bin";
const RECORDS_FILE: &str = "records.bin";
const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";

/// Describes one persisted index generation. The checksums tie the vector
/// file and the record store together so neither can be swapped alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: String,
    pub model_id: String,
    pub metric: Metric,
    pub dimension: usize,
    pub record_count: usize,
    pub vectors_sha256: String,
    pub records_sha256: String,
    pub created_at_ms: u64,
}

/// A validated, immutable index generation ready to be searched.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    manifest: Manifest,
    index: VectorIndex,
    records: RecordStore,
}

impl IndexSnapshot {
    pub fn new(manifest: Manifest, index: VectorIndex, records: RecordStore) -> Result<Self> {
        if index.len() != records.len() {
            return Err(RetrievalError::corrupt(
                &manifest.generation,
                format!("{} vectors but {} records", index.len(), records.len()),
            ));
        }
        if manifest.record_count != records.len() {
            return Err(RetrievalError::corrupt(
                &manifest.generation,
                format!(
                    "manifest lists {} records, artifacts hold {}",
                    manifest.record_count,
                    records.len()
                ),
            ));
        }
        if manifest.dimension != index.dimension() {
            return Err(RetrievalError::corrupt(
                &manifest.generation,
                format!(
                    "manifest dimension {} disagrees with vector dimension {}",
                    manifest.dimension,
                    index.dimension()
                ),
            ));
        }
        if manifest.metric != index.metric() {
            return Err(RetrievalError::corrupt(
                &manifest.generation,
                format!(
                    "manifest metric {} disagrees with vector metric {}",
                    manifest.metric,
                    index.metric()
                ),
            ));
        }
        Ok(Self {
            manifest,
            index,
            records,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn generation(&self) -> &str {
        &self.manifest.generation
    }
}

/// Persistence backend for index generations.
pub trait IndexStore: Send + Sync {
    /// Persists a new generation and makes it current. Either the whole
    /// generation becomes visible or the previous one stays current.
    fn save(&self, index: &VectorIndex, records: &RecordStore, model_id: &str) -> Result<Manifest>;

    /// Loads and validates the current generation.
    fn load(&self) -> Result<IndexSnapshot>;
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// Directory-backed store. Each generation lives in its own `gen-*`
/// directory; the `CURRENT` file names the live one.
///
/// ```text
/// <root>/CURRENT
/// <root>/gen-00000001718000000000/{manifest.json,vectors.bin,records.bin}
/// ```
#[derive(Debug, Clone)]
pub struct FileIndexStore {
    root: PathBuf,
    keep_generations: usize,
}

impl FileIndexStore {
    pub fn new(root: impl Into<PathBuf>, keep_generations: usize) -> Self {
        Self {
            root: root.into(),
            keep_generations: keep_generations.max(MIN_KEEP_GENERATIONS),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the current generation, if one has been published.
    pub fn current_generation(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.root.join(CURRENT_FILE)) {
            Ok(contents) => {
                let name = contents.trim().to_string();
                if !is_generation_name(&name) {
                    return Err(RetrievalError::corrupt(
                        CURRENT_FILE,
                        format!("'{}' is not a generation name", name),
                    ));
                }
                Ok(Some(name))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Generation directories on disk, oldest first.
    pub fn generations(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_generation_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Generation names sort in publish order, so a new name is always past
    /// the newest one on disk even if the clock stepped back.
    fn next_generation(&self) -> Result<String> {
        let newest = self
            .generations()?
            .last()
            .and_then(|name| name[GENERATION_PREFIX.len()..].parse::<u64>().ok())
            .map(|stamp| stamp.saturating_add(1))
            .unwrap_or(0);
        let mut stamp = (now_ms() * 1_000).max(newest);
        loop {
            let name = format!("{}{:020}", GENERATION_PREFIX, stamp);
            let taken = self.root.join(&name).exists()
                || self.root.join(format!("{}{}", STAGING_PREFIX, name)).exists();
            if !taken {
                return Ok(name);
            }
            stamp += 1;
        }
    }

    fn write_generation(
        &self,
        dir: &Path,
        index: &VectorIndex,
        records: &RecordStore,
        manifest: &mut Manifest,
    ) -> Result<()> {
        fs::create_dir_all(dir)?;

        let vector_bytes = index.to_bytes();
        let record_bytes = records.to_bytes()?;
        manifest.vectors_sha256 = sha256_hex(&vector_bytes);
        manifest.records_sha256 = sha256_hex(&record_bytes);

        write_synced(&dir.join(VECTORS_FILE), &vector_bytes)?;
        write_synced(&dir.join(RECORDS_FILE), &record_bytes)?;
        write_synced(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(manifest)?)?;
        sync_dir(dir)
    }

    fn publish(&self, generation: &str) -> Result<()> {
        let tmp = self.root.join(format!("{}.tmp", CURRENT_FILE));
        write_synced(&tmp, format!("{}\n", generation).as_bytes())?;
        fs::rename(&tmp, self.root.join(CURRENT_FILE))?;
        sync_dir(&self.root)
    }

    fn prune(&self, current: &str) -> Result<()> {
        let generations = self.generations()?;
        let excess = generations.len().saturating_sub(self.keep_generations);
        for name in generations.iter().take(excess).filter(|name| name.as_str() != current) {
            debug!("Removing old generation {}", name);
            fs::remove_dir_all(self.root.join(name))?;
        }
        Ok(())
    }

    fn read_verified(&self, dir: &Path, file: &str, expected_sha256: &str) -> Result<Vec<u8>> {
        let bytes = fs::read(dir.join(file)).map_err(|e| artifact_io_error(e, file))?;
        if sha256_hex(&bytes) != expected_sha256 {
            return Err(RetrievalError::corrupt(file, "checksum does not match manifest"));
        }
        Ok(bytes)
    }
}

/// A published generation missing one of its files is corrupt, not absent.
fn artifact_io_error(error: std::io::Error, file: &str) -> RetrievalError {
    if error.kind() == ErrorKind::NotFound {
        RetrievalError::corrupt(file, "missing from published generation")
    } else {
        error.into()
    }
}

fn is_generation_name(name: &str) -> bool {
    name.strip_prefix(GENERATION_PREFIX)
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

impl IndexStore for FileIndexStore {
    fn save(&self, index: &VectorIndex, records: &RecordStore, model_id: &str) -> Result<Manifest> {
        if index.len() != records.len() {
            return Err(RetrievalError::corrupt(
                "build",
                format!("{} vectors but {} records", index.len(), records.len()),
            ));
        }
        fs::create_dir_all(&self.root)?;

        let generation = self.next_generation()?;
        let staging = self.root.join(format!("{}{}", STAGING_PREFIX, generation));
        let mut manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            generation: generation.clone(),
            model_id: model_id.to_string(),
            metric: index.metric(),
            dimension: index.dimension(),
            record_count: records.len(),
            vectors_sha256: String::new(),
            records_sha256: String::new(),
            created_at_ms: now_ms(),
        };

        let written = self
            .write_generation(&staging, index, records, &mut manifest)
            .and_then(|_| Ok(fs::rename(&staging, self.root.join(&generation))?));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove staging directory {}: {}", staging.display(), cleanup);
                }
            }
            return Err(e);
        }

        self.publish(&generation)?;
        info!(
            "Published index generation {} ({} records, dimension {})",
            generation,
            records.len(),
            index.dimension()
        );

        if let Err(e) = self.prune(&generation) {
            warn!("Failed to prune old generations: {}", e);
        }
        Ok(manifest)
    }

    fn load(&self) -> Result<IndexSnapshot> {
        let generation = self
            .current_generation()?
            .ok_or_else(|| RetrievalError::ArtifactsMissing(self.root.clone()))?;
        let dir = self.root.join(&generation);
        debug!("Loading index generation from {}", dir.display());

        let manifest_bytes =
            fs::read(dir.join(MANIFEST_FILE)).map_err(|e| artifact_io_error(e, MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| RetrievalError::corrupt(MANIFEST_FILE, e.to_string()))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(RetrievalError::corrupt(
                MANIFEST_FILE,
                format!("unsupported format version {}", manifest.format_version),
            ));
        }
        if manifest.generation != generation {
            return Err(RetrievalError::corrupt(
                MANIFEST_FILE,
                format!("describes {} but lives in {}", manifest.generation, generation),
            ));
        }

        let vectors_file =
            File::open(dir.join(VECTORS_FILE)).map_err(|e| artifact_io_error(e, VECTORS_FILE))?;
        let mmap = unsafe { Mmap::map(&vectors_file)? };
        if sha256_hex(&mmap) != manifest.vectors_sha256 {
            return Err(RetrievalError::corrupt(VECTORS_FILE, "checksum does not match manifest"));
        }
        let index = VectorIndex::from_bytes(&mmap)?;

        let record_bytes = self.read_verified(&dir, RECORDS_FILE, &manifest.records_sha256)?;
        let records = RecordStore::from_bytes(&record_bytes)?;

        let snapshot = IndexSnapshot::new(manifest, index, records)?;
        info!(
            "Loaded index generation {} ({} records)",
            snapshot.generation(),
            snapshot.records().len()
        );
        Ok(snapshot)
    }
}

const MEMORY_STORE_ROOT: &str = "<memory>";

/// In-process store, mostly useful for tests and embedding the retriever in
/// a host that manages its own persistence.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    counter: u64,
    current: Option<IndexSnapshot>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryIndexStore {
    fn save(&self, index: &VectorIndex, records: &RecordStore, model_id: &str) -> Result<Manifest> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = format!("{}{:020}", GENERATION_PREFIX, state.counter + 1);
        let manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            generation,
            model_id: model_id.to_string(),
            metric: index.metric(),
            dimension: index.dimension(),
            record_count: records.len(),
            vectors_sha256: sha256_hex(&index.to_bytes()),
            records_sha256: sha256_hex(&records.to_bytes()?),
            created_at_ms: now_ms(),
        };
        let snapshot = IndexSnapshot::new(manifest.clone(), index.clone(), records.clone())?;
        state.counter += 1;
        state.current = Some(snapshot);
        Ok(manifest)
    }

    fn load(&self) -> Result<IndexSnapshot> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .current
            .clone()
            .ok_or_else(|| RetrievalError::ArtifactsMissing(PathBuf::from(MEMORY_STORE_ROOT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CorpusRecord;
    use tempfile::TempDir;

    fn sample() -> (VectorIndex, RecordStore) {
        let index = VectorIndex::from_vectors(
            2,
            Metric::L2,
            vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        )
        .unwrap();
        let records = RecordStore::from(vec![
            CorpusRecord::new(1, "reset password", "click forgot password"),
            CorpusRecord::new(2, "update billing info", "go to billing page"),
        ]);
        (index, records)
    }

    #[test]
    fn save_then_load_returns_same_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path(), 2);
        let (index, records) = sample();

        let manifest = store.save(&index, &records, "test-model").unwrap();
        let snapshot = store.load().unwrap();

        assert_eq!(snapshot.manifest(), &manifest);
        assert_eq!(snapshot.index(), &index);
        assert_eq!(snapshot.records(), &records);
        assert_eq!(store.current_generation().unwrap(), Some(manifest.generation));
    }

    #[test]
    fn missing_artifacts_are_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path().join("nothing-here"), 2);
        assert!(matches!(store.load(), Err(RetrievalError::ArtifactsMissing(_))));
    }

    #[test]
    fn tampered_records_fail_checksum() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path(), 2);
        let (index, records) = sample();
        let manifest = store.save(&index, &records, "test-model").unwrap();

        let other = RecordStore::from(vec![
            CorpusRecord::new(9, "something else", ""),
            CorpusRecord::new(10, "another", ""),
        ]);
        fs::write(
            dir.path().join(&manifest.generation).join(RECORDS_FILE),
            other.to_bytes().unwrap(),
        )
        .unwrap();

        assert!(matches!(store.load(), Err(RetrievalError::CorruptArtifact { .. })));
    }

    #[test]
    fn prunes_beyond_keep_count() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path(), 2);
        let (index, records) = sample();

        let first = store.save(&index, &records, "m").unwrap();
        let second = store.save(&index, &records, "m").unwrap();
        let third = store.save(&index, &records, "m").unwrap();

        let generations = store.generations().unwrap();
        assert_eq!(generations, vec![second.generation, third.generation.clone()]);
        assert!(!dir.path().join(first.generation).exists());
        assert_eq!(store.load().unwrap().generation(), third.generation);
    }

    #[test]
    fn keeps_at_least_two_generations() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path(), 1);
        let (index, records) = sample();

        store.save(&index, &records, "m").unwrap();
        let second = store.save(&index, &records, "m").unwrap();
        let third = store.save(&index, &records, "m").unwrap();

        assert_eq!(store.generations().unwrap(), vec![second.generation, third.generation]);
    }

    #[test]
    fn missing_generation_files_are_corrupt() {
        for file in [VECTORS_FILE, RECORDS_FILE, MANIFEST_FILE] {
            let dir = TempDir::new().unwrap();
            let store = FileIndexStore::new(dir.path(), 2);
            let (index, records) = sample();
            let manifest = store.save(&index, &records, "m").unwrap();

            fs::remove_file(dir.path().join(&manifest.generation).join(file)).unwrap();
            match store.load() {
                Err(RetrievalError::CorruptArtifact { artifact, .. }) => assert_eq!(artifact, file),
                other => panic!("unexpected result for {}: {:?}", file, other.map(|s| s.generation().to_string())),
            }
        }
    }

    #[test]
    fn mismatched_lengths_are_refused_before_writing() {
        let dir = TempDir::new().unwrap();
        let store = FileIndexStore::new(dir.path(), 2);
        let (index, _) = sample();
        let records = RecordStore::from(vec![CorpusRecord::new(1, "only one", "")]);

        assert!(store.save(&index, &records, "m").is_err());
        assert!(store.generations().unwrap().is_empty());
        assert_eq!(store.current_generation().unwrap(), None);
    }

    #[test]
    fn snapshot_rejects_misaligned_parts() {
        let (index, records) = sample();
        let manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            generation: "gen-1".into(),
            model_id: "m".into(),
            metric: Metric::L2,
            dimension: 2,
            record_count: 3,
            vectors_sha256: String::new(),
            records_sha256: String::new(),
            created_at_ms: 0,
        };
        assert!(IndexSnapshot::new(manifest.clone(), index.clone(), records.clone()).is_err());

        let manifest = Manifest {
            record_count: 2,
            metric: Metric::Cosine,
            ..manifest
        };
        assert!(IndexSnapshot::new(manifest, index, records).is_err());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryIndexStore::new();
        assert!(matches!(store.load(), Err(RetrievalError::ArtifactsMissing(_))));
        let (index, records) = sample();
        let first = store.save(&index, &records, "m").unwrap();
        let second = store.save(&index, &records, "m").unwrap();
        assert_ne!(first.generation, second.generation);
        assert_eq!(store.load().unwrap().generation(), second.generation);
    }
}
