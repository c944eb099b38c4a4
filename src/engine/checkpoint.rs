//! Write-once checkpoint stores for intermediate relations
//!
//! Every intermediate relation of a run is written exactly once under a
//! unique name and only read afterwards. A second write to the same name is
//! rejected, which turns accidental overwrites between levels or partitions
//! into errors instead of silently wrong counts.
//!
//! Names are grouped by [`CheckpointNamespace`]. A namespace is cleared as a
//! whole, which is how a minute is rerun from scratch and how its
//! intermediates are released once its counts are built.
//!
//! # Naming
//!
//! | Relation                        | Name                              |
//! |---------------------------------|-----------------------------------|
//! | filtered output of `q` at `l`   | `{prefix}/filter_out_{q}_{l}`     |
//! | partition `p` of `q` at `l`     | `{prefix}/transit_{q}_{l}_{p}`    |

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CheckpointError;
use crate::relation::Relation;
use crate::types::{Level, MinuteBucket, QueryId, StageId};

/// Storage for named, write-once relations
pub trait CheckpointStore: Send + Sync {
    /// Persist `relation` under `name`
    ///
    /// Fails with [`CheckpointError::AlreadyExists`] if the name was written before.
    fn write(&self, name: &str, relation: Relation) -> Result<(), CheckpointError>;

    /// Read the relation written under `name`
    fn read(&self, name: &str) -> Result<Arc<Relation>, CheckpointError>;

    /// Whether `name` was written
    fn contains(&self, name: &str) -> bool;

    /// Drop every relation under `namespace`, returning how many were removed
    fn clear(&self, namespace: &CheckpointNamespace) -> Result<usize, CheckpointError>;
}

/// Checkpoint names scoped to one minute of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointNamespace {
    prefix: String,
}

impl CheckpointNamespace {
    /// Namespace for a minute bucket
    pub fn for_minute(minute: MinuteBucket) -> Self {
        Self {
            prefix: format!("m{}", minute),
        }
    }

    /// Namespace with an explicit prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix shared by every name in the namespace
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Filtered output of `query` at `level`
    pub fn filter_output(&self, query: QueryId, level: Level) -> String {
        format!("{}/filter_out_{}_{}", self.prefix, query, level)
    }

    /// Partition `stage` of `query` at `level`
    pub fn transit_output(&self, query: QueryId, level: Level, stage: StageId) -> String {
        format!("{}/transit_{}_{}_{}", self.prefix, query, level, stage)
    }
}

fn validate_name(name: &str) -> Result<(), CheckpointError> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && name.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidName(name.to_string()))
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Checkpoint store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    relations: RwLock<HashMap<String, Arc<Relation>>>,
}

impl MemoryCheckpointStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored relations
    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    /// Whether nothing was written yet
    pub fn is_empty(&self) -> bool {
        self.relations.read().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write(&self, name: &str, relation: Relation) -> Result<(), CheckpointError> {
        validate_name(name)?;
        let mut relations = self.relations.write();
        if relations.contains_key(name) {
            return Err(CheckpointError::AlreadyExists(name.to_string()));
        }
        relations.insert(name.to_string(), Arc::new(relation));
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Arc<Relation>, CheckpointError> {
        self.relations
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.relations.read().contains_key(name)
    }

    fn clear(&self, namespace: &CheckpointNamespace) -> Result<usize, CheckpointError> {
        validate_name(namespace.prefix())?;
        let scope = format!("{}/", namespace.prefix());
        let mut relations = self.relations.write();
        let before = relations.len();
        relations.retain(|name, _| !name.starts_with(&scope));
        Ok(before - relations.len())
    }
}

// ============================================================================
// On-disk store
// ============================================================================

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Checkpoint store writing one bincode file per relation
///
/// Writes go to a unique temporary file which is then hard-linked into
/// place; linking fails if the target exists, so concurrent writers of the
/// same name cannot both succeed.
#[derive(Debug)]
pub struct DiskCheckpointStore {
    root: PathBuf,
}

impl DiskCheckpointStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.bin", name))
    }
}

impl CheckpointStore for DiskCheckpointStore {
    fn write(&self, name: &str, relation: Relation) -> Result<(), CheckpointError> {
        validate_name(name)?;
        let path = self.path_of(name);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists(name.to_string()));
        }
        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&dir)?;

        let bytes = bincode::serialize(&relation)?;
        let temp_path = dir.join(format!(
            ".checkpoint.{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp_path, bytes)?;

        let link_result = fs::hard_link(&temp_path, &path);
        // Temp file is never needed past this point (best effort)
        let _ = fs::remove_file(&temp_path);

        match link_result {
            Ok(()) => {
                tracing::trace!(checkpoint = name, rows = relation.len(), "Wrote checkpoint");
                Ok(())
            },
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(CheckpointError::AlreadyExists(name.to_string()))
            },
            Err(e) => Err(e.into()),
        }
    }

    fn read(&self, name: &str) -> Result<Arc<Relation>, CheckpointError> {
        validate_name(name)?;
        let bytes = match fs::read(self.path_of(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(name.to_string()));
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Arc::new(bincode::deserialize(&bytes)?))
    }

    fn contains(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path_of(name).exists()
    }

    fn clear(&self, namespace: &CheckpointNamespace) -> Result<usize, CheckpointError> {
        validate_name(namespace.prefix())?;
        let dir = self.root.join(namespace.prefix());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "bin") {
                removed += 1;
            }
        }
        fs::remove_dir_all(&dir)?;
        tracing::trace!(namespace = namespace.prefix(), removed, "Cleared checkpoints");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::packet;
    use crate::packet::Field;
    use crate::relation::MapValue;
    use tempfile::TempDir;

    fn sample() -> Relation {
        let packets = vec![
            packet(1, [10, 0, 0, 1], [10, 0, 0, 2], 53, 17),
            packet(2, [10, 0, 0, 1], [10, 0, 0, 3], 53, 17),
        ];
        Relation::from_packets(&packets)
            .project(&[Field::DstIp], MapValue::One, Some(Field::DstIp), 24)
            .unwrap()
    }

    fn write_once<S: CheckpointStore>(store: &S) {
        let ns = CheckpointNamespace::for_minute(3);
        let name = ns.filter_output(1, 24);
        assert_eq!(name, "m3/filter_out_1_24");

        assert!(!store.contains(&name));
        store.write(&name, sample()).unwrap();
        assert!(store.contains(&name));
        assert_eq!(*store.read(&name).unwrap(), sample());

        let err = store.write(&name, sample()).unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyExists(_)));

        let missing = ns.transit_output(1, 24, 2);
        assert!(matches!(store.read(&missing), Err(CheckpointError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_write_once() {
        let store = MemoryCheckpointStore::new();
        write_once(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_disk_store_write_once() {
        let dir = TempDir::new().unwrap();
        let store = DiskCheckpointStore::open(dir.path()).unwrap();
        write_once(&store);
        assert!(dir.path().join("m3/filter_out_1_24.bin").exists());
    }

    fn clear_namespace<S: CheckpointStore>(store: &S) {
        let minute = CheckpointNamespace::for_minute(3);
        let other = CheckpointNamespace::for_minute(30);
        store.write(&minute.filter_output(1, 24), sample()).unwrap();
        store.write(&minute.transit_output(1, 24, 2), sample()).unwrap();
        store.write(&other.filter_output(1, 24), sample()).unwrap();

        assert_eq!(store.clear(&minute).unwrap(), 2);
        assert!(!store.contains(&minute.filter_output(1, 24)));
        assert!(store.contains(&other.filter_output(1, 24)));
        assert_eq!(store.clear(&minute).unwrap(), 0);

        // Names are free again
        store.write(&minute.filter_output(1, 24), sample()).unwrap();
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryCheckpointStore::new();
        clear_namespace(&store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_disk_store_clear() {
        let dir = TempDir::new().unwrap();
        let store = DiskCheckpointStore::open(dir.path()).unwrap();
        clear_namespace(&store);
        assert!(dir.path().join("m30/filter_out_1_24.bin").exists());
        assert!(store.clear(&CheckpointNamespace::new("../escape")).is_err());
    }

    #[test]
    fn test_invalid_names() {
        let store = MemoryCheckpointStore::new();
        for name in ["", "/abs", "a/../b", "a//b", "sp ace"] {
            let err = store.write(name, sample()).unwrap_err();
            assert!(matches!(err, CheckpointError::InvalidName(_)));
        }
    }
}
