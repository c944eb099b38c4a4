//! Raw count artifacts
//!
//! One artifact holds the transit counts of every query instance of one
//! origin for one minute. The origin and minute are carried by the file
//! name only (`transit_{origin}_{minute}.bin`); the file body is the
//! bincode-encoded counts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::transit::TransitCounts;
use crate::types::{MinuteBucket, OriginId};

const NAME_MARKER: &str = "transit_";
const EXTENSION: &str = ".bin";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a temporary file and a rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp_name = format!(
        ".{}.{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact"),
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let temp_path = match path.parent() {
        Some(dir) => dir.join(&temp_name),
        None => PathBuf::from(&temp_name),
    };

    fs::write(&temp_path, bytes)?;
    let rename_result = fs::rename(&temp_path, path);
    if rename_result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    rename_result
}

/// Transit counts of one origin for one minute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCountArtifact {
    /// Origin the counts were produced for
    pub origin: OriginId,
    /// Minute bucket of the trace
    pub minute: MinuteBucket,
    /// Counts per query instance
    pub counts: TransitCounts,
}

impl RawCountArtifact {
    /// Wrap counts
    pub fn new(origin: OriginId, minute: MinuteBucket, counts: TransitCounts) -> Self {
        Self {
            origin,
            minute,
            counts,
        }
    }

    /// File name of the artifact
    pub fn file_name(&self) -> String {
        format!("{}{}_{}{}", NAME_MARKER, self.origin, self.minute, EXTENSION)
    }

    /// Origin and minute encoded in an artifact file name
    ///
    /// The origin is the number right after `transit_`, the minute the number
    /// after the last `_`. Leading path components and prefixes before
    /// `transit_` are allowed.
    pub fn parse_file_name(name: &str) -> Result<(OriginId, MinuteBucket)> {
        let bad = |reason: &str| Error::Artifact(format!("invalid artifact name '{}': {}", name, reason));

        let base = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| bad("not a file name"))?;
        let stem = base
            .strip_suffix(EXTENSION)
            .ok_or_else(|| bad("missing .bin extension"))?;
        let (_, tail) = stem
            .split_once(NAME_MARKER)
            .ok_or_else(|| bad("missing 'transit_' marker"))?;

        let origin = tail
            .split('_')
            .next()
            .and_then(|s| s.parse::<OriginId>().ok())
            .ok_or_else(|| bad("origin is not a number"))?;
        if !tail.contains('_') {
            return Err(bad("missing minute"));
        }
        let minute = stem
            .rsplit('_')
            .next()
            .and_then(|s| s.parse::<MinuteBucket>().ok())
            .ok_or_else(|| bad("minute is not a number"))?;

        Ok((origin, minute))
    }

    /// Write into `dir`, returning the file path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let bytes = bincode::serialize(&self.counts).map_err(|e| Error::Artifact(e.to_string()))?;
        write_atomic(&path, &bytes)?;
        tracing::debug!(path = %path.display(), queries = self.counts.len(), "Wrote raw counts");
        Ok(path)
    }

    /// Read an artifact, taking origin and minute from the file name
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .to_str()
            .ok_or_else(|| Error::Artifact(format!("non UTF-8 path {}", path.display())))?;
        let (origin, minute) = Self::parse_file_name(name)?;
        let bytes = fs::read(path)?;
        let counts = bincode::deserialize(&bytes)
            .map_err(|e| Error::Artifact(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(origin, minute, counts))
    }

    /// Read every `*transit_*.bin` file of `dir`, ordered by minute then origin
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_artifact = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains(NAME_MARKER) && n.ends_with(EXTENSION) && !n.starts_with('.'))
                .unwrap_or(false);
            if path.is_file() && is_artifact {
                artifacts.push(Self::load(&path)?);
            }
        }
        artifacts.sort_by_key(|a| (a.minute, a.origin));
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransitPair;
    use std::collections::BTreeMap;

    fn sample(origin: OriginId, minute: MinuteBucket) -> RawCountArtifact {
        let mut stages = BTreeMap::new();
        stages.insert(0, vec![(1, 100)]);
        stages.insert(2, vec![(1, 40)]);
        let mut transits = BTreeMap::new();
        transits.insert(TransitPair { low: 0, high: 32 }, stages);
        let mut counts = TransitCounts::new();
        counts.insert(origin, transits);
        RawCountArtifact::new(origin, minute, counts)
    }

    #[test]
    fn test_file_name_roundtrip() {
        let artifact = sample(11, 1301);
        assert_eq!(artifact.file_name(), "transit_11_1301.bin");
        assert_eq!(RawCountArtifact::parse_file_name("transit_11_1301.bin").unwrap(), (11, 1301));
        assert_eq!(
            RawCountArtifact::parse_file_name("/data/run_transit_3_7.bin").unwrap(),
            (3, 7)
        );
    }

    #[test]
    fn test_bad_file_names() {
        for name in ["transit_11_1301.pickle", "counts_11_1301.bin", "transit_x_1.bin", "transit_11.bin", "transit_1_y.bin"] {
            let err = RawCountArtifact::parse_file_name(name).unwrap_err();
            assert!(matches!(err, Error::Artifact(_)), "{}", name);
        }
    }

    #[test]
    fn test_save_and_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        sample(2, 1302).save(dir.path()).unwrap();
        sample(1, 1302).save(dir.path()).unwrap();
        sample(5, 1301).save(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = RawCountArtifact::load_dir(dir.path()).unwrap();
        let keys: Vec<(MinuteBucket, OriginId)> = loaded.iter().map(|a| (a.minute, a.origin)).collect();
        assert_eq!(keys, vec![(1301, 5), (1302, 1), (1302, 2)]);
        assert_eq!(loaded[0], sample(5, 1301));
    }
}
