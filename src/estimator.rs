//! End-to-end cost estimation
//!
//! [`CostEstimator`] drives one run: for every minute of traffic it
//! calibrates thresholds and counts transits for each origin group, producing
//! one raw count artifact per origin; the artifacts are then assembled into a
//! [`CostMatrix`] and pruned to the reference levels.
//!
//! Origin groups are independent and run in parallel on the estimator's
//! worker pool. Inside a group, levels are calibrated strictly finest first.
//!
//! A minute always runs from scratch: checkpoints left in its namespace by an
//! earlier run are cleared first, and the namespace is cleared again once the
//! minute's artifacts are built unless checkpoints are kept.

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::calibration::{ThresholdCalibrator, ThresholdTable};
use crate::config::Config;
use crate::cost_matrix::{CostMatrix, CostMatrixAssembler, RawCountArtifact};
use crate::engine::{CheckpointNamespace, CheckpointStore, DiskCheckpointStore, MemoryCheckpointStore};
use crate::error::{Error, Result};
use crate::packet::PacketRecord;
use crate::query::Workload;
use crate::refinement::RefinementHierarchy;
use crate::relation::ParallelConfig;
use crate::transit::TransitCounter;
use crate::types::{Level, MinuteBucket};

/// Result of processing one minute of traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinuteRun {
    /// Minute bucket
    pub minute: MinuteBucket,
    /// One artifact per origin group, ordered by origin
    pub artifacts: Vec<RawCountArtifact>,
    /// Thresholds of every calibrated query
    pub thresholds: ThresholdTable,
}

/// Orchestrates calibration, transit counting and assembly
pub struct CostEstimator {
    workload: Workload,
    calibrator: ThresholdCalibrator,
    counter: TransitCounter,
    store: Arc<dyn CheckpointStore>,
    pool: rayon::ThreadPool,
    reference_levels: Vec<Level>,
    keep_checkpoints: bool,
}

impl std::fmt::Debug for CostEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostEstimator")
            .field("hierarchy", self.calibrator.hierarchy())
            .field("groups", &self.workload.groups().len())
            .field("threads", &self.pool.current_num_threads())
            .field("reference_levels", &self.reference_levels)
            .field("keep_checkpoints", &self.keep_checkpoints)
            .finish()
    }
}

impl CostEstimator {
    /// Estimator with default calibration settings and an in-memory store
    pub fn new(workload: Workload, hierarchy: RefinementHierarchy) -> Result<Self> {
        Ok(Self {
            workload,
            calibrator: ThresholdCalibrator::new(hierarchy.clone()),
            counter: TransitCounter::new(hierarchy),
            store: Arc::new(MemoryCheckpointStore::new()),
            pool: build_pool(0)?,
            reference_levels: Vec::new(),
            keep_checkpoints: false,
        })
    }

    /// Estimator configured from `config`
    pub fn from_config(config: &Config, workload: Workload) -> Result<Self> {
        config.validate()?;
        let hierarchy = config.hierarchy()?;
        let parallel = config.parallel_config();

        let store: Arc<dyn CheckpointStore> = match &config.storage.checkpoint_dir {
            Some(dir) => Arc::new(DiskCheckpointStore::open(dir)?),
            None => Arc::new(MemoryCheckpointStore::new()),
        };

        Ok(Self {
            workload,
            calibrator: ThresholdCalibrator::new(hierarchy.clone())
                .with_estimator(config.estimator())
                .with_percentiles(config.calibration.percentiles.clone())
                .with_parallel(parallel),
            counter: TransitCounter::new(hierarchy).with_parallel(parallel),
            store,
            pool: build_pool(config.performance.worker_threads)?,
            reference_levels: config.refinement.reference_levels.clone(),
            keep_checkpoints: config.storage.keep_checkpoints,
        })
    }

    /// Replace the threshold calibrator
    pub fn with_calibrator(mut self, calibrator: ThresholdCalibrator) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Replace the checkpoint store
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    /// Grouping parallelism for both calibration and counting
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.calibrator = self.calibrator.with_parallel(parallel);
        self.counter = self.counter.with_parallel(parallel);
        self
    }

    /// Keep only these levels in assembled matrices (empty keeps all)
    pub fn with_reference_levels(mut self, levels: Vec<Level>) -> Self {
        self.reference_levels = levels;
        self
    }

    /// Leave each minute's checkpoints in the store after its run
    pub fn with_keep_checkpoints(mut self, keep: bool) -> Self {
        self.keep_checkpoints = keep;
        self
    }

    /// The workload being estimated
    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Calibrate and count every origin group over one minute of packets
    pub fn run_minute(&self, minute: MinuteBucket, packets: &[PacketRecord]) -> Result<MinuteRun> {
        let namespace = CheckpointNamespace::for_minute(minute);
        let store: &dyn CheckpointStore = self.store.as_ref();

        let stale = store.clear(&namespace)?;
        if stale > 0 {
            tracing::warn!(minute, stale, "Removed checkpoints left by an earlier run");
        }

        let results = self.pool.install(|| {
            self.workload
                .groups()
                .par_iter()
                .map(|group| -> Result<(RawCountArtifact, ThresholdTable)> {
                    let source = group.training_relation(packets);
                    tracing::debug!(
                        minute,
                        origin = group.origin(),
                        packets = source.len(),
                        "Selected training packets"
                    );
                    let ctx = self.calibrator.calibrate_group(group, &source, store, namespace.clone())?;
                    let counts = self
                        .counter
                        .count_group(group, &source, store, &namespace, ctx.thresholds())?;
                    Ok((
                        RawCountArtifact::new(group.origin(), minute, counts),
                        ctx.into_thresholds(),
                    ))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut artifacts = Vec::with_capacity(results.len());
        let mut thresholds = ThresholdTable::new();
        for (artifact, table) in results {
            artifacts.push(artifact);
            thresholds.merge(table);
        }
        artifacts.sort_by_key(|a| a.origin);

        if !self.keep_checkpoints {
            let released = store.clear(&namespace)?;
            tracing::debug!(minute, released, "Released minute checkpoints");
        }

        tracing::info!(
            minute,
            origins = artifacts.len(),
            thresholds = thresholds.len(),
            "Processed minute"
        );
        Ok(MinuteRun {
            minute,
            artifacts,
            thresholds,
        })
    }

    /// Write the artifacts of a run into `dir`
    pub fn write_artifacts(&self, run: &MinuteRun, dir: &Path) -> Result<Vec<PathBuf>> {
        run.artifacts.iter().map(|a| a.save(dir)).collect()
    }

    /// Assemble artifacts and prune the matrix to the reference levels
    pub fn assemble(&self, artifacts: &[RawCountArtifact]) -> Result<CostMatrix> {
        let mut matrix = CostMatrixAssembler::from_workload(&self.workload).assemble(artifacts)?;
        if !self.reference_levels.is_empty() {
            matrix.prune_levels(&self.reference_levels);
        }
        Ok(matrix)
    }

    /// Run every minute and assemble the resulting matrix
    pub fn estimate(&self, minutes: &[(MinuteBucket, Vec<PacketRecord>)]) -> Result<CostMatrix> {
        let mut artifacts = Vec::new();
        for (minute, packets) in minutes {
            artifacts.extend(self.run_minute(*minute, packets)?.artifacts);
        }
        self.assemble(&artifacts)
    }
}

/// Worker pool with `threads` threads (0 lets rayon decide)
fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("refcost-worker-{}", i))
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to build worker pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::packet;
    use crate::query::standard_workload;
    use crate::types::TransitPair;

    fn udp_traffic() -> Vec<PacketRecord> {
        let mut packets = Vec::new();
        for i in 0..40u8 {
            packets.push(packet(1, [10, 0, 1, i], [172, 16, 0, 1], 53, 17));
        }
        for i in 0..5u8 {
            packets.push(packet(1, [10, 0, 2, i], [172, 16, 9, 9], 53, 17));
        }
        packets
    }

    #[test]
    fn test_run_minute_produces_artifact_per_origin() {
        let estimator = CostEstimator::new(
            standard_workload().unwrap(),
            RefinementHierarchy::new(32, 8).unwrap(),
        )
        .unwrap();
        let run = estimator.run_minute(7, &udp_traffic()).unwrap();

        let origins: Vec<u32> = run.artifacts.iter().map(|a| a.origin).collect();
        assert_eq!(origins, vec![1, 2, 3, 4, 5, 6, 7, 11]);
        assert!(run.thresholds.iter().all(|(_, _, t)| t.value() >= 2));
        // 112 has no filter
        assert!(run.thresholds.levels(112).is_none());
        assert_eq!(run.thresholds.levels(113).unwrap().len(), 4);
    }

    fn with_memory_store(keep: bool) -> (CostEstimator, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        let estimator = CostEstimator::new(
            standard_workload().unwrap(),
            RefinementHierarchy::new(32, 16).unwrap(),
        )
        .unwrap()
        .with_store(store.clone())
        .with_keep_checkpoints(keep);
        (estimator, store)
    }

    #[test]
    fn test_same_minute_reruns_from_scratch() {
        let (estimator, _) = with_memory_store(true);
        let first = estimator.run_minute(1, &udp_traffic()).unwrap();
        let second = estimator.run_minute(1, &udp_traffic()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_checkpoints_released_after_minute() {
        let (estimator, store) = with_memory_store(false);
        for minute in 0..3 {
            estimator.run_minute(minute, &udp_traffic()).unwrap();
            assert!(store.is_empty(), "minute {}", minute);
        }

        let (estimator, store) = with_memory_store(true);
        estimator.run_minute(0, &udp_traffic()).unwrap();
        let per_minute = store.len();
        assert!(per_minute > 0);
        assert!(store.contains("m0/filter_out_7_32"));
        estimator.run_minute(1, &udp_traffic()).unwrap();
        assert_eq!(store.len(), 2 * per_minute);
    }

    #[test]
    fn test_estimate_prunes_reference_levels() {
        let estimator = CostEstimator::new(
            standard_workload().unwrap(),
            RefinementHierarchy::new(32, 8).unwrap(),
        )
        .unwrap()
        .with_reference_levels(vec![16, 32]);
        let matrix = estimator.estimate(&[(3, udp_traffic())]).unwrap();

        let transits = matrix.transits(3, 7);
        assert_eq!(
            transits,
            vec![
                TransitPair { low: 0, high: 16 },
                TransitPair { low: 0, high: 32 },
                TransitPair { low: 16, high: 32 }
            ]
        );
    }
}
