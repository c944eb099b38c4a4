//! Threshold calibration
//!
//! Learns, per query and refinement level, the admission threshold of the
//! query's filter. The finest level is calibrated from a percentile of the
//! observed distribution; coarser levels inherit admission from the level
//! just finer than them, so admitted keys only ever shrink as levels coarsen.

pub mod calibrator;
pub mod context;
pub mod percentile;

pub use calibrator::ThresholdCalibrator;
pub use context::{CalibrationContext, ThresholdTable};
pub use percentile::{resolve_percentile, PercentileEstimator, PercentileRule, DEFAULT_DIGEST_SIZE};
