//! Global constants for camera calibration
//!
//! Historical storage maximums are kept here, but
//! they are only used to validate settings. All
//! containers are sized dynamically.
//!

/// Largest summation window (in samples) for which
/// pedestal variances are tracked
pub const MAX_SUMWINDOW          : usize = 64;

/// Largest number of channels of a single camera
pub const MAX_CHANNELS           : usize = 2900;

/// Largest number of pedestal time slices in a run
pub const MAX_PED_TIMESLICES     : usize = 5000;

/// Raw value of a saturated 8bit FADC sample
pub const FADC_SATURATION        : u16   = 255;

/// Default length of a pedestal time slice (s)
pub const DEFAULT_TIMESLICE_SEC  : f64   = 180.0;

/// Below this number of entries a pedestal is
/// reported as 0 in the ascii summaries
pub const MIN_PED_ENTRIES        : u64   = 100;

/// Minimum number of entries in a charge bin
/// to be used for the IPR curve
pub const IPR_MIN_BIN_ENTRIES    : f64   = 5.0;

/// Minimum number of total entries to consider an
/// IPR curve statistically valid
pub const IPR_DEFAULT_MIN_STATS  : f64   = 1e5;

/// Give up drawing random dead channels after so many
/// failed attempts
pub const MAX_RANDOM_DEAD_DRAWS  : usize = 10000;

/// Seconds per day, used to convert time-of-day
/// and MJD to a continuous run time
pub const SECONDS_PER_DAY        : f64   = 86400.0;
