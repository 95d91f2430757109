//! Position fix selection.
//!
//! Fixes arrive from several providers with different accuracy and age; the
//! node keeps the best one to stamp on outgoing traffic and status reports.

use serde::{Deserialize, Serialize};

/// A fix this much newer always wins; this much older always loses
pub const SIGNIFICANT_AGE_MS: i64 = 2 * 60 * 1000;

/// Accuracy loss (metres) beyond which a newer fix is still rejected
pub const SIGNIFICANT_ACCURACY_LOSS_M: f32 = 200.0;

/// One position report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Horizontal accuracy radius in metres
    pub accuracy_m: f32,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Source of the fix (gps, network, ...)
    pub provider: String,
}

/// Whether `candidate` should replace `current`
pub fn is_better_fix(candidate: &PositionFix, current: Option<&PositionFix>) -> bool {
    let Some(current) = current else {
        return true;
    };

    let age_delta = candidate.timestamp_ms as i64 - current.timestamp_ms as i64;
    if age_delta > SIGNIFICANT_AGE_MS {
        return true;
    }
    if age_delta < -SIGNIFICANT_AGE_MS {
        return false;
    }
    let is_newer = age_delta > 0;

    let accuracy_delta = candidate.accuracy_m - current.accuracy_m;
    let is_more_accurate = accuracy_delta < 0.0;
    let is_less_accurate = accuracy_delta > 0.0;
    let is_much_less_accurate = accuracy_delta > SIGNIFICANT_ACCURACY_LOSS_M;
    let same_provider = candidate.provider == current.provider;

    is_more_accurate
        || (is_newer && !is_less_accurate)
        || (is_newer && !is_much_less_accurate && same_provider)
}
