//! Percentage and status-line helpers shared by the engines.

/// Step added to an indeterminate percentage on every event.
pub const PULSE_STEP: f64 = 536_870_911.0;

/// Modulus keeping the pulsing value inside an `i32`.
pub const PULSE_BOUND: f64 = 2_147_483_647.0;

/// Advance an indeterminate progress value.
///
/// The result keeps changing on every call so a progress indicator can be
/// animated, but it is not a completion fraction and is not monotonic.
pub fn pulse(current: f64) -> f64 {
    (current + PULSE_STEP) % PULSE_BOUND
}

/// `done / total` as a percentage. An empty total counts as finished.
pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

/// Mean of the configured completion ratios, as a percentage.
///
/// Each entry pairs an observed value with its optional bound; dimensions
/// without a bound are ignored. Returns `None` when nothing is bounded.
pub fn mean_of_bounds(dimensions: &[(f64, Option<f64>)]) -> Option<f64> {
    let ratios: Vec<f64> = dimensions
        .iter()
        .filter_map(|(value, bound)| bound.filter(|b| *b > 0.0).map(|b| value / b))
        .collect();

    if ratios.is_empty() {
        return None;
    }
    Some(ratios.iter().sum::<f64>() / ratios.len() as f64 * 100.0)
}

pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes >= KB * KB * KB {
        format!("{:.1} GB", bytes / (KB * KB * KB))
    } else if bytes >= KB * KB {
        format!("{:.1} MB", bytes / (KB * KB))
    } else {
        format!("{:.1} KB", bytes / KB)
    }
}

pub fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    if secs >= 3600 {
        format!("{} h", secs / 3600)
    } else if secs >= 60 {
        format!("{} m", secs / 60)
    } else {
        format!("{} s", secs)
    }
}
