//! Progress normalization and per-attempt forwarding.

use std::sync::Arc;
use std::sync::Mutex;

/// Caller-supplied progress sink; receives fractions in `[0.0, 1.0]`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync + 'static>;

/// Sink that ignores every report.
pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Clamp a fraction into `[0.0, 1.0]`. Returns None for NaN.
pub fn normalize_fraction(value: f64) -> Option<f64> {
    if value.is_nan() {
        return None;
    }
    Some(value.clamp(0.0, 1.0))
}

/// Normalize a progress value reported by the local agent.
/// The companion server reports a fraction; values above 1.0 are read as a percentage.
pub fn normalize_agent_progress(raw: f64) -> Option<f64> {
    if raw.is_nan() {
        return None;
    }
    let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
    normalize_fraction(fraction)
}

/// Forwards one backend attempt's progress to the caller.
///
/// Reports are serialized through a mutex and kept increasing within the
/// attempt; regressions and repeats are dropped. A fresh forwarder is created for every
/// backend, so the caller sees progress restart when the cascade falls through.
pub struct ProgressForwarder {
    sink: ProgressFn,
    last: Mutex<Option<f64>>,
}

impl ProgressForwarder {
    pub fn new(sink: ProgressFn) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    /// Forward `value` if it is a valid fraction above the previous report.
    pub fn report(&self, value: f64) {
        let Some(value) = normalize_fraction(value) else {
            return;
        };

        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.is_some_and(|previous| value <= previous) {
            return;
        }
        *last = Some(value);
        // Invoke under the lock so reports for one job never interleave.
        (self.sink)(value);
    }

    /// Last value forwarded during this attempt.
    pub fn last_reported(&self) -> Option<f64> {
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
