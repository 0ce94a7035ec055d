//! Load progress reporting.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A progress report handed to the caller's callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    /// Fraction of the work done, in `[0, 1]`.
    pub progress: f64,
    /// Seconds since the operation started.
    pub time_elapsed: f64,
    pub text: String,
}

/// Byte-weighted progress over one or more passes over the same bytes.
///
/// Downloading and placing each count once per byte, so a load that
/// downloads runs two passes and a load from a warm cache runs one.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    passes: u32,
    done: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: u64, passes: u32, started: Instant) -> Self {
        Self {
            total,
            passes: passes.max(1),
            done: 0,
            started,
        }
    }

    pub fn advance(&mut self, nbytes: u64) {
        self.done = self.done.saturating_add(nbytes);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        let whole = self.total.saturating_mul(u64::from(self.passes));
        if whole == 0 {
            return 1.0;
        }
        (self.done as f64 / whole as f64).min(1.0)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn report(&self, text: impl Into<String>) -> LoadProgress {
        LoadProgress {
            progress: self.fraction(),
            time_elapsed: self.elapsed_secs(),
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_passes_reach_one() {
        let mut tracker = ProgressTracker::new(100, 2, Instant::now());
        tracker.advance(100);
        assert_eq!(tracker.fraction(), 0.5);
        tracker.advance(100);
        assert_eq!(tracker.fraction(), 1.0);
        tracker.advance(1);
        assert_eq!(tracker.fraction(), 1.0);
    }

    #[test]
    fn empty_work_is_complete() {
        let tracker = ProgressTracker::new(0, 1, Instant::now());
        assert_eq!(tracker.fraction(), 1.0);
    }

    #[test]
    fn serializes_time_elapsed_in_camel_case() {
        let report = LoadProgress {
            progress: 0.25,
            time_elapsed: 1.5,
            text: "loading".to_string(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"progress": 0.25, "timeElapsed": 1.5, "text": "loading"})
        );
    }
}
