//! Per-folder confidence thresholds and drift tracking
//!
//! Thresholds come from configuration; a decision is accepted only when
//! its confidence clears the threshold of its target folder. The
//! calibrator watches `feedback` frames and proposes adjustments inside a
//! fixed corridor around the configured value. Proposals are advisory;
//! config remains the source of truth.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;

/// Advisory adjustments never leave ±0.10 around the configured value.
pub const CORRIDOR: f64 = 0.10;

/// Rolling window length per (folder, provider).
const WINDOW: usize = 50;

/// Feedback samples required before proposing anything.
const MIN_FEEDBACK: usize = 5;

/// Override rate the calibrator steers toward.
const TARGET_OVERRIDE_RATE: f64 = 0.10;

/// How many recent predictions are kept for feedback attribution.
const RECENT_CAPACITY: usize = 1024;

/// `folder → threshold` with a `default` fallback.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    default: f64,
    per_folder: HashMap<String, f64>,
}

impl ThresholdPolicy {
    pub const DEFAULT_THRESHOLD: f64 = 0.75;

    /// Build from the configured map, where the `default` key sets the
    /// fallback for unlisted folders.
    #[must_use]
    pub fn from_map(thresholds: &HashMap<String, f64>) -> Self {
        let default = thresholds
            .get("default")
            .copied()
            .unwrap_or(Self::DEFAULT_THRESHOLD);
        let per_folder = thresholds
            .iter()
            .filter(|(name, _)| name.as_str() != "default")
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        Self {
            default,
            per_folder,
        }
    }

    #[must_use]
    pub fn threshold_for(&self, folder: &str) -> f64 {
        self.per_folder.get(folder).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    Predicted,
    Confirmed,
    Overridden,
}

#[derive(Debug, Clone)]
struct RecentPrediction {
    folder: String,
    provider: String,
}

/// One advisory adjustment, reported but never enforced.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdProposal {
    pub folder: String,
    pub provider: String,
    pub adjustment: f64,
}

/// Rolling per-(folder, provider) statistics fed by accepted decisions
/// and user feedback.
pub struct Calibrator {
    windows: Mutex<HashMap<(String, String), VecDeque<Sample>>>,
    recent: Mutex<LruCache<String, RecentPrediction>>,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibrator {
    #[must_use]
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(RECENT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            windows: Mutex::new(HashMap::new()),
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record an accepted prediction so later feedback can be attributed.
    pub fn record_prediction(&self, message_id: &str, folder: &str, provider: &str) {
        self.push(folder, provider, Sample::Predicted);
        self.lock_recent().put(
            message_id.to_string(),
            RecentPrediction {
                folder: folder.to_string(),
                provider: provider.to_string(),
            },
        );
    }

    /// Fold one `feedback` frame into the rolling window.
    ///
    /// Feedback for messages this process never classified is ignored.
    pub fn record_feedback(&self, message_id: &str, actual_folder: &str) {
        let Some(prediction) = self.lock_recent().pop(message_id) else {
            return;
        };
        let sample = if prediction.folder == actual_folder {
            Sample::Confirmed
        } else {
            Sample::Overridden
        };
        self.push(&prediction.folder, &prediction.provider, sample);
    }

    /// Advisory threshold delta for (folder, provider), clamped to the
    /// corridor. Zero until enough feedback has accumulated.
    pub fn proposed_adjustment(&self, folder: &str, provider: &str) -> f64 {
        let windows = self.lock_windows();
        let Some(window) = windows.get(&(folder.to_string(), provider.to_string())) else {
            return 0.0;
        };

        let confirmed = window.iter().filter(|s| **s == Sample::Confirmed).count();
        let overridden = window.iter().filter(|s| **s == Sample::Overridden).count();
        let feedback = confirmed + overridden;
        if feedback < MIN_FEEDBACK {
            return 0.0;
        }

        let override_rate = overridden as f64 / feedback as f64;
        (override_rate - TARGET_OVERRIDE_RATE).clamp(-CORRIDOR, CORRIDOR)
    }

    /// All non-zero advisory proposals, for the stats surface.
    pub fn proposals(&self) -> Vec<ThresholdProposal> {
        let keys: Vec<(String, String)> = self.lock_windows().keys().cloned().collect();
        let mut proposals: Vec<ThresholdProposal> = keys
            .into_iter()
            .filter_map(|(folder, provider)| {
                let adjustment = self.proposed_adjustment(&folder, &provider);
                (adjustment.abs() > f64::EPSILON).then_some(ThresholdProposal {
                    folder,
                    provider,
                    adjustment,
                })
            })
            .collect();
        proposals.sort_by(|a, b| (&a.folder, &a.provider).cmp(&(&b.folder, &b.provider)));
        proposals
    }

    /// (predicted, confirmed, overridden) counts in the current window.
    pub fn counts(&self, folder: &str, provider: &str) -> (usize, usize, usize) {
        let windows = self.lock_windows();
        windows
            .get(&(folder.to_string(), provider.to_string()))
            .map_or((0, 0, 0), |window| {
                let count =
                    |kind: Sample| window.iter().filter(|s| **s == kind).count();
                (
                    count(Sample::Predicted),
                    count(Sample::Confirmed),
                    count(Sample::Overridden),
                )
            })
    }

    fn push(&self, folder: &str, provider: &str, sample: Sample) {
        let mut windows = self.lock_windows();
        let window = windows
            .entry((folder.to_string(), provider.to_string()))
            .or_default();
        if window.len() == WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    fn lock_windows(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, String), VecDeque<Sample>>> {
        self.windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, LruCache<String, RecentPrediction>> {
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_threshold_applies_to_unlisted_folders() {
        let mut map = HashMap::new();
        map.insert("default".to_string(), 0.8);
        map.insert("Trash".to_string(), 0.95);

        let policy = ThresholdPolicy::from_map(&map);
        assert!((policy.threshold_for("Trash") - 0.95).abs() < f64::EPSILON);
        assert!((policy.threshold_for("Invoices") - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_default_key_uses_builtin() {
        let policy = ThresholdPolicy::from_map(&HashMap::new());
        assert!(
            (policy.threshold_for("Anything") - ThresholdPolicy::DEFAULT_THRESHOLD).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn no_proposal_without_enough_feedback() {
        let calibrator = Calibrator::new();
        calibrator.record_prediction("m1", "Invoices", "ollama");
        calibrator.record_feedback("m1", "Invoices");
        assert!(calibrator.proposed_adjustment("Invoices", "ollama").abs() < f64::EPSILON);
    }

    #[test]
    fn heavy_overrides_propose_raising_within_corridor() {
        let calibrator = Calibrator::new();
        for i in 0..10 {
            let id = format!("m{i}");
            calibrator.record_prediction(&id, "Trash", "ollama");
            calibrator.record_feedback(&id, "INBOX");
        }

        let adjustment = calibrator.proposed_adjustment("Trash", "ollama");
        assert!((adjustment - CORRIDOR).abs() < f64::EPSILON);
    }

    #[test]
    fn confirmations_propose_a_small_lowering() {
        let calibrator = Calibrator::new();
        for i in 0..10 {
            let id = format!("m{i}");
            calibrator.record_prediction(&id, "Invoices", "ollama");
            calibrator.record_feedback(&id, "Invoices");
        }

        let adjustment = calibrator.proposed_adjustment("Invoices", "ollama");
        assert!(adjustment < 0.0);
        assert!(adjustment >= -CORRIDOR);
    }

    #[test]
    fn proposals_list_only_nonzero_adjustments() {
        let calibrator = Calibrator::new();
        for i in 0..10 {
            let id = format!("m{i}");
            calibrator.record_prediction(&id, "Trash", "ollama");
            calibrator.record_feedback(&id, "INBOX");
        }
        // A folder with no feedback yet proposes nothing.
        calibrator.record_prediction("x1", "Invoices", "ollama");

        let proposals = calibrator.proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].folder, "Trash");
        assert!((proposals[0].adjustment - CORRIDOR).abs() < f64::EPSILON);
    }

    #[test]
    fn feedback_for_unknown_message_is_ignored() {
        let calibrator = Calibrator::new();
        calibrator.record_feedback("never-seen", "Invoices");
        assert_eq!(calibrator.counts("Invoices", "ollama"), (0, 0, 0));
    }

    #[test]
    fn window_is_bounded() {
        let calibrator = Calibrator::new();
        for i in 0..(WINDOW + 20) {
            let id = format!("m{i}");
            calibrator.record_prediction(&id, "Invoices", "ollama");
        }
        let (predicted, _, _) = calibrator.counts("Invoices", "ollama");
        assert_eq!(predicted, WINDOW);
    }
}
