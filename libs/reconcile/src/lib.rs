//! Reconciliation pass primitives.
//!
//! Pure, deterministic building blocks for the fleet control loop:
//!
//! - **Fingerprints**: detect that a runner spec changed between passes.
//! - **Deltas**: how many runners to create or retire for one spec.
//! - **Deletion order**: orphaned first, then unhealthy, then idle oldest-first.
//! - **Quarantine**: suspend creation for a spec after repeated failures.
//! - **Pass coalescing**: at most one pass in flight, extra triggers fold
//!   into one pending rerun.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Time is always passed in, never read from the clock

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

// =============================================================================
// Fingerprints
// =============================================================================

/// Stable hash of a configuration value.
///
/// Two values with the same canonical JSON form produce the same fingerprint,
/// regardless of map key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute a fingerprint from a JSON value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Compute a fingerprint from any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    // serde_json string encoding is already canonical
                    let key = serde_json::Value::String((*k).clone()).to_string();
                    format!("{}:{}", key, canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Deltas
// =============================================================================

/// Create/retire counts for one spec in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delta {
    /// Runners missing relative to desired.
    pub missing: u32,

    /// Idle runners beyond desired.
    pub surplus: u32,
}

impl Delta {
    /// `desired - eligible`, split into its positive and negative parts.
    pub fn compute(desired: u32, eligible: u32) -> Self {
        Self {
            missing: desired.saturating_sub(eligible),
            surplus: eligible.saturating_sub(desired),
        }
    }

    pub fn is_converged(&self) -> bool {
        self.missing == 0 && self.surplus == 0
    }
}

/// Number of creations allowed given remaining cap headroom.
///
/// `None` means the cap is unset.
pub fn bounded_creates(missing: u32, cap_remaining: Option<u32>) -> u32 {
    match cap_remaining {
        Some(remaining) => missing.min(remaining),
        None => missing,
    }
}

// =============================================================================
// Deletion Order
// =============================================================================

/// Why a runner is a deletion candidate. Lower values go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPriority {
    /// VM without a platform registration past the grace period.
    Orphaned = 0,

    /// No activity observed within the health timeout.
    Unhealthy = 1,

    /// Healthy idle runner beyond the desired count.
    Idle = 2,
}

impl DeletionPriority {
    /// Orphaned and unhealthy runners are always removed.
    pub fn is_mandatory(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Select runners to delete.
///
/// Every mandatory candidate is returned, followed by up to `surplus` idle
/// candidates. Within a priority class candidates are ordered by `age_key`
/// ascending, so passing the creation time yields oldest-first.
pub fn select_for_deletion<T, K, P, A>(
    candidates: Vec<T>,
    surplus: u32,
    get_priority: P,
    age_key: A,
) -> Vec<T>
where
    K: Ord,
    P: Fn(&T) -> DeletionPriority,
    A: Fn(&T) -> K,
{
    let mut ranked: Vec<_> = candidates
        .into_iter()
        .map(|c| (get_priority(&c), age_key(&c), c))
        .collect();
    ranked.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

    let mut idle_budget = surplus;
    ranked
        .into_iter()
        .filter_map(|(priority, _, c)| {
            if priority.is_mandatory() {
                return Some(c);
            }
            if idle_budget == 0 {
                return None;
            }
            idle_budget -= 1;
            Some(c)
        })
        .collect()
}

// =============================================================================
// Quarantine
// =============================================================================

/// Failure tracking for one spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantineRecord {
    /// Consecutive creation failures in the current window.
    pub consecutive_failures: u32,

    /// When the first failure of the current window happened.
    pub window_start: DateTime<Utc>,

    /// Set once the threshold is reached within the window.
    pub quarantined: bool,

    /// Configuration the failures were observed against.
    pub fingerprint: Option<Fingerprint>,
}

impl QuarantineRecord {
    fn window_elapsed(&self, window: Duration, now: DateTime<Utc>) -> bool {
        elapsed(self.window_start, now) >= window
    }
}

/// Per-spec quarantine state.
///
/// A spec is quarantined once `threshold` consecutive creation failures land
/// within `window` of the first one. It stays quarantined until the window
/// elapses, a creation succeeds, or its fingerprint changes.
#[derive(Debug, Clone)]
pub struct QuarantineTracker<K: Ord> {
    threshold: u32,
    window: Duration,
    records: BTreeMap<K, QuarantineRecord>,
}

impl<K: Ord + Clone> QuarantineTracker<K> {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            records: BTreeMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a creation failure.
    ///
    /// Returns true if this failure put the spec into quarantine.
    pub fn record_failure(&mut self, key: &K, now: DateTime<Utc>) -> bool {
        let threshold = self.threshold;
        let window = self.window;
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| QuarantineRecord {
                consecutive_failures: 0,
                window_start: now,
                quarantined: false,
                fingerprint: None,
            });

        if record.window_elapsed(window, now) {
            record.consecutive_failures = 0;
            record.window_start = now;
            record.quarantined = false;
        }

        record.consecutive_failures += 1;
        let newly = !record.quarantined && record.consecutive_failures >= threshold;
        if newly {
            record.quarantined = true;
        }
        newly
    }

    /// A successful creation breaks the failure streak.
    pub fn record_success(&mut self, key: &K) {
        self.records.remove(key);
    }

    pub fn is_quarantined(&self, key: &K, now: DateTime<Utc>) -> bool {
        self.records
            .get(key)
            .is_some_and(|r| r.quarantined && !r.window_elapsed(self.window, now))
    }

    /// When the quarantine for `key` lifts, if it is active.
    pub fn quarantined_until(&self, key: &K, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_quarantined(key, now) {
            return None;
        }
        let record = self.records.get(key)?;
        let window = chrono::Duration::from_std(self.window).ok()?;
        Some(record.window_start + window)
    }

    /// Reset the record if the spec configuration changed.
    ///
    /// Returns true if a record was discarded.
    pub fn observe_fingerprint(&mut self, key: &K, fingerprint: &Fingerprint) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        match &record.fingerprint {
            Some(previous) if previous != fingerprint => {
                self.records.remove(key);
                true
            }
            Some(_) => false,
            None => {
                record.fingerprint = Some(fingerprint.clone());
                false
            }
        }
    }

    /// Manually lift a quarantine.
    pub fn clear(&mut self, key: &K) -> bool {
        self.records.remove(key).is_some()
    }

    /// Drop records whose window has elapsed.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.records.retain(|_, r| !r.window_elapsed(window, now));
    }

    /// Drop records for keys no longer configured.
    pub fn retain_keys<F: Fn(&K) -> bool>(&mut self, keep: F) {
        self.records.retain(|k, _| keep(k));
    }

    pub fn get(&self, key: &K) -> Option<&QuarantineRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = (&K, &QuarantineRecord)> {
        self.records.iter()
    }
}

// =============================================================================
// Pass Coalescing
// =============================================================================

/// Lifecycle of the reconciliation pass slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    #[default]
    Idle,
    Running,
    PendingRerun,
}

/// What the caller should do after a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// No pass was running; start one now.
    Start,

    /// A pass is in flight; the trigger was folded into a pending rerun.
    Coalesced,
}

/// What the caller should do after a pass finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// A trigger arrived during the pass; run again.
    Rerun,

    /// Nothing pending.
    Idle,
}

impl PassState {
    pub fn on_trigger(&mut self) -> TriggerOutcome {
        match self {
            PassState::Idle => {
                *self = PassState::Running;
                TriggerOutcome::Start
            }
            PassState::Running | PassState::PendingRerun => {
                *self = PassState::PendingRerun;
                TriggerOutcome::Coalesced
            }
        }
    }

    pub fn on_complete(&mut self) -> CompletionOutcome {
        match self {
            PassState::PendingRerun => {
                *self = PassState::Running;
                CompletionOutcome::Rerun
            }
            PassState::Running | PassState::Idle => {
                *self = PassState::Idle;
                CompletionOutcome::Idle
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, PassState::Idle)
    }
}

// =============================================================================
// Pass Health
// =============================================================================

/// Health of a pass as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassHealth {
    /// Every backend and spec converged or is converging normally.
    #[default]
    Healthy,

    /// Some backend, spec or collaborator was unavailable; other work proceeded.
    Degraded,

    /// No mutation could be applied at all.
    Blocked,
}

impl PassHealth {
    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

// =============================================================================
// Helpers and Defaults
// =============================================================================

/// Wall-clock time elapsed from `since` to `now`, saturating at zero.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Default consecutive failures before a spec is quarantined.
pub const DEFAULT_QUARANTINE_THRESHOLD: u32 = 3;

/// Default quarantine window.
pub const DEFAULT_QUARANTINE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Default time without activity before a runner is considered unhealthy.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default time a VM may run without a registration.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);

/// Default overall pass budget.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "s"}});
        let json2 = serde_json::json!({"a": {"x": "s", "y": [1, 2]}, "b": 2});

        assert_eq!(Fingerprint::from_json(&json1), Fingerprint::from_json(&json2));
        assert!(Fingerprint::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_fingerprint_detects_change() {
        let a = Fingerprint::from_json(&serde_json::json!({"image": "a"}));
        let b = Fingerprint::from_json(&serde_json::json!({"image": "b"}));
        assert_ne!(a, b);
    }

    #[rstest]
    #[case(3, 0, 3, 0)]
    #[case(1, 3, 0, 2)]
    #[case(2, 2, 0, 0)]
    #[case(0, 0, 0, 0)]
    fn test_delta(
        #[case] desired: u32,
        #[case] eligible: u32,
        #[case] missing: u32,
        #[case] surplus: u32,
    ) {
        let delta = Delta::compute(desired, eligible);
        assert_eq!(delta.missing, missing);
        assert_eq!(delta.surplus, surplus);
        assert_eq!(delta.is_converged(), missing == 0 && surplus == 0);
    }

    #[test]
    fn test_bounded_creates() {
        assert_eq!(bounded_creates(3, None), 3);
        assert_eq!(bounded_creates(3, Some(1)), 1);
        assert_eq!(bounded_creates(3, Some(0)), 0);
        assert_eq!(bounded_creates(2, Some(5)), 2);
    }

    #[test]
    fn test_select_for_deletion_order() {
        let candidates = vec![
            ("idle-new", DeletionPriority::Idle, 30),
            ("unhealthy", DeletionPriority::Unhealthy, 5),
            ("idle-old", DeletionPriority::Idle, 10),
            ("orphan", DeletionPriority::Orphaned, 40),
            ("idle-mid", DeletionPriority::Idle, 20),
        ];

        let selected = select_for_deletion(candidates, 2, |c| c.1, |c| c.2);
        let names: Vec<_> = selected.iter().map(|c| c.0).collect();
        assert_eq!(names, vec!["orphan", "unhealthy", "idle-old", "idle-mid"]);
    }

    #[test]
    fn test_select_for_deletion_keeps_newest_idle() {
        let candidates = vec![("c", 3), ("a", 1), ("b", 2)];
        let selected = select_for_deletion(candidates, 2, |_| DeletionPriority::Idle, |c| c.1);
        let names: Vec<_> = selected.iter().map(|c| c.0).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_select_for_deletion_no_surplus() {
        let candidates = vec![("a", DeletionPriority::Idle), ("b", DeletionPriority::Unhealthy)];
        let selected = select_for_deletion(candidates, 0, |c| c.1, |c| c.0);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "b");
    }

    #[test]
    fn test_quarantine_after_threshold() {
        let mut tracker = QuarantineTracker::new(3, Duration::from_secs(600));
        let key = "spec-b".to_string();

        assert!(!tracker.record_failure(&key, t(0)));
        assert!(!tracker.record_failure(&key, t(10)));
        assert!(!tracker.is_quarantined(&key, t(15)));
        assert!(tracker.record_failure(&key, t(20)));
        assert!(tracker.is_quarantined(&key, t(21)));
        assert_eq!(tracker.quarantined_until(&key, t(21)), Some(t(600)));

        // Further failures do not re-announce the quarantine
        assert!(!tracker.record_failure(&key, t(30)));
        assert_eq!(tracker.get(&key).unwrap().consecutive_failures, 4);
    }

    #[test]
    fn test_quarantine_lifts_after_window() {
        let mut tracker = QuarantineTracker::new(3, Duration::from_secs(600));
        let key = "spec-b";
        for s in [0, 1, 2] {
            tracker.record_failure(&key, t(s));
        }
        assert!(tracker.is_quarantined(&key, t(599)));
        assert!(!tracker.is_quarantined(&key, t(600)));

        // The next failure starts a fresh window
        assert!(!tracker.record_failure(&key, t(700)));
        assert_eq!(tracker.get(&key).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn test_quarantine_failures_outside_window_do_not_accumulate() {
        let mut tracker = QuarantineTracker::new(3, Duration::from_secs(60));
        let key = 1u32;
        tracker.record_failure(&key, t(0));
        tracker.record_failure(&key, t(30));
        tracker.record_failure(&key, t(90));
        assert!(!tracker.is_quarantined(&key, t(91)));
    }

    #[test]
    fn test_quarantine_success_resets_streak() {
        let mut tracker = QuarantineTracker::new(3, Duration::from_secs(600));
        let key = "a";
        tracker.record_failure(&key, t(0));
        tracker.record_failure(&key, t(1));
        tracker.record_success(&key);
        tracker.record_failure(&key, t(2));
        assert!(!tracker.is_quarantined(&key, t(3)));
        assert_eq!(tracker.get(&key).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn test_quarantine_fingerprint_change_resets() {
        let mut tracker = QuarantineTracker::new(1, Duration::from_secs(600));
        let key = "a";
        let old = Fingerprint::from_json(&serde_json::json!({"image": "broken"}));
        let new = Fingerprint::from_json(&serde_json::json!({"image": "fixed"}));

        tracker.record_failure(&key, t(0));
        assert!(!tracker.observe_fingerprint(&key, &old));
        assert!(tracker.is_quarantined(&key, t(1)));
        assert!(!tracker.observe_fingerprint(&key, &old));
        assert!(tracker.observe_fingerprint(&key, &new));
        assert!(!tracker.is_quarantined(&key, t(2)));
    }

    #[test]
    fn test_quarantine_prune() {
        let mut tracker = QuarantineTracker::new(2, Duration::from_secs(60));
        tracker.record_failure(&"a", t(0));
        tracker.record_failure(&"b", t(50));
        tracker.prune(t(70));
        assert!(tracker.get(&"a").is_none());
        assert!(tracker.get(&"b").is_some());
    }

    #[test]
    fn test_pass_state_coalesces() {
        let mut state = PassState::default();
        assert_eq!(state.on_trigger(), TriggerOutcome::Start);
        assert_eq!(state, PassState::Running);
        assert_eq!(state.on_trigger(), TriggerOutcome::Coalesced);
        assert_eq!(state.on_trigger(), TriggerOutcome::Coalesced);
        assert_eq!(state, PassState::PendingRerun);

        assert_eq!(state.on_complete(), CompletionOutcome::Rerun);
        assert_eq!(state, PassState::Running);
        assert_eq!(state.on_complete(), CompletionOutcome::Idle);
        assert!(!state.is_busy());
    }

    #[test]
    fn test_pass_health_worst() {
        assert_eq!(PassHealth::Healthy.worst(PassHealth::Degraded), PassHealth::Degraded);
        assert_eq!(PassHealth::Blocked.worst(PassHealth::Degraded), PassHealth::Blocked);
        assert_eq!(PassHealth::Healthy.worst(PassHealth::Healthy), PassHealth::Healthy);
    }

    #[test]
    fn test_elapsed_saturates() {
        assert_eq!(elapsed(t(10), t(0)), Duration::ZERO);
        assert_eq!(elapsed(t(0), t(10)), Duration::from_secs(10));
    }
}
