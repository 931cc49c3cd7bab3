//! Worker-side orchestration versioning.
//!
//! Follows the same config-builder idiom used elsewhere in this crate: a
//! plain struct with `with_*` methods and a sensible `Default`.

use serde::{Deserialize, Serialize};

/// How an incoming orchestrator request's `version` is compared against
/// this worker's declared `workerVersion`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MatchStrategy {
    /// Request version must equal `workerVersion` exactly.
    Strict,
    /// Request version must be <= `workerVersion` (semver order).
    CurrentOrLower,
    /// Any version is accepted.
    Any,
}

/// What happens when a request's version does not match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureStrategy {
    /// Reject the work item outright; the scheduler may retry it
    /// elsewhere.
    Reject,
    /// Accept the item but fail the orchestration with a version-mismatch
    /// failure.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersioningPolicy {
    pub worker_version: String,
    pub default_version: String,
    pub match_strategy: MatchStrategy,
    pub failure_strategy: FailureStrategy,
}

impl Default for VersioningPolicy {
    fn default() -> Self {
        Self {
            worker_version: "0.0.0".to_string(),
            default_version: "0.0.0".to_string(),
            match_strategy: MatchStrategy::Any,
            failure_strategy: FailureStrategy::Reject,
        }
    }
}

impl VersioningPolicy {
    pub fn new(worker_version: impl Into<String>) -> Self {
        let worker_version = worker_version.into();
        Self {
            default_version: worker_version.clone(),
            worker_version,
            ..Self::default()
        }
    }

    pub fn with_default_version(mut self, version: impl Into<String>) -> Self {
        self.default_version = version.into();
        self
    }

    pub fn with_match_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.match_strategy = strategy;
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    /// Decides whether `request_version` is compatible with this worker.
    pub fn accepts(&self, request_version: &str) -> bool {
        match self.match_strategy {
            MatchStrategy::Any => true,
            MatchStrategy::Strict => request_version == self.worker_version,
            MatchStrategy::CurrentOrLower => {
                compare_versions(request_version, &self.worker_version) != std::cmp::Ordering::Greater
            }
        }
    }

    /// Outcome for a version-incompatible request, per [`FailureStrategy`].
    pub fn outcome_for_mismatch(&self) -> VersionOutcome {
        match self.failure_strategy {
            FailureStrategy::Reject => VersionOutcome::Reject,
            FailureStrategy::Fail => VersionOutcome::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOutcome {
    Reject,
    Fail,
}

/// Dotted numeric version comparison (`"1.2.0"` vs `"1.10.0"`); falls back
/// to lexicographic comparison for non-numeric segments so malformed
/// version strings degrade gracefully rather than panicking.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.').map(|p| p.parse::<u64>().unwrap_or(0)).collect()
    };
    let (va, vb) = (parse(a), parse(b));
    va.cmp(&vb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_requires_exact_match() {
        let policy = VersioningPolicy::new("2.0.0").with_match_strategy(MatchStrategy::Strict);
        assert!(policy.accepts("2.0.0"));
        assert!(!policy.accepts("1.9.0"));
    }

    #[test]
    fn current_or_lower_allows_older_versions() {
        let policy =
            VersioningPolicy::new("2.0.0").with_match_strategy(MatchStrategy::CurrentOrLower);
        assert!(policy.accepts("1.9.0"));
        assert!(policy.accepts("2.0.0"));
        assert!(!policy.accepts("2.1.0"));
    }

    #[test]
    fn any_accepts_everything() {
        let policy = VersioningPolicy::default();
        assert!(policy.accepts("99.0.0"));
    }

    #[test]
    fn mismatch_outcome_follows_failure_strategy() {
        let policy = VersioningPolicy::new("1.0.0").with_failure_strategy(FailureStrategy::Fail);
        assert_eq!(policy.outcome_for_mismatch(), VersionOutcome::Fail);
    }
}
