//! Feature-level retry backoff and error-key normalization.
//!
//! Grounded on `original_source/core/database.py`'s `_error_key` and
//! `_next_retry_delay_s`. This is one of three distinct backoff policies in
//! the system (SPEC_FULL.md §9) — the other two live in
//! [`crate::supervisor`] (SDK-error retries) and [`crate::worktree`]
//! (cleanup-queue retries). They must not be merged.

use rand::Rng;

const MAX_ERROR_KEY_LEN: usize = 4000;

/// Parameters for the feature-level retry/block policy, sourced from
/// [`crate::config::FeatureRetryConfig`]. Kept as a plain struct so
/// `Store::mark_feature_failed` doesn't need to depend on the config module
/// directly.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicyParams {
    pub max_attempts: u32,
    pub max_same_error_streak: u32,
    pub max_same_diff_streak: u32,
    pub initial_delay_s: u64,
    pub max_delay_s: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl From<&crate::config::FeatureRetryConfig> for RetryPolicyParams {
    fn from(c: &crate::config::FeatureRetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            max_same_error_streak: c.max_same_error_streak,
            max_same_diff_streak: c.max_same_diff_streak,
            initial_delay_s: c.initial_delay_s,
            max_delay_s: c.max_delay_s,
            exponential_base: c.exponential_base,
            jitter: c.jitter,
        }
    }
}

/// Normalize a failure message into a stable fingerprint used to detect
/// repeated identical failures (`same_error_streak`). Strips lines that
/// begin with `artifact:` (volatile paths) and collapses whitespace.
pub fn normalize_error_key(reason: &str) -> String {
    let stripped: String = reason
        .lines()
        .filter(|line| !line.trim_start().starts_with("artifact:"))
        .collect::<Vec<_>>()
        .join(" ");

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = collapsed.to_lowercase();

    if lower.len() > MAX_ERROR_KEY_LEN {
        lower[..MAX_ERROR_KEY_LEN].to_string()
    } else {
        lower
    }
}

/// `min(max, initial * base^(attempts-1))`, optionally jittered by a
/// uniform factor in `[0.7, 1.3]`.
pub fn next_retry_delay_s(
    attempts: u32,
    initial_s: u64,
    base: f64,
    max_s: u64,
    jitter: bool,
) -> u64 {
    let attempts = attempts.max(1);
    let raw = (initial_s as f64) * base.powi(attempts as i32 - 1);
    let capped = raw.min(max_s as f64);

    let delay = if jitter {
        let factor = rand::rng().random_range(0.7..=1.3);
        (capped * factor).max(0.0)
    } else {
        capped
    };

    delay.round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_artifact_lines_and_collapses_whitespace() {
        let reason = "Test failed:   assertion error\nartifact: /tmp/abc123/out.json\nline two";
        let key = normalize_error_key(reason);
        assert!(!key.contains("artifact"));
        assert!(!key.contains("  "));
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let d1 = next_retry_delay_s(1, 10, 2.0, 600, false);
        let d2 = next_retry_delay_s(2, 10, 2.0, 600, false);
        let d3 = next_retry_delay_s(3, 10, 2.0, 600, false);
        assert_eq!(d1, 10);
        assert_eq!(d2, 20);
        assert_eq!(d3, 40);

        let capped = next_retry_delay_s(20, 10, 2.0, 600, false);
        assert_eq!(capped, 600);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for attempts in 1..8 {
            let base = next_retry_delay_s(attempts, 10, 2.0, 600, false);
            let jittered = next_retry_delay_s(attempts, 10, 2.0, 600, true);
            let lower = (base as f64 * 0.69).floor() as u64;
            let upper = (base as f64 * 1.31).ceil() as u64;
            assert!(
                jittered >= lower && jittered <= upper,
                "jittered={jittered} base={base} lower={lower} upper={upper}"
            );
        }
    }
}
