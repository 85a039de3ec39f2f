use anyhow::{bail, Result};
use serde::Serialize;
use std::cmp;

use super::VisibilitySpec;

/// A first non-zero observation this close to model creation counts as
/// load-time visibility.
pub const LOAD_TIME_WINDOW_MS: u64 = 300;

/// Counter state of one visibility model. Timestamps are ms since epoch
/// with 0 meaning unset; durations are ms; percentages are fractions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityCounters {
    pub created_time: u64,
    pub matches_visibility: bool,
    /// Duration bounds only count once visibility matched at least once.
    pub ever_matched_visibility: bool,
    pub continuous_time: u64,
    pub max_continuous_visible_time: u64,
    pub total_visible_time: u64,
    pub first_seen_time: u64,
    pub last_seen_time: u64,
    pub first_visible_time: u64,
    pub last_visible_time: u64,
    /// Start of the current matching slice; 0 while not matching.
    pub last_visible_update_time: u64,
    pub load_time_visibility: f64,
    pub min_visible_percentage: f64,
    pub max_visible_percentage: f64,
}

/// Snapshot handed to reporters. Times are relative to the caller's start
/// time, percentages are on a 0-100 scale.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityState {
    pub first_seen_time: u64,
    pub last_seen_time: u64,
    pub last_visible_time: u64,
    pub first_visible_time: u64,
    pub max_continuous_visible_time: u64,
    pub total_visible_time: u64,
    pub load_time_visibility: f64,
    pub min_visible_percentage: f64,
    pub max_visible_percentage: f64,
}

pub fn validate_visibility(visibility: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&visibility) {
        bail!("invalid visibility value: {visibility}");
    }
    Ok(())
}

impl VisibilityCounters {
    pub fn new(created_time: u64) -> Self {
        Self {
            created_time,
            ..Self::default()
        }
    }

    /// Folds one observation into the counters and reports whether every
    /// condition of `spec` currently holds.
    pub fn update(&mut self, spec: &VisibilitySpec, visibility: f64, now: u64) -> Result<bool> {
        validate_visibility(visibility)?;

        if visibility > 0.0 {
            if self.first_seen_time == 0 {
                self.first_seen_time = now;
            }
            self.last_seen_time = now;
            if self.load_time_visibility == 0.0
                && now.saturating_sub(self.created_time) < LOAD_TIME_WINDOW_MS
            {
                self.load_time_visibility = visibility;
            }
        }

        let prev_matches = self.matches_visibility;
        let time_since_last_update = if self.last_visible_update_time > 0 {
            now.saturating_sub(self.last_visible_update_time)
        } else {
            0
        };

        self.matches_visibility = spec.matches(visibility);
        if self.matches_visibility {
            self.ever_matched_visibility = true;
            if prev_matches {
                self.total_visible_time += time_since_last_update;
                self.continuous_time += time_since_last_update;
                self.max_continuous_visible_time =
                    cmp::max(self.max_continuous_visible_time, self.continuous_time);
            } else {
                debug_assert_eq!(self.last_visible_update_time, 0);
                if self.first_visible_time == 0 {
                    self.first_visible_time = now;
                }
            }
            self.last_visible_update_time = now;
            self.min_visible_percentage = if self.min_visible_percentage > 0.0 {
                self.min_visible_percentage.min(visibility)
            } else {
                visibility
            };
            self.max_visible_percentage = self.max_visible_percentage.max(visibility);
            self.last_visible_time = now;
        } else if prev_matches {
            // Close the streak before clearing it.
            self.max_continuous_visible_time = cmp::max(
                self.max_continuous_visible_time,
                self.continuous_time + time_since_last_update,
            );
            self.last_visible_update_time = 0;
            self.total_visible_time += time_since_last_update;
            self.continuous_time = 0;
            self.last_visible_time = now;
        }

        Ok(self.conditions_met(spec))
    }

    pub fn conditions_met(&self, spec: &VisibilitySpec) -> bool {
        let total = self.total_visible_time as f64;
        let continuous = self.max_continuous_visible_time as f64;
        self.ever_matched_visibility
            && total >= spec.total_time_min
            && total <= spec.total_time_max
            && continuous >= spec.continuous_time_min
            && continuous <= spec.continuous_time_max
    }

    /// Milliseconds until the duration conditions could next be satisfied
    /// if visibility keeps matching. A requirement that is already met is
    /// left out of the minimum but still caps the result.
    pub fn time_to_wait(&self, spec: &VisibilitySpec) -> f64 {
        let wait_for_continuous = (spec.continuous_time_min - self.continuous_time as f64).max(0.0);
        let wait_for_total = (spec.total_time_min - self.total_visible_time as f64).max(0.0);
        let max_wait = wait_for_continuous.max(wait_for_total);
        max_wait
            .min(non_zero_or_infinity(wait_for_continuous))
            .min(non_zero_or_infinity(wait_for_total))
    }

    pub fn snapshot(&self, start_time: u64) -> VisibilityState {
        VisibilityState {
            first_seen_time: time_base(self.first_seen_time, start_time),
            last_seen_time: time_base(self.last_seen_time, start_time),
            last_visible_time: time_base(self.last_visible_time, start_time),
            first_visible_time: time_base(self.first_visible_time, start_time),
            max_continuous_visible_time: self.max_continuous_visible_time,
            total_visible_time: self.total_visible_time,
            load_time_visibility: self.load_time_visibility * 100.0,
            min_visible_percentage: self.min_visible_percentage * 100.0,
            max_visible_percentage: self.max_visible_percentage * 100.0,
        }
    }

    /// Starts a new episode. Creation time and load-time visibility are
    /// facts about the page load and survive.
    pub fn reset(&mut self) {
        *self = Self {
            created_time: self.created_time,
            load_time_visibility: self.load_time_visibility,
            ..Self::default()
        };
    }
}

fn non_zero_or_infinity(value: f64) -> f64 {
    if value == 0.0 {
        f64::INFINITY
    } else {
        value
    }
}

fn time_base(time: u64, base_time: u64) -> u64 {
    if time >= base_time {
        time - base_time
    } else {
        0
    }
}
