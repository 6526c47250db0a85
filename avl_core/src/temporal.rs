//! Temporal difference and temporal match.

use crate::config::CoreConfig;
use crate::service_time::MS_PER_SEC;
use crate::spatial_match::SpatialMatch;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// How far off expected time a vehicle is. Positive is early, negative late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TemporalDifference {
    msecs: i64,
}

impl TemporalDifference {
    pub const ON_TIME: TemporalDifference = TemporalDifference { msecs: 0 };

    pub fn new(msecs: i64) -> Self {
        Self { msecs }
    }

    pub fn msecs(&self) -> i64 {
        self.msecs
    }

    pub fn is_early(&self) -> bool {
        self.msecs > 0
    }

    pub fn is_late(&self) -> bool {
        self.msecs < 0
    }

    /// Msec early, negative when late.
    pub fn early(&self) -> i64 {
        self.msecs
    }

    /// Msec late, negative when early.
    pub fn late(&self) -> i64 {
        -self.msecs
    }

    pub fn is_within_bounds(&self, config: &CoreConfig) -> bool {
        self.is_within(config.allowable_early_secs, config.allowable_late_secs)
    }

    pub fn is_within_bounds_for_initial_matching(&self, config: &CoreConfig) -> bool {
        self.is_within(
            config.allowable_early_secs_for_initial_matching,
            config.allowable_late_secs_for_initial_matching,
        )
    }

    pub fn is_within(&self, allowable_early_secs: i64, allowable_late_secs: i64) -> bool {
        self.msecs < allowable_early_secs * MS_PER_SEC && -self.msecs < allowable_late_secs * MS_PER_SEC
    }

    /// Magnitude used for ranking; being early weighs more than being late.
    fn weighted(&self, config: &CoreConfig) -> i64 {
        if self.msecs > 0 {
            (self.msecs as f64 * config.early_to_late_ratio).round() as i64
        } else {
            -self.msecs
        }
    }

    pub fn better_than(&self, other: Option<&TemporalDifference>, config: &CoreConfig) -> bool {
        other.map_or(true, |o| self.weighted(config) < o.weighted(config))
    }

    pub fn better_than_or_equal_to(&self, other: Option<&TemporalDifference>, config: &CoreConfig) -> bool {
        other.map_or(true, |o| self.weighted(config) <= o.weighted(config))
    }

    /// Pushes the difference further from on-time by `msecs`.
    #[must_use]
    pub fn penalized(&self, msecs: i64) -> Self {
        if self.msecs >= 0 {
            Self::new(self.msecs + msecs)
        } else {
            Self::new(self.msecs - msecs)
        }
    }
}

impl fmt::Display for TemporalDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.msecs {
            m if m > 0 => "early",
            0 => "ontime",
            _ => "late",
        };
        write!(f, "{:.1}s ({})", self.msecs.abs() as f64 / 1000.0, label)
    }
}

/// A spatial match together with its temporal difference.
#[derive(Clone)]
pub struct TemporalMatch {
    spatial: SpatialMatch,
    difference: TemporalDifference,
}

impl TemporalMatch {
    pub fn new(spatial: SpatialMatch, difference: TemporalDifference) -> Self {
        Self { spatial, difference }
    }

    pub fn spatial(&self) -> &SpatialMatch {
        &self.spatial
    }

    pub fn into_spatial(self) -> SpatialMatch {
        self.spatial
    }

    pub fn temporal_difference(&self) -> TemporalDifference {
        self.difference
    }
}

impl Deref for TemporalMatch {
    type Target = SpatialMatch;

    fn deref(&self) -> &SpatialMatch {
        &self.spatial
    }
}

impl fmt::Debug for TemporalMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemporalMatch[{}, {:?}]", self.difference, self.spatial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bounds() {
        let config = CoreConfig::default();
        // 900s early / 5400s late by default
        assert!(TemporalDifference::new(899_000).is_within_bounds(&config));
        assert!(!TemporalDifference::new(900_000).is_within_bounds(&config));
        assert!(TemporalDifference::new(-5_399_000).is_within_bounds(&config));
        assert!(!TemporalDifference::new(-5_400_000).is_within_bounds(&config));
        assert!(!TemporalDifference::new(-1_200_000).is_within_bounds_for_initial_matching(&config));
    }

    #[test]
    fn test_early_weighs_more_than_late() {
        let config = CoreConfig::default();
        let early = TemporalDifference::new(60_000);
        let late = TemporalDifference::new(-120_000);
        // 60s early counts as 180s
        assert!(late.better_than(Some(&early), &config));
        assert!(!early.better_than(Some(&late), &config));
        assert!(early.better_than(None, &config));
        assert!(early.better_than_or_equal_to(Some(&early), &config));
    }

    #[test]
    fn test_penalized_moves_away_from_on_time() {
        assert_eq!(TemporalDifference::new(10).penalized(5).msecs(), 15);
        assert_eq!(TemporalDifference::new(-10).penalized(5).msecs(), -15);
        assert_eq!(TemporalDifference::ON_TIME.penalized(5).msecs(), 5);
    }

    #[test]
    fn test_display() {
        assert_eq!(TemporalDifference::new(-90_000).to_string(), "90.0s (late)");
        assert_eq!(TemporalDifference::ON_TIME.to_string(), "0.0s (ontime)");
    }

    proptest! {
        #[test]
        fn prop_within_bounds_matches_limits(msecs in -10_000_000i64..10_000_000) {
            let config = CoreConfig::default();
            let d = TemporalDifference::new(msecs);
            let expected = msecs < config.allowable_early_secs * 1000
                && -msecs < config.allowable_late_secs * 1000;
            prop_assert_eq!(d.is_within_bounds(&config), expected);
        }
    }
}
