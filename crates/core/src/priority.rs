//! Priority classes and the lane scoring function.
//!
//! The lane is ordered by ascending score. Each priority class owns a disjoint
//! band of `BAND_WIDTH` milliseconds; within a band the score is the instant
//! (epoch ms) at which the job becomes visible. A job from a higher class
//! therefore always sorts before any job from a lower class, and jobs of the
//! same class sort by visibility time (FIFO for plain submissions, delayed for
//! retries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Width of one priority band in milliseconds (~316 years of epoch time).
///
/// Four bands top out at 4e13, well inside the 2^53 integer range of an f64
/// sorted-set score.
pub const BAND_WIDTH: u64 = 10_000_000_000_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All classes, highest first (dispatch order).
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// 0 for `Critical` up to 3 for `Low`.
    pub fn rank(self) -> u64 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// Lower bound of this class's score band.
    pub fn weight(self) -> u64 {
        self.rank() * BAND_WIDTH
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Priority {
    type Err = crate::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(crate::QueueError::validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// Position of a job in the Priority Lane.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneScore(u64);

impl LaneScore {
    /// Score for a job of `priority` that becomes visible at `visible_at`.
    ///
    /// Instants before the epoch clamp to 0; instants past the band clamp to
    /// the band's last slot so they can never leak into the next class.
    pub fn new(priority: Priority, visible_at: DateTime<Utc>) -> Self {
        let ms = visible_at.timestamp_millis().max(0) as u64;
        Self(priority.weight() + ms.min(BAND_WIDTH - 1))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Score as stored in a sorted set.
    pub fn as_f64(self) -> f64 {
        self.0 as f64
    }

    pub fn priority(self) -> Priority {
        match self.0 / BAND_WIDTH {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    /// Epoch milliseconds at which the entry becomes claimable.
    pub fn visible_at_ms(self) -> u64 {
        self.0 % BAND_WIDTH
    }

    /// Whether the entry is claimable at `now_ms`.
    pub fn is_ready(self, now_ms: u64) -> bool {
        self.visible_at_ms() <= now_ms
    }

    /// Inclusive score range holding every entry of `priority` visible at `now_ms`.
    pub fn ready_range(priority: Priority, now_ms: u64) -> (LaneScore, LaneScore) {
        let lo = priority.weight();
        (Self(lo), Self(lo + now_ms.min(BAND_WIDTH - 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn higher_class_beats_any_age() {
        let ancient = Utc.timestamp_millis_opt(0).unwrap();
        let far_future = Utc.timestamp_millis_opt(9_000_000_000_000).unwrap();

        let old_low = LaneScore::new(Priority::Low, ancient);
        let new_critical = LaneScore::new(Priority::Critical, far_future);
        assert!(new_critical < old_low);
    }

    #[test]
    fn same_class_orders_by_time() {
        let t1 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let t2 = Utc.timestamp_millis_opt(1_700_000_000_001).unwrap();
        assert!(LaneScore::new(Priority::High, t1) < LaneScore::new(Priority::High, t2));
    }

    #[test]
    fn score_decomposes_back() {
        let t = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();
        let score = LaneScore::new(Priority::Medium, t);
        assert_eq!(score.priority(), Priority::Medium);
        assert_eq!(score.visible_at_ms(), 1_700_000_123_456);
        assert!(score.is_ready(1_700_000_123_456));
        assert!(!score.is_ready(1_700_000_123_455));
    }

    #[test]
    fn ready_range_covers_only_due_entries() {
        let (lo, hi) = LaneScore::ready_range(Priority::High, 500);
        assert_eq!(lo.raw(), BAND_WIDTH);
        assert_eq!(hi.raw(), BAND_WIDTH + 500);
    }

    #[test]
    fn priority_parses_its_name() {
        for p in Priority::ALL {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn priority() -> impl Strategy<Value = Priority> {
            prop::sample::select(Priority::ALL.to_vec())
        }

        proptest! {
            /// Property: across classes, priority strictly dominates age.
            #[test]
            fn priority_dominates(
                a in priority(),
                b in priority(),
                ta in 0i64..4_000_000_000_000,
                tb in 0i64..4_000_000_000_000,
            ) {
                let sa = LaneScore::new(a, Utc.timestamp_millis_opt(ta).unwrap());
                let sb = LaneScore::new(b, Utc.timestamp_millis_opt(tb).unwrap());
                if a.rank() < b.rank() {
                    prop_assert!(sa < sb);
                } else if a == b {
                    prop_assert_eq!(sa.cmp(&sb), ta.cmp(&tb));
                }
            }

            /// Property: scores survive the f64 round trip a sorted set imposes.
            #[test]
            fn score_is_exact_as_f64(p in priority(), t in 0i64..4_000_000_000_000) {
                let s = LaneScore::new(p, Utc.timestamp_millis_opt(t).unwrap());
                prop_assert_eq!(s.as_f64() as u64, s.raw());
            }
        }
    }
}
