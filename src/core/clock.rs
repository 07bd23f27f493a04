//! Snapshot identifiers and the clock that produces them.
//!
//! Identifiers are `YYYYMMDD_HHmmss` in local time. A snapshot created in the
//! same second as (or, after a clock step backwards, earlier than) the
//! newest one gets a `_NNN` suffix on the newest base, so identifiers of one
//! category always sort in creation order. Once a base has used all its
//! suffixes the next identifier moves on to the following second.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// chrono format of the identifier base.
pub const ID_FORMAT: &str = "%Y%m%d_%H%M%S";

const BASE_LEN: usize = 15; // YYYYMMDD_HHmmss
const MAX_SUFFIX: u32 = 999;

/// Sortable snapshot identifier (also the snapshot's directory name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Parse a directory name; `None` for anything that is not an identifier.
    pub fn parse(s: &str) -> Option<Self> {
        let base = s.get(..BASE_LEN)?;
        NaiveDateTime::parse_from_str(base, ID_FORMAT).ok()?;
        match &s[BASE_LEN..] {
            "" => Some(Self(s.to_string())),
            rest => {
                let digits = rest.strip_prefix('_')?;
                if digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()) {
                    Some(Self(s.to_string()))
                } else {
                    None
                }
            }
        }
    }

    fn from_time(now: DateTime<Local>) -> Self {
        Self(now.format(ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Second-resolution part, without the disambiguation suffix.
    pub fn base(&self) -> &str {
        &self.0[..BASE_LEN]
    }

    /// Disambiguation counter (0 when absent).
    pub fn suffix(&self) -> u32 {
        self.0
            .get(BASE_LEN + 1..)
            .and_then(|d| d.parse().ok())
            .unwrap_or(0)
    }

    /// Wall-clock time encoded in the identifier.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.base(), ID_FORMAT).ok()
    }

    /// Smallest identifier that sorts after `self`: the next suffix, or the
    /// following second when the suffixes are used up.
    fn successor(&self) -> Option<Self> {
        let next = self.suffix() + 1;
        if next <= MAX_SUFFIX {
            return Some(Self(format!("{}_{next:03}", self.base())));
        }
        let later = self.created_at()? + TimeDelta::seconds(1);
        Some(Self(later.format(ID_FORMAT).to_string()))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SnapshotId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier for a snapshot created at `now`, given the newest existing one.
///
/// Returns `None` only when `latest` does not encode a valid time.
pub fn next_id(now: DateTime<Local>, latest: Option<&SnapshotId>) -> Option<SnapshotId> {
    let candidate = SnapshotId::from_time(now);
    match latest {
        Some(latest) if candidate <= *latest => latest.successor(),
        _ => Some(candidate),
    }
}

/// Source of wall-clock time for identifiers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = t;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, h, m, s).single().unwrap()
    }

    #[test]
    fn parse_accepts_base_and_suffix() {
        assert!(SnapshotId::parse("20231024_153000").is_some());
        assert_eq!(SnapshotId::parse("20231024_153000_007").unwrap().suffix(), 7);
        assert!(SnapshotId::parse("20231024_153000_7").is_none());
        assert!(SnapshotId::parse("20231399_153000").is_none());
        assert!(SnapshotId::parse("meta.json").is_none());
        assert!(SnapshotId::parse(".partial").is_none());
    }

    #[test]
    fn same_second_gets_suffix() {
        let first = next_id(at(12, 0, 0), None).unwrap();
        let second = next_id(at(12, 0, 0), Some(&first)).unwrap();
        let third = next_id(at(12, 0, 0), Some(&second)).unwrap();
        assert_eq!(first.as_str(), "20240309_120000");
        assert_eq!(second.as_str(), "20240309_120000_001");
        assert_eq!(third.as_str(), "20240309_120000_002");
        assert!(first < second && second < third);
    }

    #[test]
    fn clock_step_back_still_sorts_after() {
        let latest = next_id(at(12, 0, 5), None).unwrap();
        let next = next_id(at(11, 59, 0), Some(&latest)).unwrap();
        assert!(next > latest);
        assert_eq!(next.base(), latest.base());
    }

    #[test]
    fn exhausted_second_rolls_into_the_next() {
        let full = SnapshotId::parse("20240309_120000_999").unwrap();
        let next = next_id(at(12, 0, 0), Some(&full)).unwrap();
        assert_eq!(next.as_str(), "20240309_120001");
        assert!(next > full);

        // The clock has not caught up yet; keep stacking on the borrowed second
        let after = next_id(at(12, 0, 0), Some(&next)).unwrap();
        assert_eq!(after.as_str(), "20240309_120001_001");

        let midnight = SnapshotId::parse("20241231_235959_999").unwrap();
        let rolled = next_id(at(12, 0, 0), Some(&midnight)).unwrap();
        assert_eq!(rolled.as_str(), "20250101_000000");
    }

    #[test]
    fn id_serializes_as_plain_string() {
        let id = next_id(at(12, 0, 0), None).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"20240309_120000\"");
        let back: SnapshotId = serde_json::from_str("\"20240309_120000_004\"").unwrap();
        assert_eq!(back.suffix(), 4);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(at(1, 0, 0));
        clock.advance(TimeDelta::seconds(90));
        assert_eq!(clock.now(), at(1, 1, 30));
    }

    proptest! {
        #[test]
        fn ids_strictly_increase(steps in proptest::collection::vec(-3i64..4, 1..60)) {
            let clock = ManualClock::new(at(8, 0, 0));
            let mut latest: Option<SnapshotId> = None;
            for step in steps {
                clock.advance(TimeDelta::seconds(step));
                let id = next_id(clock.now(), latest.as_ref()).unwrap();
                if let Some(prev) = &latest {
                    prop_assert!(id > *prev);
                }
                prop_assert!(SnapshotId::parse(id.as_str()).is_some());
                latest = Some(id);
            }
        }

        #[test]
        fn ids_increase_across_suffix_rollover(start in 950u32..=999, count in 1usize..120) {
            let mut latest = SnapshotId::parse(&format!("20240309_120000_{start:03}")).unwrap();
            for _ in 0..count {
                let id = next_id(at(12, 0, 0), Some(&latest)).unwrap();
                prop_assert!(id > latest);
                prop_assert!(SnapshotId::parse(id.as_str()).is_some());
                latest = id;
            }
        }
    }
}
