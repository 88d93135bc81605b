//! Calendar-month buckets used as secondary-index partition keys
//!
//! A bucket is derived from the indexed timestamp itself, so a record stays
//! reachable through its bucket no matter when it was written. Scans walk
//! backwards from the bucket of the query bound down to the oldest bucket the
//! backend reports as populated.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// Month bucket, rendered as `YYYYMM`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TimeBucket {
    year: i32,
    month: u32,
}

impl TimeBucket {
    /// Create a bucket, `None` unless `month` is in `1..=12` and `year` in `0..=9999`
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((0..=9999).contains(&year) && (1..=12).contains(&month)).then_some(Self { year, month })
    }

    /// Bucket containing the given instant
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Bucket containing the given epoch milliseconds
    pub fn containing_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self::containing)
    }

    /// Calendar year
    pub fn year(&self) -> i32 {
        self.year
    }

    /// Month of the year, `1..=12`
    pub fn month(&self) -> u32 {
        self.month
    }

    /// The month before this one
    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// This bucket and every bucket before it down to `floor`, newest first.
    /// Empty when `floor` is later than this bucket.
    pub fn down_to(self, floor: TimeBucket) -> impl Iterator<Item = TimeBucket> {
        std::iter::successors((floor <= self).then_some(self), move |b| {
            (*b > floor).then(|| b.previous())
        })
    }

    /// Render as `YYYYMM`
    pub fn label(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Parse a `YYYYMM` label
    pub fn parse(label: &str) -> Option<Self> {
        if label.len() != 6 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = label[..4].parse().ok()?;
        let month = label[4..].parse().ok()?;
        Self::new(year, month)
    }
}

impl std::fmt::Debug for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TimeBucket({})", self.label())
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl From<TimeBucket> for String {
    fn from(bucket: TimeBucket) -> Self {
        bucket.label()
    }
}

impl TryFrom<String> for TimeBucket {
    type Error = Box<str>;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        Self::parse(&label).ok_or_else(|| format!("invalid time bucket label: {label}").into())
    }
}
