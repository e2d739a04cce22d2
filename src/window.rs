//! Window clock: pure bucket arithmetic over wall-clock seconds.
//!
//! Maps a unix timestamp to the minute/hour/day bucket it falls in and
//! produces the counter-store keys for those buckets. Also derives the
//! calendar month used to key durable usage records. Everything here is
//! stateless; callers inject `now` so tests control time exactly.

use std::fmt;
use std::time::Duration;

/// Slack added to a counter's expiry beyond its bucket length, so a bucket
/// stays readable for diagnostics shortly after it closes.
pub const EXPIRY_GRACE_SECS: u64 = 60;

/// Rolling-window granularities a quota is enforced over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    /// All granularities, ordered shortest to longest. Index order matches
    /// the count arrays passed around by the admission controller.
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Hour, Granularity::Day];

    /// Length of one bucket in seconds.
    pub const fn seconds(self) -> u64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of the bucket `now` falls in: `floor(now / bucket_seconds)`.
pub fn bucket_index(granularity: Granularity, now: u64) -> u64 {
    now / granularity.seconds()
}

/// Counter-store key for a tenant's current bucket.
///
/// The index (not the raw timestamp) is part of the key, so every request in
/// the same bucket lands on the same counter and the key changes exactly at
/// the bucket boundary.
pub fn bucket_key(tenant: &str, granularity: Granularity, now: u64) -> String {
    format!("mg:{tenant}:{granularity}:{}", bucket_index(granularity, now))
}

/// Unix timestamp of the next bucket boundary strictly after `now`.
pub fn next_reset(granularity: Granularity, now: u64) -> u64 {
    (bucket_index(granularity, now) + 1) * granularity.seconds()
}

/// Expiry to set when a bucket's counter is first created.
pub fn counter_ttl(granularity: Granularity) -> Duration {
    Duration::from_secs(granularity.seconds() + EXPIRY_GRACE_SECS)
}

/// Calendar month a unix timestamp falls in, keying durable usage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BillingMonth {
    pub year: i64,
    /// 1-based month number.
    pub month: u8,
}

impl BillingMonth {
    pub fn from_unix(now: u64) -> Self {
        let (year, month, _) = civil_from_days((now / 86_400) as i64);
        Self { year, month }
    }

    /// `"YYYY-MM"` form used in record keys and log fields.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Days since 1970-01-01 to a Gregorian (year, month, day).
fn civil_from_days(z: i64) -> (i64, u8, u8) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u8, d as u8)
}
