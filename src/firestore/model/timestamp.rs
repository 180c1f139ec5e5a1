use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::firestore::error::{invalid_argument, FirestoreResult};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Point in time with nanosecond precision, normalised so `nanos` is in `[0, 1e9)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let carry = nanos.div_euclid(NANOS_PER_SECOND);
        Self {
            seconds: seconds + i64::from(carry),
            nanos: nanos.rem_euclid(NANOS_PER_SECOND),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_millis(millis: i64) -> Self {
        let seconds = millis.div_euclid(1_000);
        let nanos = (millis.rem_euclid(1_000) * 1_000_000) as i32;
        Self { seconds, nanos }
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH
                + Duration::from_secs(self.seconds as u64)
                + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs())
                + Duration::from_nanos(self.nanos as u64)
        }
    }

    /// Parses the RFC 3339 strings used on the wire (`2024-01-02T03:04:05.123456Z`).
    pub fn from_rfc3339(value: &str) -> FirestoreResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp '{value}': {err}")))?;
        let utc = parsed.with_timezone(&Utc);
        Ok(Self::new(utc.timestamp(), utc.timestamp_subsec_nanos() as i32))
    }

    pub fn to_rfc3339(&self) -> String {
        match DateTime::<Utc>::from_timestamp(self.seconds, self.nanos as u32) {
            Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => format!("{}.{:09}", self.seconds, self.nanos),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}
