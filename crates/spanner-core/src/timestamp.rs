//! Backend timestamps and read staleness bounds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A backend-assigned point in time, relative to the Unix epoch.
///
/// Textual form is `<seconds>.<nanoseconds>` with nine fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: i64,
    nanos: u32,
}

impl Timestamp {
    /// Create a timestamp. Nanoseconds beyond one second carry into `seconds`.
    pub const fn new(seconds: i64, nanos: u32) -> Self {
        Self {
            seconds: seconds + (nanos / 1_000_000_000) as i64,
            nanos: nanos % 1_000_000_000,
        }
    }

    /// Create a timestamp from microseconds since the epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Self {
            seconds: micros.div_euclid(1_000_000),
            nanos: (micros.rem_euclid(1_000_000) * 1_000) as u32,
        }
    }

    /// Whole seconds since the epoch.
    pub const fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Sub-second nanoseconds.
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (secs, frac) = s.split_once('.').unwrap_or((s, ""));
        let seconds = secs
            .parse::<i64>()
            .map_err(|_| invalid_hint(format!("invalid timestamp seconds: '{s}'")))?;
        if frac.len() > 9 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid_hint(format!("invalid timestamp fraction: '{s}'")));
        }
        let nanos = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<9}");
            padded
                .parse::<u32>()
                .map_err(|_| invalid_hint(format!("invalid timestamp fraction: '{s}'")))?
        };
        Ok(Self::new(seconds, nanos))
    }
}

/// Read staleness policy attached to a query.
///
/// Inside a read/write transaction every read is strong, but a bound supplied
/// by the caller is still forwarded to the backend and recorded so that a
/// replay re-issues the query exactly as it was first issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimestampBound {
    /// Read the latest committed data
    #[default]
    Strong,
    /// Read data exactly this old
    ExactStaleness(Duration),
    /// Read data at most this old, chosen by the backend
    MaxStaleness(Duration),
    /// Read data at exactly this timestamp
    ReadTimestamp(Timestamp),
    /// Read data at or after this timestamp, chosen by the backend
    MinReadTimestamp(Timestamp),
}

impl TimestampBound {
    /// Check if this bound requires the latest data.
    pub const fn is_strong(&self) -> bool {
        matches!(self, TimestampBound::Strong)
    }
}

impl fmt::Display for TimestampBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimestampBound::Strong => f.write_str("STRONG"),
            TimestampBound::ExactStaleness(d) => write!(f, "EXACT_STALENESS {}", format_duration(*d)),
            TimestampBound::MaxStaleness(d) => write!(f, "MAX_STALENESS {}", format_duration(*d)),
            TimestampBound::ReadTimestamp(ts) => write!(f, "READ_TIMESTAMP {ts}"),
            TimestampBound::MinReadTimestamp(ts) => write!(f, "MIN_READ_TIMESTAMP {ts}"),
        }
    }
}

impl FromStr for TimestampBound {
    type Err = Error;

    /// Parse the hint form, e.g. `STRONG`, `EXACT_STALENESS 10s`,
    /// `MAX_STALENESS 250ms`, `READ_TIMESTAMP 1700000000.000000001`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (mode, arg) = match s.split_once(char::is_whitespace) {
            Some((mode, arg)) => (mode, Some(arg.trim())),
            None => (s, None),
        };
        let mode = mode.to_ascii_uppercase();
        match (mode.as_str(), arg) {
            ("STRONG", None) => Ok(TimestampBound::Strong),
            ("EXACT_STALENESS", Some(arg)) => Ok(TimestampBound::ExactStaleness(parse_duration(arg)?)),
            ("MAX_STALENESS", Some(arg)) => Ok(TimestampBound::MaxStaleness(parse_duration(arg)?)),
            ("READ_TIMESTAMP", Some(arg)) => Ok(TimestampBound::ReadTimestamp(arg.parse()?)),
            ("MIN_READ_TIMESTAMP", Some(arg)) => Ok(TimestampBound::MinReadTimestamp(arg.parse()?)),
            _ => Err(invalid_hint(format!("invalid timestamp bound: '{s}'"))),
        }
    }
}

fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{nanos}ns")
    }
}

fn parse_duration(s: &str) -> Result<Duration, Error> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid_hint(format!("duration is missing a unit: '{s}'")))?;
    let (amount, unit) = s.split_at(split);
    let amount = amount
        .parse::<u64>()
        .map_err(|_| invalid_hint(format!("invalid duration: '{s}'")))?;
    match unit {
        "s" => Ok(Duration::from_secs(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "us" => Ok(Duration::from_micros(amount)),
        "ns" => Ok(Duration::from_nanos(amount)),
        _ => Err(invalid_hint(format!("invalid duration unit in '{s}'"))),
    }
}

fn invalid_hint(message: String) -> Error {
    Error::InvalidArgument(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_normalizes_nanos() {
        let ts = Timestamp::new(10, 1_500_000_000);
        assert_eq!(ts.seconds(), 11);
        assert_eq!(ts.nanos(), 500_000_000);
    }

    #[test]
    fn test_timestamp_from_negative_micros() {
        let ts = Timestamp::from_micros(-1);
        assert_eq!(ts.seconds(), -1);
        assert_eq!(ts.nanos(), 999_999_000);
    }

    #[test]
    fn test_timestamp_text_form() {
        let ts = Timestamp::new(1_700_000_000, 42);
        assert_eq!(ts.to_string(), "1700000000.000000042");
        assert_eq!("1700000000.000000042".parse::<Timestamp>().unwrap(), ts);
        assert_eq!(
            "12.5".parse::<Timestamp>().unwrap(),
            Timestamp::new(12, 500_000_000)
        );
        assert!("12.x".parse::<Timestamp>().is_err());
        assert!("12.0000000001".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(1, 999) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 1) > Timestamp::new(2, 0));
    }

    #[test]
    fn test_parse_bounds() {
        assert_eq!("strong".parse::<TimestampBound>().unwrap(), TimestampBound::Strong);
        assert_eq!(
            "EXACT_STALENESS 10s".parse::<TimestampBound>().unwrap(),
            TimestampBound::ExactStaleness(Duration::from_secs(10))
        );
        assert_eq!(
            "MAX_STALENESS 250ms".parse::<TimestampBound>().unwrap(),
            TimestampBound::MaxStaleness(Duration::from_millis(250))
        );
        assert_eq!(
            "READ_TIMESTAMP 5.000000001".parse::<TimestampBound>().unwrap(),
            TimestampBound::ReadTimestamp(Timestamp::new(5, 1))
        );
    }

    #[test]
    fn test_parse_bound_errors() {
        assert!("STRONG 1s".parse::<TimestampBound>().is_err());
        assert!("EXACT_STALENESS".parse::<TimestampBound>().is_err());
        assert!("EXACT_STALENESS 10".parse::<TimestampBound>().is_err());
        assert!("MAX_STALENESS 10h".parse::<TimestampBound>().is_err());
        assert!("STALE".parse::<TimestampBound>().is_err());
    }

    #[test]
    fn test_bound_display_matches_parse() {
        let bounds = [
            TimestampBound::Strong,
            TimestampBound::ExactStaleness(Duration::from_micros(1500)),
            TimestampBound::MaxStaleness(Duration::from_secs(3)),
            TimestampBound::MinReadTimestamp(Timestamp::new(9, 7)),
        ];
        for bound in bounds {
            assert_eq!(bound.to_string().parse::<TimestampBound>().unwrap(), bound);
        }
    }
}
