//! Parsers for the string-valued job configuration keys that carry structure:
//! sharding item parameters and pause periods.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{CoordinationError, Result};

/// Logical shard id used by local-mode jobs.
pub const LOCAL_MODE_SHARD: i32 = -1;

/// Per-shard parameter table parsed from the `shardingItemParameters` key.
///
/// Wire format: comma-separated `key=value` elements, where commas inside
/// double-quoted values do not split. Keys are shard ids, or `*` for the
/// single local-mode shard, which maps to [`LOCAL_MODE_SHARD`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardingItemParameters {
    entries: BTreeMap<i32, String>,
}

impl ShardingItemParameters {
    pub fn parse(raw: &str, local_mode: bool) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if raw.trim().is_empty() {
            return Ok(Self { entries });
        }
        let mut keyed: BTreeMap<String, String> = BTreeMap::new();
        for element in split_outside_quotes(raw) {
            let Some((key, value)) = element.split_once('=') else {
                return Err(CoordinationError::Config(format!(
                    "sharding item parameters '{raw}' format error"
                )));
            };
            let mut value = value.trim();
            value = value.strip_prefix('"').unwrap_or(value);
            value = value.strip_suffix('"').unwrap_or(value);
            keyed.insert(key.trim().to_string(), value.to_string());
        }
        if local_mode {
            let Some(value) = keyed.get("*") else {
                return Err(CoordinationError::Config(format!(
                    "sharding item parameters '{raw}' for a local-mode job must use *=value"
                )));
            };
            entries.insert(LOCAL_MODE_SHARD, value.clone());
        } else {
            for (key, value) in keyed {
                let shard: i32 = key.parse().map_err(|_| {
                    CoordinationError::Config(format!(
                        "sharding item parameters key '{key}' is not an integer"
                    ))
                })?;
                entries.insert(shard, value);
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, shard: i32) -> Option<&str> {
        self.entries.get(&shard).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for ShardingItemParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (shard, value) in &self.entries {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            let key: String = if *shard == LOCAL_MODE_SHARD {
                "*".to_string()
            } else {
                shard.to_string()
            };
            if value.contains(',') {
                write!(f, "{key}=\"{value}\"")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

/// Split on commas that fall outside double-quoted runs.
fn split_outside_quotes(raw: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                elements.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    elements.push(current);
    elements
}

/// Inclusive month/day range, e.g. `3/1-3/15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateRange {
    from: (u32, u32),
    to: (u32, u32),
}

/// Inclusive hour/minute range, e.g. `9:00-17:30`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimeRange {
    from: (u32, u32),
    to: (u32, u32),
}

/// Pause windows parsed from `pausePeriodDate` / `pausePeriodTime`,
/// evaluated in the job's time zone.
///
/// A timestamp is paused iff the date dimension is empty or matches, AND the
/// time dimension is empty or matches. Both empty means never paused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PausePeriod {
    dates: Vec<DateRange>,
    times: Vec<TimeRange>,
}

impl PausePeriod {
    pub fn parse(date_spec: &str, time_spec: &str) -> Result<Self> {
        let mut dates = Vec::new();
        for period in non_empty_periods(date_spec) {
            let (left, right) = split_range(&period)?;
            dates.push(DateRange {
                from: parse_pair(left, '/', 1..=12, 1..=31)?,
                to: parse_pair(right, '/', 1..=12, 1..=31)?,
            });
        }
        let mut times = Vec::new();
        for period in non_empty_periods(time_spec) {
            let (left, right) = split_range(&period)?;
            times.push(TimeRange {
                from: parse_pair(left, ':', 0..=23, 0..=59)?,
                to: parse_pair(right, ':', 0..=23, 0..=59)?,
            });
        }
        Ok(Self { dates, times })
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() && self.times.is_empty()
    }

    /// Whether `at` falls inside a pause window, evaluated in `tz`.
    pub fn contains(&self, at: DateTime<Utc>, tz: Tz) -> bool {
        if self.is_empty() {
            return false;
        }
        let local = tz.from_utc_datetime(&at.naive_utc());
        let month_day = (local.month(), local.day());
        let hour_minute = (local.hour(), local.minute());

        let date_in = self.dates.is_empty()
            || self
                .dates
                .iter()
                .any(|range| range.from <= month_day && month_day <= range.to);
        let time_in = self.times.is_empty()
            || self
                .times
                .iter()
                .any(|range| range.from <= hour_minute && hour_minute <= range.to);
        date_in && time_in
    }
}

fn non_empty_periods(spec: &str) -> Vec<String> {
    if spec.trim().is_empty() {
        return Vec::new();
    }
    spec.split(',').map(|period| period.trim().to_string()).collect()
}

fn split_range(period: &str) -> Result<(&str, &str)> {
    let mut parts = period.split('-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(left), Some(right), None) => Ok((left.trim(), right.trim())),
        _ => Err(CoordinationError::Config(format!(
            "pause period '{period}' must be <from>-<to>"
        ))),
    }
}

fn parse_pair(
    value: &str,
    separator: char,
    major: std::ops::RangeInclusive<u32>,
    minor: std::ops::RangeInclusive<u32>,
) -> Result<(u32, u32)> {
    let bad = || CoordinationError::Config(format!("pause period element '{value}' is malformed"));
    let (a, b) = value.split_once(separator).ok_or_else(bad)?;
    let a: u32 = a.trim().parse().map_err(|_| bad())?;
    let b: u32 = b.trim().parse().map_err(|_| bad())?;
    if major.contains(&a) && minor.contains(&b) {
        Ok((a, b))
    } else {
        Err(bad())
    }
}

/// Resolve a `timeZone` config value to an IANA zone, defaulting to UTC for
/// an empty value. Unknown names are a configuration error.
pub fn parse_time_zone(name: &str) -> Result<Tz> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Ok(chrono_tz::UTC);
    }
    trimmed
        .parse()
        .map_err(|_| CoordinationError::Config(format!("unknown time zone '{trimmed}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_parameters() {
        let params = ShardingItemParameters::parse("0=a,1=b,2=c", false).unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params.get(0), Some("a"));
        assert_eq!(params.get(2), Some("c"));
    }

    #[test]
    fn test_parse_quoted_value_keeps_commas() {
        let params = ShardingItemParameters::parse("0=\"a,b\",1=c", false).unwrap();
        assert_eq!(params.get(0), Some("a,b"));
        assert_eq!(params.get(1), Some("c"));
    }

    #[test]
    fn test_parse_local_mode_star() {
        let params = ShardingItemParameters::parse("*=payload", true).unwrap();
        assert_eq!(params.get(LOCAL_MODE_SHARD), Some("payload"));
    }

    #[test]
    fn test_local_mode_without_star_fails() {
        assert!(ShardingItemParameters::parse("0=a", true).is_err());
    }

    #[test]
    fn test_missing_equals_fails() {
        assert!(ShardingItemParameters::parse("0=a,broken", false).is_err());
    }

    #[test]
    fn test_non_integer_key_fails() {
        assert!(ShardingItemParameters::parse("x=a", false).is_err());
    }

    #[test]
    fn test_round_trip_identity() {
        for raw in ["0=a,1=b", "0=\"a,b\",1=c", "*=payload"] {
            let local = raw.starts_with('*');
            let parsed = ShardingItemParameters::parse(raw, local).unwrap();
            let serialized = parsed.to_string();
            let reparsed = ShardingItemParameters::parse(&serialized, local).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {raw}");
        }
    }

    #[test]
    fn test_empty_parameters() {
        let params = ShardingItemParameters::parse("", false).unwrap();
        assert!(params.is_empty());
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_pause_both_empty_never_pauses() {
        let period = PausePeriod::parse("", "").unwrap();
        assert!(!period.contains(utc(2024, 6, 1, 12, 0), chrono_tz::UTC));
    }

    #[test]
    fn test_pause_date_only() {
        let period = PausePeriod::parse("6/1-6/15", "").unwrap();
        assert!(period.contains(utc(2024, 6, 10, 3, 0), chrono_tz::UTC));
        assert!(period.contains(utc(2024, 6, 1, 0, 0), chrono_tz::UTC));
        assert!(period.contains(utc(2024, 6, 15, 23, 59), chrono_tz::UTC));
        assert!(!period.contains(utc(2024, 6, 16, 0, 0), chrono_tz::UTC));
    }

    #[test]
    fn test_pause_time_only_multiple_ranges() {
        let period = PausePeriod::parse("", "9:00-11:30,14:00-15:00").unwrap();
        assert!(period.contains(utc(2024, 1, 1, 10, 15), chrono_tz::UTC));
        assert!(period.contains(utc(2024, 1, 1, 14, 0), chrono_tz::UTC));
        assert!(!period.contains(utc(2024, 1, 1, 12, 0), chrono_tz::UTC));
    }

    #[test]
    fn test_pause_requires_both_dimensions_when_both_set() {
        let period = PausePeriod::parse("6/1-6/15", "9:0-17:0").unwrap();
        assert!(period.contains(utc(2024, 6, 10, 12, 0), chrono_tz::UTC));
        assert!(!period.contains(utc(2024, 6, 10, 20, 0), chrono_tz::UTC));
        assert!(!period.contains(utc(2024, 7, 10, 12, 0), chrono_tz::UTC));
    }

    #[test]
    fn test_pause_respects_time_zone() {
        let period = PausePeriod::parse("", "9:00-17:00").unwrap();
        // 01:00 UTC is 09:00 in Shanghai.
        let at = utc(2024, 6, 10, 1, 0);
        assert!(period.contains(at, chrono_tz::Asia::Shanghai));
        assert!(!period.contains(at, chrono_tz::UTC));
    }

    #[test]
    fn test_pause_malformed_is_error() {
        assert!(PausePeriod::parse("6/1", "").is_err());
        assert!(PausePeriod::parse("6/1-6/15-6/20", "").is_err());
        assert!(PausePeriod::parse("", "25:00-26:00").is_err());
        assert!(PausePeriod::parse("x/y-1/2", "").is_err());
    }

    #[test]
    fn test_time_zone_parsing() {
        assert_eq!(parse_time_zone("").unwrap(), chrono_tz::UTC);
        assert_eq!(
            parse_time_zone("Asia/Shanghai").unwrap(),
            chrono_tz::Asia::Shanghai
        );
        assert!(parse_time_zone("Not/AZone").is_err());
    }
}
