//! Small shared building blocks used across the ramqp crates.
//!
//! - [`Counter`]: atomic gauge that remembers its high-water mark
//! - [`Bytesize`]: `"64M"` / `"1G512K"` style sizes for configuration
//! - duration parsing (`"1h30m"`, `"500ms"`) and serde helpers
//! - wall-clock timestamps in milliseconds
//!
//! ```
//! use ramqp_utils::{to_bytesize, to_duration, Bytesize};
//!
//! assert_eq!(to_bytesize("1M512K"), 1_572_864);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(Bytesize::from("2K").to_string(), "2K");
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

mod counter;

pub use counter::Counter;

/// Broker node identifier.
pub type NodeId = u64;

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

const KB: usize = 1 << 10;
const MB: usize = 1 << 20;
const GB: usize = 1 << 30;

/// Byte count that reads and writes as `"<n>G<n>M<n>K<n>B"`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0B");
        }
        let mut rest = self.0;
        for (unit, scale) in [("G", GB), ("M", MB), ("K", KB), ("B", 1)] {
            let n = rest / scale;
            if n > 0 {
                write!(f, "{}{}", n, unit)?;
                rest %= scale;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Bytesize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Bytesize(to_bytesize(&String::deserialize(deserializer)?)))
    }
}

/// Parses `"2G512M"`, `"64KB"` or a bare number of bytes. Unparseable
/// segments count as zero.
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(n) = text.parse::<usize>() {
        return n;
    }
    let mut total = 0usize;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let scale = match c {
            'G' => GB,
            'M' => MB,
            'K' => KB,
            'B' => 1,
            _ => 0,
        };
        total += digits.parse::<usize>().unwrap_or(0) * scale;
        digits.clear();
    }
    total
}

/// Parses `"1h30m15s"`, `"250ms"`, `"2d"` or a bare number of seconds.
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    let mut millis = 0u64;
    let mut digits = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n = digits.parse::<u64>().unwrap_or(0);
        digits.clear();
        millis += match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                n
            }
            's' => n * 1_000,
            'm' => n * 60_000,
            'h' => n * 3_600_000,
            'd' => n * 86_400_000,
            'w' => n * 604_800_000,
            _ => 0,
        };
    }
    Duration::from_millis(millis)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Accepts either a number or a string such as `"unlimited"` / `""`, which map to `None`.
pub fn deserialize_limit<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Limit {
        Num(u32),
        Text(String),
    }
    match Limit::deserialize(deserializer)? {
        Limit::Num(n) => Ok(Some(n)),
        Limit::Text(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("unlimited") {
                Ok(None)
            } else {
                s.parse::<u32>().map(Some).map_err(de::Error::custom)
            }
        }
    }
}

#[inline]
pub fn timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    timestamp().as_millis() as TimestampMillis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize() {
        assert_eq!(to_bytesize("2G512M"), 2 * GB + 512 * MB);
        assert_eq!(to_bytesize("64kb"), 64 * KB);
        assert_eq!(to_bytesize("1024"), 1024);
        assert_eq!(to_bytesize("junk"), 0);
        assert_eq!(Bytesize(2 * GB + MB + 3).to_string(), "2G1M3B");
        assert_eq!(Bytesize(0).to_string(), "0B");
    }

    #[test]
    fn duration() {
        assert_eq!(to_duration("1h30m15s"), Duration::from_secs(5415));
        assert_eq!(to_duration("250ms"), Duration::from_millis(250));
        assert_eq!(to_duration("1m500ms"), Duration::from_millis(60_500));
        assert_eq!(to_duration("2w"), Duration::from_secs(2 * 7 * 86_400));
        assert_eq!(to_duration("30"), Duration::from_secs(30));
    }

    #[test]
    fn limit() {
        #[derive(Deserialize)]
        struct L {
            #[serde(deserialize_with = "deserialize_limit")]
            v: Option<u32>,
        }
        let l: L = serde_json::from_str(r#"{"v": 10}"#).unwrap();
        assert_eq!(l.v, Some(10));
        let l: L = serde_json::from_str(r#"{"v": "unlimited"}"#).unwrap();
        assert_eq!(l.v, None);
        let l: L = serde_json::from_str(r#"{"v": "7"}"#).unwrap();
        assert_eq!(l.v, Some(7));
    }

    #[test]
    fn timestamps() {
        let before = timestamp_millis();
        assert!(before > 0);
        assert!(timestamp().as_millis() as TimestampMillis >= before);
    }
}
