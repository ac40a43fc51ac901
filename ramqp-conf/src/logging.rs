use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub to: To,
    #[serde(default)]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self { to: To::default(), level: Level::default(), dir: Self::dir_default(), file: Self::file_default() }
    }
}

impl Log {
    #[inline]
    fn dir_default() -> String {
        "/var/log/ramqp".into()
    }

    #[inline]
    fn file_default() -> String {
        "ramqp.log".into()
    }

    /// Full path of the log file, empty when no file is configured.
    #[inline]
    pub fn filename(&self) -> String {
        if self.file.is_empty() {
            return String::new();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        if dir.is_empty() {
            self.file.clone()
        } else {
            format!("{}/{}", dir, self.file)
        }
    }
}

/// Where log records are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum To {
    Off,
    File,
    #[default]
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }

    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl FromStr for To {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(To::Off),
            "file" => Ok(To::File),
            "console" => Ok(To::Console),
            "both" => Ok(To::Both),
            other => Err(format!("unknown log target: {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// Minimum severity, wrapping the slog level so the logger can filter on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(pub slog::Level);

impl Default for Level {
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        slog::Level::from_str(&level).map(Level).map_err(|_| de::Error::custom(format!("unknown log level: {level}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename() {
        let mut log = Log::default();
        assert_eq!(log.filename(), "/var/log/ramqp/ramqp.log");
        log.dir = String::new();
        assert_eq!(log.filename(), "ramqp.log");
        log.file = String::new();
        assert_eq!(log.filename(), "");
    }

    #[test]
    fn targets() {
        assert_eq!("BOTH".parse::<To>(), Ok(To::Both));
        assert!("syslog".parse::<To>().is_err());
        assert!(To::Both.file() && To::Both.console());
        assert!(To::Off.off());
    }
}
