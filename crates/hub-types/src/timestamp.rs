use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// An instant together with the text it was written as.
///
/// Ordering and storage use the instant. Serialization gives back the
/// original text unchanged, so a client-supplied `created_at` echoes
/// exactly as submitted, offset and fractional digits included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    instant: DateTime<Utc>,
    text: String,
}

impl Timestamp {
    /// Current server time, rendered in UTC.
    pub fn now() -> Self {
        Self::from_instant(Utc::now())
    }

    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        Self {
            instant,
            text: instant.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True if the UTC year has four digits. Anything else cannot be
    /// stored as a sortable RFC 3339 string.
    pub fn is_storable(&self) -> bool {
        (0..=9999).contains(&self.instant.year())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: DateTime<FixedOffset> = s.parse()?;
        Ok(Self {
            instant: parsed.with_timezone(&Utc),
            text: s.to_string(),
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
