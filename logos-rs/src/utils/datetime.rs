//! DateTime parsing helpers for hand-edited knowledgebase documents.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// Parse a datetime string in various common formats into a UTC [`DateTime`].
///
/// Supported formats (attempted in order):
/// 1. RFC 3339 / ISO 8601 with timezone: `"2024-01-15T10:30:00Z"`
/// 2. ISO 8601 with sub-seconds but no timezone: `"2024-01-15T10:30:00.123"`
/// 3. ISO 8601 without timezone (assumed UTC): `"2024-01-15T10:30:00"`
/// 4. Date only (midnight UTC): `"2024-01-15"`
///
/// Returns `None` for empty input or unrecognised formats.
pub fn parse_flexible_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&ndt));
    }

    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ndt));
    }

    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return nd
            .and_hms_opt(0, 0, 0)
            .map(|ndt| Utc.from_utc_datetime(&ndt));
    }

    None
}

/// Serde adapter for `Option<DateTime<Utc>>` fields that people edit by hand.
///
/// Serialises as RFC 3339 and accepts anything [`parse_flexible_datetime`]
/// understands, so `last_used: 2024-01-15` in YAML loads as midnight UTC.
pub mod flexible_option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => super::parse_flexible_datetime(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("unrecognised datetime '{s}'"))),
        }
    }
}
