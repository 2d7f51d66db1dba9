use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Naive layouts seen in the wild, interpreted as UTC
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d %b %Y %H:%M:%S",
    "%a, %d %b %Y %H:%M:%S",
];

/// Parse a feed timestamp leniently.
///
/// Tries RFC 2822 and RFC 3339 first, then a handful of naive layouts
/// (treated as UTC) and bare dates. Returns `None` for anything else so an
/// unparseable date is never mistaken for a real one.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    // "Mon, 01 Jan 2024 10:00:00 UTC" and friends: chrono only knows numeric
    // offsets and GMT/UT in RFC 2822.
    let without_zone = trimmed
        .strip_suffix(" UTC")
        .or_else(|| trimmed.strip_suffix(" GMT"))
        .or_else(|| trimmed.strip_suffix('Z'))
        .unwrap_or(trimmed);

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_zone, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(without_zone, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_rfc2822() {
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 10:00:00 +0000"),
            Some(utc(2024, 1, 1, 10, 0, 0))
        );
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 10:00:00 GMT"),
            Some(utc(2024, 1, 1, 10, 0, 0))
        );
    }

    #[test]
    fn test_rfc3339_with_offset() {
        assert_eq!(
            parse_timestamp("2024-01-01T12:00:00+02:00"),
            Some(utc(2024, 1, 1, 10, 0, 0))
        );
    }

    #[test]
    fn test_named_utc_zone() {
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 10:00:00 UTC"),
            Some(utc(2024, 1, 1, 10, 0, 0))
        );
    }

    #[test]
    fn test_naive_layouts() {
        assert_eq!(
            parse_timestamp("2024-01-01 10:00:00"),
            Some(utc(2024, 1, 1, 10, 0, 0))
        );
        assert_eq!(parse_timestamp("2024-01-01"), Some(utc(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_garbage_is_unknown() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("   "), None);
        assert_eq!(parse_timestamp("yesterday-ish"), None);
        assert_eq!(parse_timestamp("2024-13-45"), None);
    }
}
