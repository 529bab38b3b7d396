use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Current wall-clock time as naive UTC.
///
/// All persisted timestamps in the cache directory are naive UTC so they can
/// be compared directly against the library file's mtime (also converted to
/// UTC before the timezone is stripped). Mixing local time in here causes
/// false "library changed" detections on non-UTC machines.
pub fn utc_now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Converts a filesystem mtime to naive UTC for snapshot comparisons.
pub fn system_time_to_naive_utc(time: std::time::SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(time).naive_utc()
}

/// Parses a stored run/verify timestamp, tolerating the formats this tool
/// has written over its lifetime: RFC 3339, ISO-8601 without offset,
/// `YYYY-MM-DD HH:MM:SS`, and bare `YYYY-MM-DD`. Naive values are assumed
/// to be UTC.
pub fn parse_stored_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }

    None
}

/// ISO-8601 rendering used for every timestamp this tool writes.
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let parsed = parse_stored_timestamp("2024-06-15T10:00:00+02:00").expect("parse");
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2024, 6, 15).unwrap().and_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_naive_iso() {
        let parsed = parse_stored_timestamp("2024-06-15T10:00:00.123456").expect("parse");
        assert_eq!(parsed.and_utc().timestamp_subsec_micros(), 123456);
    }

    #[test]
    fn test_parse_legacy_space_format() {
        let parsed = parse_stored_timestamp("2024-01-02 03:04:05").expect("parse");
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap());
    }

    #[test]
    fn test_parse_date_only() {
        let parsed = parse_stored_timestamp("2023-12-31").expect("parse");
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert!(parse_stored_timestamp("not a timestamp").is_none());
        assert!(parse_stored_timestamp("").is_none());
        assert!(parse_stored_timestamp("   ").is_none());
    }

    #[test]
    fn test_format_round_trips() {
        let now = utc_now_naive();
        let parsed = parse_stored_timestamp(&format_timestamp(now)).expect("round trip");
        // Formatting keeps microsecond precision.
        assert_eq!(parsed.and_utc().timestamp_micros(), now.and_utc().timestamp_micros());
    }
}
