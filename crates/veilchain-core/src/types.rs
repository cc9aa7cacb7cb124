use chrono::{DateTime, SubsecRound, Utc};

/// UTC instant with microsecond precision. Block timestamps are truncated
/// to microseconds at append time so the canonical encoding round-trips
/// through the persisted form byte for byte.
pub type Timestamp = DateTime<Utc>;

/// Truncate a timestamp to microsecond precision (6 fractional digits).
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

/// The canonical textual form of a timestamp used inside hashed block
/// content: ISO-8601 UTC with exactly six fractional digits.
///
/// Example: `2026-08-01T12:34:56.000123Z`
pub fn canonical_timestamp(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_timestamp_has_six_fraction_digits() {
        let ts = Utc.with_ymd_and_hms(2026, 8, 1, 12, 34, 56).unwrap();
        assert_eq!(canonical_timestamp(&ts), "2026-08-01T12:34:56.000000Z");
    }

    #[test]
    fn truncation_drops_nanoseconds() {
        let ts = Utc
            .timestamp_opt(1_000_000, 123_456_789)
            .single()
            .unwrap();
        let t = truncate_to_micros(ts);
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(canonical_timestamp(&truncate_to_micros(t)), canonical_timestamp(&t));
    }
}
