//! Emission formatting (§4.4).

use chrono::{DateTime, Utc};

/// Format one emission line: `[<ISO-8601 UTC of score>] (<signed delta>) <text>`.
///
/// `now_ms` and `score_ms` are both epoch milliseconds; the delta is
/// `now - score`, always signed and explicit (`+12 ms` / `-3 ms`).
pub fn format_emission(score_ms: i64, now_ms: i64, text: &str) -> String {
    let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(score_ms).unwrap_or_else(|| {
        // A due-time so far out of range it can't be represented is treated
        // as the epoch rather than panicking the inspection loop over a
        // formatting concern.
        DateTime::from_timestamp(0, 0).unwrap()
    });
    let delta_ms = now_ms - score_ms;
    format!(
        "[{}] ({}{} ms) {}",
        timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        if delta_ms >= 0 { "+" } else { "" },
        delta_ms,
        text
    )
}

/// Write one emission line to stdout. Split from [`format_emission`] so
/// tests can assert on the formatted string without capturing stdout.
pub fn emit(score_ms: i64, now_ms: i64, text: &str) {
    println!("{}", format_emission(score_ms, now_ms, text));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_delta_is_explicitly_signed() {
        let line = format_emission(1_700_000_000_000, 1_700_000_000_012, "hi");
        assert!(line.contains("(+12 ms)"));
        assert!(line.ends_with("hi"));
    }

    #[test]
    fn negative_delta_keeps_minus_sign() {
        let line = format_emission(1_700_000_000_012, 1_700_000_000_000, "hi");
        assert!(line.contains("(-12 ms)"));
    }

    #[test]
    fn zero_delta_is_still_explicitly_signed() {
        let line = format_emission(1_700_000_000_000, 1_700_000_000_000, "hi");
        assert!(line.contains("(+0 ms)"));
    }
}
