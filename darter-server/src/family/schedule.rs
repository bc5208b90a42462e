//! Snapshot schedule specifiers: `HH:MM` globs where any digit may be `*`.

/// One parsed schedule: hour and minute glob nibbles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    /// Hour pattern, 1–2 characters.
    pub hour_spec: String,
    /// Minute pattern, 2 characters or a single `*`.
    pub minute_spec: String,
}

/// A nibble is valid iff some time matching the pattern is `<= max`; for any
/// wildcard the minimum value is zero, so validating the all-zeros
/// substitution suffices. `*` and `**` both map to zero here.
fn is_valid_save_schedule_nibble(nibble: &str, max: u32) -> bool {
    let mut min_match = 0_u32;
    for character in nibble.chars() {
        if character != '*' && !character.is_ascii_digit() {
            return false;
        }
        min_match *= 10;
        min_match += character.to_digit(10).unwrap_or(0);
    }
    min_match <= max
}

/// Parses one `HH:MM` glob.
///
/// The separator must appear within the first three characters, minutes must
/// be two digits (zero padded) unless they are a single greedy `*`, and the
/// minimum-value substitution must fit a real wall-clock time.
#[must_use]
pub fn parse_save_schedule(time: &str) -> Option<SnapshotSpec> {
    if time.len() < 3 || time.len() > 5 {
        return None;
    }
    let separator_idx = time.find(':')?;
    if separator_idx == 0 || separator_idx >= 3 {
        return None;
    }

    let spec = SnapshotSpec {
        hour_spec: time[..separator_idx].to_owned(),
        minute_spec: time[separator_idx + 1..].to_owned(),
    };
    if spec.minute_spec != "*" && spec.minute_spec.len() != 2 {
        return None;
    }

    (is_valid_save_schedule_nibble(&spec.hour_spec, 23)
        && is_valid_save_schedule_nibble(&spec.minute_spec, 59))
    .then_some(spec)
}

/// Matches one nibble against a concrete value, right-aligned: every non-`*`
/// pattern digit must equal the corresponding decimal digit of the value, and
/// the value must have no digits beyond the pattern.
fn does_time_nibble_match_specifier(time_spec: &str, mut current_time: u32) -> bool {
    if time_spec == "*" {
        return true;
    }
    for character in time_spec.chars().rev() {
        if character != '*' && current_time % 10 != character.to_digit(10).unwrap_or(10) {
            return false;
        }
        current_time /= 10;
    }
    current_time == 0
}

/// Whether the wall-clock minute of `now` (unix seconds, UTC) matches `spec`.
#[must_use]
pub fn does_time_match_specifier(spec: &SnapshotSpec, now: u64) -> bool {
    let hour = u32::try_from((now / 3600) % 24).unwrap_or(0);
    let minute = u32::try_from((now / 60) % 60).unwrap_or(0);
    does_time_nibble_match_specifier(&spec.hour_spec, hour)
        && does_time_nibble_match_specifier(&spec.minute_spec, minute)
}

#[cfg(test)]
mod tests {
    use super::{SnapshotSpec, does_time_match_specifier, parse_save_schedule};
    use googletest::prelude::*;
    use rstest::rstest;

    fn spec(hour: &str, minute: &str) -> SnapshotSpec {
        SnapshotSpec {
            hour_spec: hour.to_owned(),
            minute_spec: minute.to_owned(),
        }
    }

    /// Unix seconds for an arbitrary day at `HH:MM` UTC.
    fn unix_at(hour: u64, minute: u64) -> u64 {
        1_650_000_000 / 86_400 * 86_400 + hour * 3600 + minute * 60
    }

    #[rstest]
    #[case("23:45", Some(("23", "45")))]
    #[case("*:30", Some(("*", "30")))]
    #[case("4:20", Some(("4", "20")))]
    #[case("2*:**", Some(("2*", "**")))]
    #[case("*:*", Some(("*", "*")))]
    fn parse_accepts_valid_globs(#[case] input: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_save_schedule(input);
        let expected = expected.map(|(hour, minute)| spec(hour, minute));
        assert_that!(&parsed, eq(&expected));
    }

    #[rstest]
    #[case("")]
    #[case(":5")]
    #[case("12:")]
    #[case("123:4")]
    #[case("24:00")]
    #[case("12:60")]
    #[case("1:5")]
    #[case("12-30")]
    #[case("ab:cd")]
    #[case("1:2:3")]
    fn parse_rejects_invalid_globs(#[case] input: &str) {
        assert_that!(parse_save_schedule(input), eq(&None));
    }

    #[rstest]
    fn wildcard_minute_spec_matches_every_minute_of_its_hour() {
        let parsed = parse_save_schedule("*:30").expect("glob must parse");
        assert_that!(does_time_match_specifier(&parsed, unix_at(12, 30)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(1, 30)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(12, 31)), eq(false));
    }

    #[rstest]
    fn exact_spec_matches_exactly_one_minute_per_day() {
        let parsed = parse_save_schedule("23:45").expect("glob must parse");
        assert_that!(does_time_match_specifier(&parsed, unix_at(23, 45)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(22, 45)), eq(false));
        assert_that!(does_time_match_specifier(&parsed, unix_at(23, 44)), eq(false));
    }

    #[rstest]
    fn single_digit_hour_does_not_match_two_digit_hours() {
        let parsed = parse_save_schedule("4:20").expect("glob must parse");
        assert_that!(does_time_match_specifier(&parsed, unix_at(4, 20)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(14, 20)), eq(false));
    }

    #[rstest]
    fn digit_wildcards_match_positionally() {
        let parsed = parse_save_schedule("2*:*5").expect("glob must parse");
        assert_that!(does_time_match_specifier(&parsed, unix_at(20, 15)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(23, 55)), eq(true));
        assert_that!(does_time_match_specifier(&parsed, unix_at(19, 15)), eq(false));
        assert_that!(does_time_match_specifier(&parsed, unix_at(20, 16)), eq(false));
    }
}
