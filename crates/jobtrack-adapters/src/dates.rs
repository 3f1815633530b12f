//! Tolerant closing-date parsing. Day-first wins whenever a numeric date is ambiguous.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

static ISO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})\b").expect("valid iso date regex")
});

static DAY_MONTH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?(?:\s+of)?[\s\-/.,]+",
        r"([a-z]{3,9})\.?[\s\-/.,]+(\d{4}|\d{2})\b",
    ))
    .expect("valid day-month-year regex")
});

static MONTH_DAY_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b")
        .expect("valid month-day-year regex")
});

static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[-/.](\d{1,2})[-/.](\d{4}|\d{2})\b").expect("valid numeric date regex")
});

// Optional leading day is captured only so a month-year read can refuse it.
static MONTH_YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)(?:\b(\d{1,2})(?:st|nd|rd|th)?(?:\s+of)?[\s\-/.,]+)?",
        r"\b([a-z]{3,9})\.?[\s\-/.,]+(\d{4})\b",
    ))
    .expect("valid month-year regex")
});

static YEAR_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{4})[-/.](\d{1,2})\b").expect("valid year-month regex")
});

static DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?(?:\s+of)?\s+([a-z]{3,9})\b")
        .expect("valid day-month regex")
});

static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?\b")
        .expect("valid month-day regex")
});

static NUMERIC_DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[-/.](\d{1,2})\b").expect("valid numeric day-month regex")
});

/// Best-effort calendar date from free text; `None` on anything unrecognizable.
///
/// `reference` fills whatever the text leaves out: the year for a bare day and
/// month, the day for a bare month and year.
pub fn parse_closing_date(raw: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.date());
        }
    }

    if let Some(date) = first_match(&ISO_RE, text, |c| {
        ymd(num(c, 1)?, unum(c, 2)?, unum(c, 3)?)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&DAY_MONTH_YEAR_RE, text, |c| {
        ymd(year(num(c, 3)?), month_from_name(&c[2])?, unum(c, 1)?)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&MONTH_DAY_YEAR_RE, text, |c| {
        ymd(num(c, 3)?, month_from_name(&c[1])?, unum(c, 2)?)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&NUMERIC_RE, text, |c| {
        day_first(unum(c, 1)?, unum(c, 2)?, year(num(c, 3)?))
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&MONTH_YEAR_RE, text, |c| {
        if c.get(1).is_some() {
            return None;
        }
        month_with_reference_day(num(c, 3)?, month_from_name(&c[2])?, reference)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&YEAR_MONTH_RE, text, |c| {
        month_with_reference_day(num(c, 1)?, unum(c, 2)?, reference)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&DAY_MONTH_RE, text, |c| {
        ymd(reference.year(), month_from_name(&c[2])?, unum(c, 1)?)
    }) {
        return Some(date);
    }
    if let Some(date) = first_match(&MONTH_DAY_RE, text, |c| {
        ymd(reference.year(), month_from_name(&c[1])?, unum(c, 2)?)
    }) {
        return Some(date);
    }
    first_match(&NUMERIC_DAY_MONTH_RE, text, |c| {
        day_first(unum(c, 1)?, unum(c, 2)?, reference.year())
    })
}

fn first_match(
    re: &Regex,
    text: &str,
    build: impl Fn(&Captures<'_>) -> Option<NaiveDate>,
) -> Option<NaiveDate> {
    re.captures_iter(text).find_map(|c| build(&c))
}

fn num(c: &Captures<'_>, idx: usize) -> Option<i32> {
    c.get(idx)?.as_str().parse().ok()
}

fn unum(c: &Captures<'_>, idx: usize) -> Option<u32> {
    c.get(idx)?.as_str().parse().ok()
}

fn year(y: i32) -> i32 {
    if y < 100 {
        2000 + y
    } else {
        y
    }
}

fn ymd(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
}

/// `a/b/y` read as day/month, falling back to month/day only when day-first is impossible.
fn day_first(a: u32, b: u32, y: i32) -> Option<NaiveDate> {
    ymd(y, b, a).or_else(|| ymd(y, a, b))
}

/// Reference day clamped to the month's length.
fn month_with_reference_day(y: i32, m: u32, reference: NaiveDate) -> Option<NaiveDate> {
    (1..=reference.day()).rev().find_map(|d| ymd(y, m, d))
}

fn month_from_name(word: &str) -> Option<u32> {
    let word = word.to_ascii_lowercase();
    if word.len() < 3 {
        return None;
    }
    MONTH_NAMES
        .iter()
        .position(|name| name.starts_with(word.as_str()))
        .map(|idx| idx as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn parse(raw: &str) -> Option<NaiveDate> {
        parse_closing_date(raw, day(2024, 6, 1))
    }

    #[test]
    fn iso_and_timestamps() {
        assert_eq!(parse("2024-01-01"), Some(day(2024, 1, 1)));
        assert_eq!(parse("2024-07-09T17:00:00"), Some(day(2024, 7, 9)));
        assert_eq!(parse("2024-07-09T17:00:00+04:30"), Some(day(2024, 7, 9)));
        assert_eq!(parse("2024/7/9"), Some(day(2024, 7, 9)));
    }

    #[test]
    fn numeric_dates_prefer_day_first() {
        assert_eq!(parse("05/06/2024"), Some(day(2024, 6, 5)));
        assert_eq!(parse("05.06.24"), Some(day(2024, 6, 5)));
        // Only readable month-first.
        assert_eq!(parse("12/25/2024"), Some(day(2024, 12, 25)));
        assert_eq!(parse("31/31/2024"), None);
    }

    #[test]
    fn month_names_with_surrounding_text() {
        assert_eq!(parse("Closing date: 15 March 2024"), Some(day(2024, 3, 15)));
        assert_eq!(parse("5th of June, 2024"), Some(day(2024, 6, 5)));
        assert_eq!(parse("15-Mar-2024"), Some(day(2024, 3, 15)));
        assert_eq!(parse("Deadline: Sept 3, 2024 (Kabul time)"), Some(day(2024, 9, 3)));
        assert_eq!(parse("Jul 20 2025"), Some(day(2025, 7, 20)));
    }

    #[test]
    fn year_less_dates_use_reference_year() {
        assert_eq!(parse("Apply by 20 July"), Some(day(2024, 7, 20)));
        assert_eq!(parse("August 2nd"), Some(day(2024, 8, 2)));
    }

    #[test]
    fn year_less_numeric_dates_read_day_first() {
        assert_eq!(parse("05/06"), Some(day(2024, 6, 5)));
        assert_eq!(parse("Closing: 20.07"), Some(day(2024, 7, 20)));
        assert_eq!(parse("12-25"), Some(day(2024, 12, 25)));
        assert_eq!(parse("31/31"), None);
    }

    #[test]
    fn month_and_year_take_the_reference_day() {
        assert_eq!(parse("June 2024"), Some(day(2024, 6, 1)));
        assert_eq!(parse("Jul-2024"), Some(day(2024, 7, 1)));
        assert_eq!(parse("2024-07"), Some(day(2024, 7, 1)));

        let month_end = day(2024, 5, 31);
        assert_eq!(parse_closing_date("June 2024", month_end), Some(day(2024, 6, 30)));
        assert_eq!(parse_closing_date("2025/02", month_end), Some(day(2025, 2, 28)));
    }

    #[test]
    fn garbage_is_none() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("until the position is filled"), None);
        assert_eq!(parse("30 February 2024"), None);
        assert_eq!(parse("10 mayors"), None);
    }
}
