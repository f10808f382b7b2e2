// Utility helpers for parsing, header normalization and number formatting.
//
// This module centralizes all the "dirty" CSV/number/date handling so the
// rest of the code can assume clean, typed values.
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use num_format::{Locale, ToFormattedString};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Date-only layouts seen in notification exports.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

/// Timestamp layouts without offset.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Accented characters folded when normalizing header names.
static ACCENT_FOLD: Lazy<HashMap<char, char>> = Lazy::new(|| {
    [
        ('á', 'a'), ('à', 'a'), ('â', 'a'), ('ã', 'a'), ('ä', 'a'),
        ('é', 'e'), ('è', 'e'), ('ê', 'e'), ('ë', 'e'),
        ('í', 'i'), ('ì', 'i'), ('î', 'i'), ('ï', 'i'),
        ('ó', 'o'), ('ò', 'o'), ('ô', 'o'), ('õ', 'o'), ('ö', 'o'),
        ('ú', 'u'), ('ù', 'u'), ('û', 'u'), ('ü', 'u'),
        ('ç', 'c'), ('ñ', 'n'),
    ]
    .into_iter()
    .collect()
});

static GROUPED_INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}([.,]\d{3})+$").expect("valid grouped-integer pattern"));

/// Parse a notification date, accepting date-only values, naive timestamps
/// and RFC 3339 timestamps. Only the calendar date is kept.
///
/// Returns `None` for anything that cannot be parsed; callers drop those rows.
pub fn parse_date_safe(s: Option<&str>) -> Option<NaiveDate> {
    let s = s?.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive())
}

/// Parse a population cell into a positive integer.
///
/// - Accepts plain integers (`12345`).
/// - Accepts integral floats (`12345.0`).
/// - Accepts thousand-grouped values (`2.315.560`, `2,315,560`).
/// - Returns `None` for zero, negatives, fractions and text.
pub fn parse_population(s: Option<&str>) -> Option<u64> {
    let s = s?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(v) = s.parse::<u64>() {
        return (v > 0).then_some(v);
    }
    if GROUPED_INTEGER.is_match(s) {
        let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
        return digits.parse::<u64>().ok().filter(|v| *v > 0);
    }
    let f = s.parse::<f64>().ok()?;
    if f.is_finite() && f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

/// Canonical form of a header name: trimmed, lowercased, accents folded.
///
/// `" Município "` and `"MUNICIPIO"` both become `"municipio"`.
pub fn canonical_header(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| ACCENT_FOLD.get(&c).copied().unwrap_or(c))
        .collect()
}

pub fn days_between(start: NaiveDate, end: NaiveDate) -> f64 {
    // `NaiveDate` supports subtraction; the result is a `Duration` in days.
    (end - start).num_days() as f64
}

pub fn average(v: &[f64]) -> f64 {
    // Standard arithmetic mean; returns 0 for an empty slice to avoid NaNs.
    if v.is_empty() {
        return 0.0;
    }
    let sum: f64 = v.iter().copied().sum();
    sum / v.len() as f64
}

pub fn format_number(n: f64, decimals: usize) -> String {
    // Format a floating-point value with a fixed number of decimal places and
    // locale-aware thousands separators (e.g., `1,234,567.89`).
    let neg = n.is_sign_negative() && n != 0.0;
    let abs_n = n.abs();
    let s = format!("{:.*}", decimals, abs_n);
    let mut parts = s.split('.');
    let int_part = parts.next().unwrap_or("0");
    let frac_part = parts.next();
    let int_val: u64 = int_part.parse().unwrap_or(0);
    let mut res = int_val.to_formatted_string(&Locale::en);
    if let Some(frac) = frac_part {
        if decimals > 0 {
            res.push('.');
            res.push_str(frac);
        }
    }
    if neg {
        format!("-{}", res)
    } else {
        res
    }
}

pub fn format_int<T>(n: T) -> String
where
    T: ToFormattedString,
{
    // Thin wrapper around `num-format` for counts in console messages
    // (e.g., `9,855 rows loaded`).
    n.to_formatted_string(&Locale::en)
}
