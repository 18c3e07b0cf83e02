//! Deterministic deadline resolution. Free-form relative dates ("next
//! wednesday", "in 2 weeks") are computed by this one resolver against an
//! injected reference date, never by the classifier. Output is ISO
//! `YYYY-MM-DD`, which re-parses to itself.

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};

/// Resolve the first recognizable deadline expression in `text` against
/// `today`. Scans phrase-level patterns first, then bare weekday / ISO /
/// "in N units" forms.
pub fn resolve_deadline(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let normalized = text.to_lowercase();

    if let Some(date) = find_iso_date(&normalized) {
        return Some(date);
    }

    if normalized.contains("day after tomorrow") {
        return today.checked_add_days(Days::new(2));
    }
    if normalized.contains("tomorrow") {
        return today.checked_add_days(Days::new(1));
    }
    if normalized.contains("today") || normalized.contains("eod") {
        return Some(today);
    }
    if normalized.contains("next week") {
        return today.checked_add_days(Days::new(7));
    }
    if normalized.contains("next month") {
        return today.checked_add_months(Months::new(1));
    }
    if normalized.contains("end of week") || normalized.contains("eow") {
        return Some(upcoming_or_today(today, Weekday::Fri));
    }
    if normalized.contains("end of month") || normalized.contains("eom") {
        return Some(end_of_month(today));
    }

    if let Some(date) = find_relative_offset(&normalized, today) {
        return Some(date);
    }

    find_weekday_expression(&normalized, today)
}

/// Parse an already-structured deadline value (typically the classifier's
/// extracted field): ISO first, then the same phrase grammar.
pub fn parse_deadline(value: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d") {
        return Some(date);
    }
    resolve_deadline(value, today)
}

fn find_iso_date(text: &str) -> Option<NaiveDate> {
    for token in text.split_whitespace() {
        let token = token.trim_matches(|ch: char| !ch.is_ascii_alphanumeric() && ch != '-');
        if token.len() == 10 {
            if let Ok(date) = NaiveDate::parse_from_str(token, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }
    None
}

/// "in 3 days", "in 2 weeks", "in 1 month".
fn find_relative_offset(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for window in tokens.windows(3) {
        let [lead, count, unit] = window else { continue };
        if *lead != "in" {
            continue;
        }
        let count: u64 = match count.parse() {
            Ok(count) => count,
            Err(_) => continue,
        };
        let unit = unit.trim_end_matches(|ch: char| !ch.is_ascii_alphabetic());
        return match unit {
            "day" | "days" => today.checked_add_days(Days::new(count)),
            "week" | "weeks" => today.checked_add_days(Days::new(count * 7)),
            "month" | "months" => today.checked_add_months(Months::new(count as u32)),
            _ => continue,
        };
    }
    None
}

/// Bare weekday names, optionally prefixed with "this" (upcoming
/// occurrence) or "next" (the occurrence one week after the upcoming one).
fn find_weekday_expression(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let tokens: Vec<&str> = text
        .split_whitespace()
        .map(|token| token.trim_matches(|ch: char| !ch.is_ascii_alphabetic()))
        .collect();

    for (index, token) in tokens.iter().enumerate() {
        let Some(weekday) = parse_weekday(token) else { continue };
        let upcoming = upcoming_strictly_after(today, weekday);
        let qualifier = index.checked_sub(1).and_then(|prev| tokens.get(prev)).copied();
        return match qualifier {
            Some("next") => upcoming.checked_add_days(Days::new(7)),
            _ => Some(upcoming),
        };
    }
    None
}

fn parse_weekday(token: &str) -> Option<Weekday> {
    match token {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" | "thurs" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

fn upcoming_strictly_after(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut date = today.succ_opt().unwrap_or(today);
    while date.weekday() != weekday {
        date = date.succ_opt().unwrap_or(date);
    }
    date
}

fn upcoming_or_today(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    if today.weekday() == weekday {
        return today;
    }
    upcoming_strictly_after(today, weekday)
}

fn end_of_month(today: NaiveDate) -> NaiveDate {
    let first_of_next = NaiveDate::from_ymd_opt(
        match today.month() {
            12 => today.year() + 1,
            _ => today.year(),
        },
        match today.month() {
            12 => 1,
            month => month + 1,
        },
        1,
    );
    match first_of_next.and_then(|date| date.pred_opt()) {
        Some(date) => date,
        None => today,
    }
}
