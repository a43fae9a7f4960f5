//! US equity market calendar (NYSE full-day closures) and the date
//! dimension rows derived from it.

use crate::database::models::DateDimension;
use chrono::{Datelike, Duration, NaiveDate, Weekday};

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != weekday {
        day = day.pred_opt()?;
    }
    Some(day)
}

/// Gregorian Easter Sunday (anonymous computus).
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Saturday holidays close the preceding Friday, Sunday holidays the
/// following Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// Full-day NYSE closures falling in `year`.
pub fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = |month, day| NaiveDate::from_ymd_opt(year, month, day);
    let mut days = Vec::with_capacity(10);

    // New Year's Day on a Saturday is not made up on the prior Friday.
    if let Some(new_year) = fixed(1, 1) {
        if new_year.weekday() != Weekday::Sat {
            days.push(observed(new_year));
        }
    }
    days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter_sunday(year).map(|easter| easter - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(fixed(6, 19).map(observed));
    }
    days.extend(fixed(7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    days.extend(fixed(12, 25).map(observed));

    days.sort();
    days
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_us_trading_day(date: NaiveDate) -> bool {
    !is_weekend(date) && !nyse_holidays(date.year()).contains(&date)
}

pub fn date_dimension(date: NaiveDate) -> DateDimension {
    DateDimension {
        date_id: date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32,
        date,
        year: date.year(),
        quarter: (date.month0() / 3 + 1) as i32,
        month: date.month() as i32,
        week: date.iso_week().week() as i32,
        day_of_week: date.weekday().num_days_from_monday() as i32,
        day_name: date.format("%A").to_string(),
        is_weekend: is_weekend(date),
        is_us_market_open: is_us_trading_day(date),
        is_crypto_open: true,
    }
}

/// Date dimension rows for every day in `start..=end`.
pub fn date_dimension_range(start: NaiveDate, end: NaiveDate) -> Vec<DateDimension> {
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .map(date_dimension)
        .collect()
}
