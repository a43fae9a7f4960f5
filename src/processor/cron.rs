use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

/// How far ahead `next_after` searches before giving up (covers Feb 29th).
const SEARCH_DAYS: i64 = 366 * 4 + 1;

/// Five-field cron expression: minute, hour, day of month, month, day of week.
/// Fields accept `*`, lists, ranges and steps. Day of week runs 0-7 with both
/// 0 and 7 meaning Sunday. When day of month and day of week are both
/// restricted a day matches if either does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct Field {
    bits: u64,
    restricted: bool,
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<Field, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };
    let number = |s: &str| -> Result<u32, ScheduleError> {
        let value: u32 = s
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a number", s)))?;
        if value < min || value > max {
            return Err(invalid(format!("{} is outside {}-{}", value, min, max)));
        }
        Ok(value)
    };

    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step in '{}'", part)))?;
                if step == 0 {
                    return Err(invalid(format!("zero step in '{}'", part)));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let (lo, hi) = (number(lo)?, number(hi)?);
            if lo > hi {
                return Err(invalid(format!("descending range '{}'", range)));
            }
            (lo, hi)
        } else {
            let start = number(range)?;
            // `5/15` means every 15 starting at 5.
            (start, if step > 1 { max } else { start })
        };
        let mut value = lo;
        while value <= hi {
            bits |= 1 << value;
            value += step;
        }
    }
    Ok(Field {
        bits,
        restricted: field != "*",
    })
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        let minutes = parse_field(expr, fields[0], 0, 59)?;
        let hours = parse_field(expr, fields[1], 0, 23)?;
        let dom = parse_field(expr, fields[2], 1, 31)?;
        let months = parse_field(expr, fields[3], 1, 12)?;
        let dow = parse_field(expr, fields[4], 0, 7)?;

        // Fold 7 onto Sunday.
        let mut days_of_week = (dow.bits & 0x7f) as u8;
        if dow.bits & (1 << 7) != 0 {
            days_of_week |= 1;
        }

        Ok(Self {
            expr: fields.join(" "),
            minutes: minutes.bits,
            hours: hours.bits as u32,
            days_of_month: dom.bits as u32,
            months: months.bits as u16,
            days_of_week,
            dom_restricted: dom.restricted,
            dow_restricted: dow.restricted,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn times(&self) -> impl Iterator<Item = NaiveTime> + '_ {
        (0..24u32)
            .filter(move |h| self.hours & (1 << h) != 0)
            .flat_map(move |h| {
                (0..60u32)
                    .filter(move |m| self.minutes & (1 << m) != 0)
                    .filter_map(move |m| NaiveTime::from_hms_opt(h, m, 0))
            })
    }

    /// First fire time strictly after `after`, in `after`'s timezone. Local
    /// times skipped by a DST jump never fire; repeated ones fire once.
    pub fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let start_date = local.date();
        for offset in 0..SEARCH_DAYS {
            let date = start_date + Duration::days(offset);
            if !self.matches_date(date) {
                continue;
            }
            for time in self.times() {
                let candidate = date.and_time(time);
                let fire = match tz.from_local_datetime(&candidate) {
                    LocalResult::Single(t) => t,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                    LocalResult::None => continue,
                };
                if fire > *after {
                    return Some(fire);
                }
            }
        }
        None
    }

    /// Next fire time after `now`, with `now` taken in `tz`.
    pub fn next_fire<T: TimeZone>(&self, now: &DateTime<T>, tz: Tz) -> Option<DateTime<Tz>> {
        let now = now.with_timezone(&tz);
        // Align to the minute so a fire at exactly `now` is not repeated.
        let aligned = now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
        self.next_after(&aligned)
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}
