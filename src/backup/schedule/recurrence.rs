use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};

/// Longest offset change we step over, in minutes
const MAX_SHIFT_MINUTES: i64 = 24 * 60;

/// A validated recurrence rule.
///
/// Day-of-month overflow is clamped: 31 resolves to the last day of shorter
/// months (Feb 28/29, Apr 30, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recurrence {
    Hourly,
    Daily { time: NaiveTime },
    /// `day_of_week` counts from Sunday = 0
    Weekly { day_of_week: u8, time: NaiveTime },
    Monthly { day_of_month: u8, time: NaiveTime },
}

impl Recurrence {
    /// Next trigger instant strictly after `now`, in `now`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<DateTime<Tz>> {
        let tz = now.timezone();
        let today = now.naive_local().date();

        match *self {
            Recurrence::Hourly => next_top_of_hour(now).ok_or_else(|| out_of_range(today)),
            Recurrence::Daily { time } => {
                let candidate = resolve_local(&tz, today.and_time(time));
                if candidate > *now {
                    return Ok(candidate);
                }
                let tomorrow = today.succ_opt().ok_or_else(|| out_of_range(today))?;
                Ok(resolve_local(&tz, tomorrow.and_time(time)))
            }
            Recurrence::Weekly { day_of_week, time } => {
                let current = today.weekday().num_days_from_sunday();
                let ahead = (u32::from(day_of_week) + 7 - current) % 7;
                let date = today + Duration::days(i64::from(ahead));
                let candidate = resolve_local(&tz, date.and_time(time));
                if candidate > *now {
                    return Ok(candidate);
                }
                Ok(resolve_local(&tz, (date + Duration::days(7)).and_time(time)))
            }
            Recurrence::Monthly { day_of_month, time } => {
                let date = clamped_date(today.year(), today.month(), day_of_month)
                    .ok_or_else(|| out_of_range(today))?;
                let candidate = resolve_local(&tz, date.and_time(time));
                if candidate > *now {
                    return Ok(candidate);
                }
                let (year, month) = match today.month() {
                    12 => (today.year() + 1, 1),
                    m => (today.year(), m + 1),
                };
                let date = clamped_date(year, month, day_of_month)
                    .ok_or_else(|| out_of_range(today))?;
                Ok(resolve_local(&tz, date.and_time(time)))
            }
        }
    }
}

fn out_of_range(date: NaiveDate) -> Error {
    Error::Scheduling(format!("no representable next run after {date}"))
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
}

fn clamped_date(year: i32, month: u32, day_of_month: u8) -> Option<NaiveDate> {
    let last = days_in_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, u32::from(day_of_month).clamp(1, last))
}

/// First instant after `now` whose local time reads hh:00:00. Walks absolute
/// time minute by minute, so both passes of a repeated hour are visited.
fn next_top_of_hour<Tz: TimeZone>(now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let start = now.clone()
        - Duration::seconds(i64::from(now.second()))
        - Duration::nanoseconds(i64::from(now.nanosecond()));
    (1..=60 + MAX_SHIFT_MINUTES)
        .map(|minutes| start.clone() + Duration::minutes(minutes))
        .find(|candidate| candidate.minute() == 0 && candidate.second() == 0)
}

/// Maps a wall-clock time to an instant. Ambiguous times (DST fall back) take
/// the earlier instant, non-existent ones (DST spring forward) move to the
/// first valid minute after the gap, which is where the gap ends.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            let minute = local.with_second(0)?.with_nanosecond(0)?;
            (1..=MAX_SHIFT_MINUTES).find_map(|step| {
                tz.from_local_datetime(&(minute + Duration::minutes(step)))
                    .earliest()
            })
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&local))
}
