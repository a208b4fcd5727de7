//! Recurring schedules, all in UTC

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, SubsecRound, TimeZone, Timelike, Utc};
use kindling_common::Error;

/// When a recurring job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Minute 0 of every hour
    Hourly,
    /// Every `n` minutes, aligned to the epoch
    EveryMinutes(u32),
    /// Every `n` hours, aligned to the epoch
    EveryHours(u32),
    /// Once a day at a fixed time
    DailyAt(NaiveTime),
}

impl Schedule {
    pub fn daily_at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self::DailyAt)
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Hourly => aligned(after, 3600),
            Schedule::EveryMinutes(n) => aligned(after, i64::from(*n).max(1) * 60),
            Schedule::EveryHours(n) => aligned(after, i64::from(*n).max(1) * 3600),
            Schedule::DailyAt(time) => {
                let today = Utc.from_utc_datetime(&after.date_naive().and_time(*time));
                if today > after {
                    today
                } else {
                    today + Duration::days(1)
                }
            }
        }
    }
}

fn aligned(after: DateTime<Utc>, period_secs: i64) -> DateTime<Utc> {
    let whole = after.trunc_subsecs(0);
    let into_period = whole.timestamp().rem_euclid(period_secs);
    whole - Duration::seconds(into_period) + Duration::seconds(period_secs)
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Hourly => write!(f, "hourly"),
            Schedule::EveryMinutes(n) => write!(f, "every {}m", n),
            Schedule::EveryHours(n) => write!(f, "every {}h", n),
            Schedule::DailyAt(time) => write!(f, "daily {:02}:{:02}", time.hour(), time.minute()),
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Validation(format!("Invalid schedule: {}", s));
        let s = s.trim();

        if s == "hourly" {
            return Ok(Schedule::Hourly);
        }
        if let Some(every) = s.strip_prefix("every ") {
            let every = every.trim();
            let (split, _) = every.char_indices().last().ok_or_else(invalid)?;
            let (count, unit) = every.split_at(split);
            let count: u32 = count.parse().map_err(|_| invalid())?;
            if count == 0 {
                return Err(invalid());
            }
            return match unit {
                "m" => Ok(Schedule::EveryMinutes(count)),
                "h" => Ok(Schedule::EveryHours(count)),
                _ => Err(invalid()),
            };
        }
        if let Some(time) = s.strip_prefix("daily ") {
            let time = NaiveTime::parse_from_str(time.trim(), "%H:%M").map_err(|_| invalid())?;
            return Ok(Schedule::DailyAt(time));
        }
        Err(invalid())
    }
}
