use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleParseError {
  #[error("Invalid schedule specification: '{0}'")]
  Syntax(String),
  #[error("Value {value} out of range for cron field '{field}'")]
  OutOfRange { field: &'static str, value: u32 },
  #[error("Empty range in cron field '{0}'")]
  EmptyRange(&'static str),
  #[error("Interval schedule must be non-zero")]
  ZeroInterval,
}

/// When a backup job is due: either a fixed interval relative to the last
/// run, or a five-field crontab (minute, hour, day-of-month, month,
/// day-of-week).
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
  Interval(Duration),
  Cron(Crontab),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Crontab {
  minutes: BTreeSet<u32>,
  hours: BTreeSet<u32>,
  mdays: BTreeSet<u32>,
  months: BTreeSet<u32>,
  /// Sunday is 0. Both 0 and 7 are accepted in the expression and
  /// canonicalized here.
  wdays: BTreeSet<u32>,
}

static EVERY: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(
    r"(?i)^@every(?:\s*(?P<weeks>\d+)\s*w(?:eeks?)?)?(?:\s*(?P<days>\d+)\s*d(?:ays?)?)?(?:\s*(?P<hours>\d+)\s*h(?:ours?)?)?(?:\s*(?P<minutes>\d+)\s*m(?:in(?:utes?)?)?)?$",
  )
  .expect("static regex")
});

impl FromStr for Schedule {
  type Err = ScheduleParseError;

  fn from_str(text: &str) -> Result<Self, Self::Err> {
    let trimmed = text.trim();

    match trimmed.to_ascii_lowercase().as_str() {
      "@weekly" => return Ok(Schedule::Interval(Duration::weeks(1))),
      "@daily" => return Ok(Schedule::Interval(Duration::days(1))),
      "@hourly" => return Ok(Schedule::Interval(Duration::hours(1))),
      _ => {}
    };

    if trimmed.to_ascii_lowercase().starts_with("@every") {
      let Some(captures) = EVERY.captures(trimmed) else {
        return Err(ScheduleParseError::Syntax(text.to_string()));
      };
      let unit = |name: &str| -> i64 {
        return captures
          .name(name)
          .and_then(|m| m.as_str().parse::<i64>().ok())
          .unwrap_or(0);
      };

      let interval = Duration::weeks(unit("weeks"))
        + Duration::days(unit("days"))
        + Duration::hours(unit("hours"))
        + Duration::minutes(unit("minutes"));
      if interval.is_zero() {
        return Err(ScheduleParseError::ZeroInterval);
      }
      return Ok(Schedule::Interval(interval));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(ScheduleParseError::Syntax(text.to_string()));
    }

    let mut wdays = parse_cron_field(fields[4], "wday", 0, 7, false)?;
    // Both 0 and 7 mean Sunday, membership tests use 0.
    if wdays.remove(&7) {
      wdays.insert(0);
    }

    return Ok(Schedule::Cron(Crontab {
      minutes: parse_cron_field(fields[0], "minute", 0, 59, false)?,
      hours: parse_cron_field(fields[1], "hour", 0, 23, false)?,
      mdays: parse_cron_field(fields[2], "mday", 1, 31, true)?,
      months: parse_cron_field(fields[3], "month", 1, 12, true)?,
      wdays,
    }));
  }
}

/// One cron field: `*`, `*/N`, or a comma-separated list of `N` or `N-M`
/// entries. Over a 1-based domain `*/N` selects values `v` with
/// `(v - 1) % N == 0`, over a 0-based domain `v % N == 0`.
fn parse_cron_field(
  text: &str,
  field: &'static str,
  lo: u32,
  hi: u32,
  one_based: bool,
) -> Result<BTreeSet<u32>, ScheduleParseError> {
  if text == "*" {
    return Ok((lo..=hi).collect());
  }

  if let Some(divisor) = text.strip_prefix("*/") {
    let n: u32 = divisor
      .parse()
      .map_err(|_| ScheduleParseError::Syntax(text.to_string()))?;
    if n == 0 {
      return Err(ScheduleParseError::Syntax(text.to_string()));
    }
    let offset = if one_based { 1 } else { 0 };
    return Ok((lo..=hi).filter(|v| (v - offset) % n == 0).collect());
  }

  let mut values = BTreeSet::new();
  for block in text.split(',') {
    let (start, end) = match block.split_once('-') {
      Some((start, end)) => {
        let start: u32 = start
          .parse()
          .map_err(|_| ScheduleParseError::Syntax(text.to_string()))?;
        let end: u32 = end
          .parse()
          .map_err(|_| ScheduleParseError::Syntax(text.to_string()))?;
        (start, end)
      }
      None => {
        let v: u32 = block
          .parse()
          .map_err(|_| ScheduleParseError::Syntax(text.to_string()))?;
        (v, v)
      }
    };

    if start > end {
      return Err(ScheduleParseError::EmptyRange(field));
    }
    for v in start..=end {
      if v < lo || v > hi {
        return Err(ScheduleParseError::OutOfRange { field, value: v });
      }
      values.insert(v);
    }
  }

  return Ok(values);
}

impl Schedule {
  /// Parses an interval expression without the `@every` prefix, e.g. `2d` or
  /// `1w 12h`. Used for job freshness limits.
  pub fn parse_interval(text: &str) -> Result<Duration, ScheduleParseError> {
    match format!("@every {}", text.trim()).parse()? {
      Schedule::Interval(interval) => return Ok(interval),
      Schedule::Cron(_) => unreachable!("@every never parses to a crontab"),
    }
  }

  /// The smallest instant strictly greater than `last` satisfying this
  /// schedule.
  ///
  /// For the cron form this searches the current and the following year;
  /// every parseable crontab with a reachable day combination matches within
  /// that window. An unreachable combination (e.g. mday 30 in February only)
  /// is a configuration the search cannot satisfy and panics.
  pub fn next(&self, last: DateTime<Utc>) -> DateTime<Utc> {
    match self {
      Schedule::Interval(interval) => return last + *interval,
      Schedule::Cron(crontab) => {
        return crontab
          .next_after(last)
          .expect("no matching instant within two years");
      }
    }
  }
}

impl Crontab {
  fn next_after(&self, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let last_year = last.year();

    for year in [last_year, last_year + 1] {
      let first_month = if year == last_year { last.month() } else { 1 };

      for month in (first_month..=12).filter(|m| self.months.contains(m)) {
        let same_month = year == last_year && month == last.month();
        let first_day = if same_month { last.day() } else { 1 };

        for day in self.eligible_days(year, month, first_day) {
          let same_day = same_month && day == last.day();
          let first_hour = if same_day { last.hour() } else { 0 };

          for hour in (first_hour..=23).filter(|h| self.hours.contains(h)) {
            let same_hour = same_day && hour == last.hour();
            let first_minute = if same_hour { last.minute() + 1 } else { 0 };

            for minute in (first_minute..=59).filter(|m| self.minutes.contains(m)) {
              return Utc
                .with_ymd_and_hms(year, month, day, hour, minute, 0)
                .single();
            }
          }
        }
      }
    }

    return None;
  }

  /// Day-of-month and day-of-week combine with OR semantics, matching
  /// traditional cron: when both fields restrict the remaining days of the
  /// month, a day matching either fires.
  fn eligible_days(&self, year: i32, month: u32, first_day: u32) -> Vec<u32> {
    let all_days: Vec<u32> = (first_day..=days_in_month(year, month)).collect();

    let weekday_days: Vec<u32> = all_days
      .iter()
      .copied()
      .filter(|&day| {
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
          return false;
        };
        // Transform Monday=0 into Sunday=0.
        return self
          .wdays
          .contains(&((date.weekday().num_days_from_monday() + 1) % 7));
      })
      .collect();
    let monthday_days: Vec<u32> = all_days
      .iter()
      .copied()
      .filter(|day| self.mdays.contains(day))
      .collect();

    let weekday_restricts = weekday_days.len() < all_days.len();
    let monthday_restricts = monthday_days.len() < all_days.len();

    match (weekday_restricts, monthday_restricts) {
      (false, false) => return all_days,
      (true, false) => return weekday_days,
      (false, true) => return monthday_days,
      (true, true) => {
        let union: BTreeSet<u32> = weekday_days
          .into_iter()
          .chain(monthday_days.into_iter())
          .collect();
        return union.into_iter().collect();
      }
    }
  }
}

fn days_in_month(year: i32, month: u32) -> u32 {
  let next_month = match month {
    12 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
    _ => NaiveDate::from_ymd_opt(year, month + 1, 1),
  };
  return next_month
    .and_then(|d| d.pred_opt())
    .map(|d| d.day())
    .expect("valid calendar month");
}
