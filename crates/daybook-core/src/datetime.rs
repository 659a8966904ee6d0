use std::sync::OnceLock;

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  Local,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  Weekday
};
use regex::Regex;

pub const ISO_DATE_FORMAT: &str =
  "%Y-%m-%d";

pub const MINUTES_PER_DAY: u32 = 1440;

const DATE_FORMATS: &[&str] = &[
  "%Y-%m-%d",
  "%Y/%m/%d",
  "%m/%d/%Y",
  "%B %d, %Y",
  "%b %d, %Y",
  "%B %d %Y",
  "%b %d %Y",
  "%d %B %Y",
  "%d %b %Y",
  "%a %b %d %Y",
  "%A, %B %d, %Y"
];

const DATE_TIME_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%dT%H:%M",
  "%Y-%m-%d %H:%M:%S",
  "%Y-%m-%d %H:%M"
];

fn iso_date_re() -> Option<&'static Regex>
{
  static ISO_DATE_RE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  ISO_DATE_RE
    .get_or_init(|| {
      Regex::new(r"^\d{4}-\d{2}-\d{2}$")
        .ok()
    })
    .as_ref()
}

fn clock_re() -> Option<&'static Regex> {
  static CLOCK_RE: OnceLock<
    Option<Regex>
  > = OnceLock::new();
  CLOCK_RE
    .get_or_init(|| {
      Regex::new(
        r"(?i)^(?P<hour>\d{1,2})(?::(?P<minute>\d{1,2}))?\s*(?P<ampm>[ap]\.?m\.?)?$"
      )
      .ok()
    })
    .as_ref()
}

/// Canonicalizes a date-like string to
/// `YYYY-MM-DD`.
///
/// Strings already in that shape are
/// returned untouched. Anything else is
/// parsed as a general date expression
/// and reformatted from its local
/// year/month/day. Unparseable input
/// yields an empty string, which callers
/// treat as "no date".
#[must_use]
pub fn normalize_date(
  input: &str
) -> String {
  let token = input.trim();
  if token.is_empty() {
    return String::new();
  }

  if iso_date_re()
    .is_some_and(|re| re.is_match(token))
  {
    return token.to_string();
  }

  match parse_general_date(token) {
    | Some(date) => {
      format_iso_date(date)
    }
    | None => {
      tracing::debug!(
        input = token,
        "unparseable date; treating as empty"
      );
      String::new()
    }
  }
}

fn parse_general_date(
  token: &str
) -> Option<NaiveDate> {
  if let Ok(dt) =
    DateTime::parse_from_rfc3339(token)
  {
    return Some(
      dt.with_timezone(&Local)
        .date_naive()
    );
  }

  for fmt in DATE_TIME_FORMATS {
    if let Ok(ndt) =
      NaiveDateTime::parse_from_str(
        token, fmt
      )
    {
      return Some(ndt.date());
    }
  }

  DATE_FORMATS.iter().find_map(|fmt| {
    NaiveDate::parse_from_str(token, fmt)
      .ok()
  })
}

/// Normalizes and then parses to a
/// calendar date.
#[must_use]
pub fn parse_iso_date(
  input: &str
) -> Option<NaiveDate> {
  let normalized =
    normalize_date(input);
  if normalized.is_empty() {
    return None;
  }
  NaiveDate::parse_from_str(
    &normalized,
    ISO_DATE_FORMAT
  )
  .ok()
}

#[must_use]
pub fn format_iso_date(
  date: NaiveDate
) -> String {
  date
    .format(ISO_DATE_FORMAT)
    .to_string()
}

/// Parses `H`, `H:MM` or `HH:MM` with an
/// optional am/pm suffix into minutes
/// past midnight.
#[must_use]
pub fn parse_clock_minutes(
  token: &str
) -> Option<u32> {
  let captures =
    clock_re()?.captures(token.trim())?;

  let raw_hour = captures
    .name("hour")?
    .as_str()
    .parse::<u32>()
    .ok()?;
  let minute = match captures
    .name("minute")
  {
    | Some(m) => {
      m.as_str().parse::<u32>().ok()?
    }
    | None => 0
  };
  if minute > 59 {
    return None;
  }

  let hour = if let Some(ampm_match) =
    captures.name("ampm")
  {
    let ampm = ampm_match
      .as_str()
      .to_ascii_lowercase()
      .replace('.', "");
    if raw_hour == 0 || raw_hour > 12 {
      return None;
    }
    match ampm.as_str() {
      | "am" => {
        if raw_hour == 12 {
          0
        } else {
          raw_hour
        }
      }
      | "pm" => {
        if raw_hour == 12 {
          12
        } else {
          raw_hour + 12
        }
      }
      | _ => return None
    }
  } else {
    if raw_hour > 23 {
      return None;
    }
    raw_hour
  };

  Some(hour * 60 + minute)
}

/// Minutes past midnight in
/// `[0, 1439]`, or `fallback` when the
/// string is not a clock time.
#[must_use]
pub fn to_minutes_of_day(
  time: &str,
  fallback: u32
) -> u32 {
  parse_clock_minutes(time)
    .unwrap_or(fallback)
}

#[must_use]
pub fn format_minutes(
  minutes: u32
) -> String {
  let minutes =
    minutes % MINUTES_PER_DAY;
  format!(
    "{:02}:{:02}",
    minutes / 60,
    minutes % 60
  )
}

#[must_use]
pub fn at_minutes(
  date: NaiveDate,
  minutes: u32
) -> NaiveDateTime {
  let midnight = date
    .and_time(NaiveTime::MIN);
  midnight
    + Duration::minutes(i64::from(
      minutes
    ))
}

/// `date` moved by `n` days; unchanged
/// when the result is out of range.
#[must_use]
pub fn add_days(
  date: NaiveDate,
  n: i64
) -> NaiveDate {
  checked_add_days(date, n)
    .unwrap_or(date)
}

#[must_use]
pub fn checked_add_days(
  date: NaiveDate,
  n: i64
) -> Option<NaiveDate> {
  Duration::try_days(n).and_then(
    |delta| {
      date.checked_add_signed(delta)
    }
  )
}

/// String form of [`add_days`]; invalid
/// input yields an empty string.
#[must_use]
pub fn add_days_iso(
  date_iso: &str,
  n: i64
) -> String {
  parse_iso_date(date_iso)
    .map(|date| {
      format_iso_date(add_days(date, n))
    })
    .unwrap_or_default()
}

/// Same day-of-month in the following
/// month, clamped to that month's last
/// day.
#[must_use]
pub fn add_month_clamped(
  date: NaiveDate
) -> NaiveDate {
  let (year, month) = if date.month()
    == 12
  {
    (date.year() + 1, 1)
  } else {
    (date.year(), date.month() + 1)
  };
  let day = date
    .day()
    .min(days_in_month(year, month));
  NaiveDate::from_ymd_opt(
    year, month, day
  )
  .unwrap_or(date)
}

#[must_use]
pub fn days_in_month(
  year: i32,
  month: u32
) -> u32 {
  let (next_year, next_month) =
    if month == 12 {
      (year + 1, 1)
    } else {
      (year, month + 1)
    };
  NaiveDate::from_ymd_opt(
    next_year, next_month, 1
  )
  .and_then(|first| first.pred_opt())
  .map(|last| last.day())
  .unwrap_or(28)
}

/// Signed whole days from `from` to
/// `to`.
#[must_use]
pub fn days_between(
  from: NaiveDate,
  to: NaiveDate
) -> i64 {
  to.signed_duration_since(from)
    .num_days()
}

#[must_use]
pub fn local_now() -> NaiveDateTime {
  Local::now().naive_local()
}

#[tracing::instrument(skip(today), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  today: NaiveDate
) -> anyhow::Result<NaiveDate> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();

  match lower.as_str() {
    | "today" => return Ok(today),
    | "tomorrow" => {
      return Ok(add_days(today, 1));
    }
    | "yesterday" => {
      return Ok(add_days(today, -1));
    }
    | _ => {}
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    return Ok(next_weekday_date(
      today,
      target_weekday
    ));
  }

  let rel_re = Regex::new(
    r"^(?P<sign>[+-])(?P<num>\d+)(?P<unit>[dw])$"
  )
  .map_err(|e| {
    anyhow!(
      "internal regex compile \
       failure: {e}"
    )
  })?;

  if let Some(caps) =
    rel_re.captures(&lower)
  {
    let num: i64 = caps
      .name("num")
      .map(|m| m.as_str())
      .ok_or_else(|| {
        anyhow!(
          "missing relative amount"
        )
      })?
      .parse()
      .context(
        "invalid relative number"
      )?;
    let days = match caps
      .name("unit")
      .map(|m| m.as_str())
    {
      | Some("w") => num.checked_mul(7),
      | _ => Some(num)
    };
    let sign = caps
      .name("sign")
      .map(|m| m.as_str());
    let days = if sign == Some("-") {
      days.and_then(i64::checked_neg)
    } else {
      days
    };
    return days
      .and_then(|days| {
        checked_add_days(today, days)
      })
      .ok_or_else(|| {
        anyhow!(
          "date offset out of range: \
           {input}"
        )
      });
  }

  parse_iso_date(token)
    .ok_or_else(|| {
      anyhow!(
        "unrecognized date \
         expression: {input}"
      )
    })
    .with_context(|| {
      "supported formats: \
       today/tomorrow/yesterday, \
       weekday names (e.g. monday), \
       +Nd/-Nd/+Nw, YYYY-MM-DD, \
       YYYY/MM/DD, MM/DD/YYYY, month \
       names (e.g. March 5, 2024)"
    })
}

fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "monday" | "mon" => {
      Some(Weekday::Mon)
    }
    | "tuesday" | "tue" | "tues" => {
      Some(Weekday::Tue)
    }
    | "wednesday" | "wed" => {
      Some(Weekday::Wed)
    }
    | "thursday" | "thu" | "thur"
    | "thurs" => Some(Weekday::Thu),
    | "friday" | "fri" => {
      Some(Weekday::Fri)
    }
    | "saturday" | "sat" => {
      Some(Weekday::Sat)
    }
    | "sunday" | "sun" => {
      Some(Weekday::Sun)
    }
    | _ => None
  }
}

fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let from_idx = from
    .weekday()
    .num_days_from_monday()
    as i64;
  let target_idx = target
    .num_days_from_monday()
    as i64;
  let mut delta =
    (7 + target_idx - from_idx) % 7;
  if delta == 0 {
    delta = 7;
  }
  add_days(from, delta)
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::{
    add_days,
    add_days_iso,
    checked_add_days,
    add_month_clamped,
    days_between,
    normalize_date,
    parse_date_expr,
    to_minutes_of_day
  };

  fn date(
    y: i32,
    m: u32,
    d: u32
  ) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d)
      .expect("valid date")
  }

  #[test]
  fn canonical_dates_pass_through() {
    assert_eq!(
      normalize_date("2024-03-01"),
      "2024-03-01"
    );
    assert_eq!(
      normalize_date("2024-13-45"),
      "2024-13-45"
    );
  }

  #[test]
  fn general_dates_are_reformatted() {
    assert_eq!(
      normalize_date("2024/03/05"),
      "2024-03-05"
    );
    assert_eq!(
      normalize_date("03/05/2024"),
      "2024-03-05"
    );
    assert_eq!(
      normalize_date("March 5, 2024"),
      "2024-03-05"
    );
    assert_eq!(
      normalize_date(
        "2024-03-05 10:30"
      ),
      "2024-03-05"
    );
  }

  #[test]
  fn garbage_dates_become_empty() {
    assert_eq!(normalize_date(""), "");
    assert_eq!(
      normalize_date("not a date"),
      ""
    );
  }

  #[test]
  fn clock_times_parse_to_minutes() {
    assert_eq!(
      to_minutes_of_day("09:00", 0),
      540
    );
    assert_eq!(
      to_minutes_of_day("9:05", 0),
      545
    );
    assert_eq!(
      to_minutes_of_day("3:23PM", 0),
      15 * 60 + 23
    );
    assert_eq!(
      to_minutes_of_day("12am", 99),
      0
    );
    assert_eq!(
      to_minutes_of_day("12:30 pm", 0),
      750
    );
    assert_eq!(
      to_minutes_of_day("7", 0),
      420
    );
  }

  #[test]
  fn bad_clock_times_use_fallback() {
    assert_eq!(
      to_minutes_of_day("25:00", 7),
      7
    );
    assert_eq!(
      to_minutes_of_day("13pm", 7),
      7
    );
    assert_eq!(
      to_minutes_of_day("10:75", 7),
      7
    );
    assert_eq!(
      to_minutes_of_day("", 7),
      7
    );
  }

  #[test]
  fn add_days_rolls_over_boundaries() {
    assert_eq!(
      add_days(date(2024, 2, 28), 1),
      date(2024, 2, 29)
    );
    assert_eq!(
      add_days(date(2023, 2, 28), 1),
      date(2023, 3, 1)
    );
    assert_eq!(
      add_days(date(2024, 12, 31), 1),
      date(2025, 1, 1)
    );
    assert_eq!(
      add_days_iso("2024-03-01", -1),
      "2024-02-29"
    );
    assert_eq!(
      add_days_iso("garbage", 1),
      ""
    );
  }

  #[test]
  fn month_steps_clamp_to_month_end() {
    assert_eq!(
      add_month_clamped(date(
        2024, 1, 31
      )),
      date(2024, 2, 29)
    );
    assert_eq!(
      add_month_clamped(date(
        2023, 1, 31
      )),
      date(2023, 2, 28)
    );
    assert_eq!(
      add_month_clamped(date(
        2024, 12, 15
      )),
      date(2025, 1, 15)
    );
  }

  #[test]
  fn days_between_is_signed() {
    assert_eq!(
      days_between(
        date(2024, 3, 1),
        date(2024, 3, 31)
      ),
      30
    );
    assert_eq!(
      days_between(
        date(2024, 3, 31),
        date(2024, 3, 1)
      ),
      -30
    );
  }

  #[test]
  fn parses_relative_expressions() {
    let today = date(2026, 2, 17);
    assert_eq!(
      parse_date_expr("tomorrow", today)
        .expect("tomorrow"),
      date(2026, 2, 18)
    );
    assert_eq!(
      parse_date_expr("wednesday", today)
        .expect("weekday"),
      date(2026, 2, 18)
    );
    assert_eq!(
      parse_date_expr("+2w", today)
        .expect("weeks"),
      date(2026, 3, 3)
    );
    assert!(
      parse_date_expr("someday", today)
        .is_err()
    );
  }

  #[test]
  fn huge_offsets_are_errors_not_panics() {
    let today = date(2024, 3, 1);
    for input in [
      "+999999999999999d",
      "-999999999999999d",
      "+9223372036854775807w",
      "+99999999999999999999d"
    ] {
      assert!(
        parse_date_expr(input, today)
          .is_err(),
        "{input} should be rejected"
      );
    }
    assert_eq!(
      add_days(today, i64::MAX),
      today
    );
    assert_eq!(
      checked_add_days(today, i64::MIN),
      None
    );
  }
}
