use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{
  Mutex,
  OnceLock
};

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Duration,
  LocalResult,
  NaiveDate,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

use crate::todo::DateTag;

const TIMEZONE_CONFIG_FILE: &str =
  "nudge-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "NUDGE_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "NUDGE_TIME_CONFIG";

/// Source of "now" for everything that
/// depends on the current day.
pub trait Clock:
  Send + Sync + fmt::Debug
{
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  current: Mutex<DateTime<Utc>>
}

impl ManualClock {
  pub fn new(
    start: DateTime<Utc>
  ) -> Self {
    Self {
      current: Mutex::new(start)
    }
  }

  pub fn set(
    &self,
    value: DateTime<Utc>
  ) {
    let mut guard = self
      .current
      .lock()
      .unwrap_or_else(|poisoned| {
        poisoned.into_inner()
      });
    *guard = value;
  }

  pub fn advance(
    &self,
    by: Duration
  ) {
    let mut guard = self
      .current
      .lock()
      .unwrap_or_else(|poisoned| {
        poisoned.into_inner()
      });
    *guard += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.current.lock().unwrap_or_else(
      |poisoned| poisoned.into_inner()
    )
  }
}

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// Resolves the timezone that defines
/// calendar days.
///
/// Order: explicit configuration,
/// `NUDGE_TIMEZONE`, a `nudge-time.toml`
/// file, `TZ`, then UTC.
pub fn resolve_timezone(
  configured: Option<&str>
) -> Tz {
  if let Some(raw) = configured
    && let Some(tz) =
      parse_timezone(raw, "config")
  {
    return tz;
  }

  if let Ok(raw) =
    std::env::var(TIMEZONE_ENV_VAR)
    && let Some(tz) = parse_timezone(
      &raw,
      TIMEZONE_ENV_VAR
    )
  {
    return tz;
  }

  if let Some(path) =
    timezone_config_path()
    && let Some(tz) =
      load_timezone_from_file(&path)
  {
    return tz;
  }

  if let Ok(raw) = std::env::var("TZ")
    && let Some(tz) =
      parse_timezone(&raw, "TZ")
  {
    return tz;
  }

  tracing::warn!(
    "no timezone configured; days \
     are computed in UTC"
  );
  chrono_tz::UTC
}

fn timezone_config_path()
-> Option<PathBuf> {
  if let Ok(raw) = std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
      return Some(PathBuf::from(
        trimmed
      ));
    }
  }

  std::env::current_dir().ok().map(
    |dir| {
      dir.join(TIMEZONE_CONFIG_FILE)
    }
  )
}

fn load_timezone_from_file(
  path: &PathBuf
) -> Option<Tz> {
  if !path.exists() {
    tracing::debug!(
      file = %path.display(),
      "timezone config file not found"
    );
    return None;
  }

  let raw = match fs::read_to_string(
    path
  ) {
    | Ok(raw) => raw,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed reading timezone config file"
      );
      return None;
    }
  };

  let parsed = match toml::from_str::<
    TimezoneConfig
  >(&raw)
  {
    | Ok(parsed) => parsed,
    | Err(err) => {
      tracing::error!(
        file = %path.display(),
        error = %err,
        "failed parsing timezone config file"
      );
      return None;
    }
  };

  let timezone =
    parsed.timezone.or_else(|| {
      parsed.time.and_then(|section| {
        section.timezone
      })
    });
  let Some(timezone) = timezone else {
    tracing::warn!(
      file = %path.display(),
      "timezone config had no timezone field"
    );
    return None;
  };

  parse_timezone(
    timezone.as_str(),
    &format!("file:{}", path.display())
  )
}

fn parse_timezone(
  raw: &str,
  source: &str
) -> Option<Tz> {
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }

  match trimmed.parse::<Tz>() {
    | Ok(tz) => {
      tracing::debug!(
        source,
        timezone = %trimmed,
        "resolved timezone"
      );
      Some(tz)
    }
    | Err(err) => {
      tracing::error!(
        source,
        timezone = %trimmed,
        error = %err,
        "failed to parse timezone id"
      );
      None
    }
  }
}

/// The calendar day `ts` falls on in
/// `tz`. Day buckets are keyed by this.
#[must_use]
pub fn day_key(
  ts: DateTime<Utc>,
  tz: &Tz
) -> NaiveDate {
  ts.with_timezone(tz).date_naive()
}

/// Canonical `YYYY-MM-DD` text for a
/// day key.
#[must_use]
pub fn format_day_key(
  day: NaiveDate
) -> String {
  day.format("%Y-%m-%d").to_string()
}

/// First instant of `day` in `tz`.
///
/// Midnight can be skipped by a DST
/// transition; the first existing hour
/// of the day is used then.
#[must_use]
pub fn day_start(
  day: NaiveDate,
  tz: &Tz
) -> DateTime<Utc> {
  for hour in 0..24 {
    let Some(naive) =
      day.and_hms_opt(hour, 0, 0)
    else {
      continue;
    };
    match tz.from_local_datetime(&naive)
    {
      | LocalResult::Single(dt) => {
        return dt.with_timezone(&Utc);
      }
      | LocalResult::Ambiguous(
        first,
        second
      ) => {
        let chosen = if first <= second
        {
          first
        } else {
          second
        };
        return chosen
          .with_timezone(&Utc);
      }
      | LocalResult::None => {
        tracing::trace!(
          day = %day,
          hour,
          "local hour skipped by transition"
        );
      }
    }
  }

  // Unreachable for real zones; fall
  // back to UTC midnight.
  day
    .and_hms_opt(0, 0, 0)
    .map(|naive| naive.and_utc())
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Normalizes a timestamp to the start
/// of its calendar day in `tz`.
#[must_use]
pub fn start_of_day(
  ts: DateTime<Utc>,
  tz: &Tz
) -> DateTime<Utc> {
  day_start(day_key(ts, tz), tz)
}

#[must_use]
pub fn is_start_of_day(
  ts: DateTime<Utc>,
  tz: &Tz
) -> bool {
  start_of_day(ts, tz) == ts
}

/// `today`, `tomorrow` or `future`
/// relative to `now`. Past days are
/// tagged `future`, which is what
/// persisted records have always
/// carried.
#[must_use]
pub fn derive_date_tag(
  due: DateTime<Utc>,
  now: DateTime<Utc>,
  tz: &Tz
) -> DateTag {
  let target = day_key(due, tz);
  let today = day_key(now, tz);
  if target == today {
    DateTag::Today
  } else if today.succ_opt()
    == Some(target)
  {
    DateTag::Tomorrow
  } else {
    DateTag::Future
  }
}

fn relative_days_regex() -> &'static Regex
{
  static RE: OnceLock<Regex> =
    OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"^([+-])(\d{1,4})d?$"
    )
    .expect("static day offset regex")
  })
}

/// Parses a user day expression and
/// returns the start of that day.
///
/// Accepts `today`, `tomorrow`,
/// `yesterday`, `YYYY-MM-DD`, `+Nd` /
/// `-Nd` and weekday names (the next
/// occurrence after today).
#[tracing::instrument(skip(now, tz), fields(input = input))]
pub fn parse_day_expr(
  input: &str,
  now: DateTime<Utc>,
  tz: &Tz
) -> anyhow::Result<DateTime<Utc>> {
  let token = input.trim();
  if token.is_empty() {
    return Err(anyhow!(
      "day expression cannot be \
       empty"
    ));
  }
  let lower =
    token.to_ascii_lowercase();
  let today = day_key(now, tz);

  let day = match lower.as_str() {
    | "today" => today,
    | "tomorrow" => {
      today + Duration::days(1)
    }
    | "yesterday" => {
      today - Duration::days(1)
    }
    | _ => {
      if let Some(caps) =
        relative_days_regex()
          .captures(&lower)
      {
        let amount: i64 = caps[2]
          .parse()
          .context(
            "invalid day offset"
          )?;
        let signed =
          if &caps[1] == "-" {
            -amount
          } else {
            amount
          };
        today + Duration::days(signed)
      } else if let Some(weekday) =
        parse_weekday(&lower)
      {
        next_weekday(today, weekday)
      } else {
        NaiveDate::parse_from_str(
          token, "%Y-%m-%d"
        )
        .with_context(|| {
          format!(
            "unrecognized day \
             expression: {token}"
          )
        })?
      }
    }
  };

  Ok(day_start(day, tz))
}

fn next_weekday(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let current = from
    .weekday()
    .num_days_from_monday()
    as i64;
  let wanted =
    target.num_days_from_monday()
      as i64;
  let mut delta =
    (wanted - current).rem_euclid(7);
  if delta == 0 {
    delta = 7;
  }
  from + Duration::days(delta)
}

fn parse_weekday(
  s: &str
) -> Option<Weekday> {
  match s {
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
