use super::SchedError;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

// Five years of minutes; a cron expression with no match inside that horizon
// is rejected rather than searched forever.
const MAX_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;

/// A parsed 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week) evaluated in an IANA timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

#[derive(Debug, Clone)]
struct Field {
    any: bool,
    allowed: BTreeSet<u32>,
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        self.any || self.allowed.contains(&value)
    }
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self, SchedError> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                "cron expression must use 5 fields: minute hour day_of_month month day_of_week",
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, None)?,
            hour: parse_field(fields[1], 0, 23, None)?,
            day_of_month: parse_field(fields[2], 1, 31, None)?,
            month: parse_field(fields[3], 1, 12, Some(&MONTH_ALIASES))?,
            day_of_week: parse_field(fields[4], 0, 7, Some(&WEEKDAY_ALIASES))?,
        })
    }

    pub fn matches_at(&self, unix_ts: i64, timezone: &Tz) -> bool {
        let Some(utc) = Utc.timestamp_opt(unix_ts, 0).single() else {
            return false;
        };
        let local = utc.with_timezone(timezone);

        if !self.minute.matches(local.minute())
            || !self.hour.matches(local.hour())
            || !self.month.matches(local.month())
        {
            return false;
        }

        let dom = self.day_of_month.matches(local.day());
        let dow = self
            .day_of_week
            .matches(local.weekday().num_days_from_sunday());

        // Vixie-cron semantics: when both day fields are restricted, either
        // may match; otherwise both must.
        if self.day_of_month.any || self.day_of_week.any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First matching minute strictly after `after`, bounded by the search
    /// horizon.
    pub fn next_after(&self, after: i64, timezone: &Tz) -> Result<i64, SchedError> {
        let mut candidate = ((after / 60) + 1) * 60;
        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches_at(candidate, timezone) {
                return Ok(candidate);
            }
            candidate = candidate.saturating_add(60);
        }
        Err(invalid("cron expression never matches within five years"))
    }
}

pub fn parse_timezone(raw: &str) -> Result<Tz, SchedError> {
    raw.parse::<Tz>().map_err(|_| {
        invalid(&format!(
            "invalid timezone `{raw}`; expected IANA timezone id"
        ))
    })
}

const MONTH_ALIASES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const WEEKDAY_ALIASES: [(&str, u32); 7] = [
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

fn parse_field(
    raw: &str,
    min: u32,
    max: u32,
    aliases: Option<&[(&str, u32)]>,
) -> Result<Field, SchedError> {
    if raw == "*" {
        return Ok(Field {
            any: true,
            allowed: BTreeSet::new(),
        });
    }

    let mut allowed = BTreeSet::new();
    for segment in raw.split(',') {
        let (range_raw, step) = match segment.split_once('/') {
            Some((range, step_raw)) => {
                let step = step_raw
                    .parse::<u32>()
                    .map_err(|_| invalid(&format!("invalid cron step `{step_raw}`")))?;
                if step == 0 {
                    return Err(invalid("cron step must be >= 1"));
                }
                (range, step)
            }
            None => (segment, 1),
        };

        let (start, end) = if range_raw == "*" {
            (min, max)
        } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
            (
                parse_atom(start_raw, min, max, aliases)?,
                parse_atom(end_raw, min, max, aliases)?,
            )
        } else {
            let single = parse_atom(range_raw, min, max, aliases)?;
            (single, single)
        };

        if start > end {
            return Err(invalid(&format!("invalid cron range `{segment}`")));
        }

        let mut value = start;
        while value <= end {
            // Cron allows 7 for Sunday in the day-of-week field.
            let normalized = if max == 7 && value == 7 { 0 } else { value };
            allowed.insert(normalized);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }

    if allowed.is_empty() {
        return Err(invalid(&format!("invalid cron field `{raw}`")));
    }
    Ok(Field {
        any: false,
        allowed,
    })
}

fn parse_atom(
    raw: &str,
    min: u32,
    max: u32,
    aliases: Option<&[(&str, u32)]>,
) -> Result<u32, SchedError> {
    let lower = raw.to_ascii_lowercase();
    let value = aliases
        .and_then(|table| {
            table
                .iter()
                .find(|(name, _)| *name == lower.as_str())
                .map(|(_, value)| *value)
        })
        .map_or_else(
            || {
                lower
                    .parse::<u32>()
                    .map_err(|_| invalid(&format!("invalid cron value `{raw}`")))
            },
            Ok,
        )?;

    if value < min || value > max {
        return Err(invalid(&format!(
            "cron value `{raw}` is out of bounds ({min}..={max})"
        )));
    }
    Ok(value)
}

fn invalid(message: &str) -> SchedError {
    SchedError::InvalidSchedule {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_matches_simple_expressions() {
        let every_minute = CronSchedule::parse("* * * * *").expect("parse");
        let tz: Tz = "UTC".parse().expect("tz");
        assert!(every_minute.matches_at(0, &tz));
        assert!(every_minute.matches_at(60, &tz));

        // 1970-01-01 09:30 UTC.
        let daily = CronSchedule::parse("30 9 * * *").expect("parse");
        assert!(daily.matches_at(9 * 3600 + 30 * 60, &tz));
        assert!(!daily.matches_at(9 * 3600, &tz));
    }

    #[test]
    fn steps_ranges_and_aliases() {
        let schedule = CronSchedule::parse("*/15 0-6 1 jan sun").expect("parse");
        let tz: Tz = "UTC".parse().expect("tz");
        // 1970-01-01 was a Thursday; restricted dom/dow use OR semantics, so
        // Jan 1 matches via day-of-month.
        assert!(schedule.matches_at(0, &tz));
        assert!(schedule.matches_at(15 * 60, &tz));
        assert!(!schedule.matches_at(7 * 60, &tz));
    }

    #[test]
    fn sunday_accepts_both_zero_and_seven() {
        let with_seven = CronSchedule::parse("0 0 * * 7").expect("parse");
        let with_zero = CronSchedule::parse("0 0 * * 0").expect("parse");
        let tz: Tz = "UTC".parse().expect("tz");
        // 1970-01-04 was a Sunday.
        let sunday_midnight = 3 * 86_400;
        assert!(with_seven.matches_at(sunday_midnight, &tz));
        assert!(with_zero.matches_at(sunday_midnight, &tz));
    }

    #[test]
    fn next_after_lands_on_the_following_match() {
        let hourly = CronSchedule::parse("0 * * * *").expect("parse");
        let tz: Tz = "UTC".parse().expect("tz");
        assert_eq!(hourly.next_after(0, &tz).expect("next"), 3600);
        assert_eq!(hourly.next_after(3599, &tz).expect("next"), 3600);
        assert_eq!(hourly.next_after(3600, &tz).expect("next"), 7200);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(parse_timezone("Not/AZone").is_err());
        assert!(parse_timezone("America/New_York").is_ok());
    }
}
