use crate::errors::{AppError, AppResult};
use crate::models::{DatePreset, DateRange, RollingUnit};
use crate::value::value_as_datetime;
use chrono::{DateTime, Datelike, Duration, Local, Months, NaiveDate, TimeZone, Utc};

/// Resolved inclusive bounds. `None` means all-time: the date-filter step
/// is skipped entirely.
pub type ResolvedRange = Option<(DateTime<Utc>, DateTime<Utc>)>;

pub fn resolve_date_range(range: &DateRange, now: DateTime<Local>) -> AppResult<ResolvedRange> {
    match range {
        DateRange::Preset { preset } => resolve_preset(*preset, now),
        DateRange::Custom {
            start_date,
            end_date,
        } => {
            let start = parse_bound(start_date, false)?;
            let end = parse_bound(end_date, true)?;
            Ok(Some((start, end)))
        }
        DateRange::Rolling { count, unit } => {
            let start = match unit {
                RollingUnit::Days => now - Duration::days(i64::from(*count)),
                RollingUnit::Weeks => now - Duration::weeks(i64::from(*count)),
                RollingUnit::Months => now
                    .checked_sub_months(Months::new(*count))
                    .ok_or_else(|| AppError::Config("rolling range out of bounds".to_string()))?,
                RollingUnit::Years => now
                    .checked_sub_months(Months::new(count.saturating_mul(12)))
                    .ok_or_else(|| AppError::Config("rolling range out of bounds".to_string()))?,
            };
            Ok(Some((start.with_timezone(&Utc), now.with_timezone(&Utc))))
        }
    }
}

/// Human label for the parameters echo on a generated report.
pub fn describe_date_range(range: &DateRange) -> String {
    match range {
        DateRange::Preset { preset } => preset.label().to_string(),
        DateRange::Custom {
            start_date,
            end_date,
        } => format!("{start_date} to {end_date}"),
        DateRange::Rolling { count, unit } => {
            let unit = match unit {
                RollingUnit::Days => "days",
                RollingUnit::Weeks => "weeks",
                RollingUnit::Months => "months",
                RollingUnit::Years => "years",
            };
            format!("Last {count} {unit}")
        }
    }
}

fn resolve_preset(preset: DatePreset, now: DateTime<Local>) -> AppResult<ResolvedRange> {
    let today = now.date_naive();
    let bounds = match preset {
        DatePreset::AllTime => return Ok(None),
        DatePreset::Today => (today, today),
        DatePreset::Yesterday => {
            let yesterday = today - Duration::days(1);
            (yesterday, yesterday)
        }
        // Weeks start on Sunday.
        DatePreset::ThisWeek => {
            let start = today - Duration::days(i64::from(now.weekday().num_days_from_sunday()));
            (start, start + Duration::days(6))
        }
        DatePreset::LastWeek => {
            let this_start =
                today - Duration::days(i64::from(now.weekday().num_days_from_sunday()));
            let start = this_start - Duration::days(7);
            (start, start + Duration::days(6))
        }
        DatePreset::ThisMonth => {
            let start = first_of_month(today)?;
            (start, last_of_month(start)?)
        }
        DatePreset::LastMonth => {
            let start = first_of_month(today)?
                .checked_sub_months(Months::new(1))
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            (start, last_of_month(start)?)
        }
        DatePreset::ThisQuarter => {
            let quarter_month = ((today.month0() / 3) * 3) + 1;
            let start = NaiveDate::from_ymd_opt(today.year(), quarter_month, 1)
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            let end_start = start
                .checked_add_months(Months::new(2))
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            (start, last_of_month(end_start)?)
        }
        DatePreset::ThisYear => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            let end = NaiveDate::from_ymd_opt(today.year(), 12, 31)
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            (start, end)
        }
        DatePreset::Mtd => (first_of_month(today)?, today),
        DatePreset::Ytd => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            (start, today)
        }
        DatePreset::Last7Days => (today - Duration::days(7), today),
        DatePreset::Last30Days => (today - Duration::days(30), today),
        DatePreset::Last90Days => (today - Duration::days(90), today),
        DatePreset::Last12Months => {
            let start = today
                .checked_sub_months(Months::new(12))
                .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
            (start, today)
        }
    };
    Ok(Some((day_start(bounds.0)?, day_end(bounds.1)?)))
}

fn first_of_month(date: NaiveDate) -> AppResult<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))
}

fn last_of_month(date: NaiveDate) -> AppResult<NaiveDate> {
    let first = first_of_month(date)?;
    let next = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
    Ok(next - Duration::days(1))
}

fn day_start(date: NaiveDate) -> AppResult<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))
}

fn day_end(date: NaiveDate) -> AppResult<DateTime<Utc>> {
    let naive = date
        .and_hms_milli_opt(23, 59, 59, 999)
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))?;
    Local
        .from_local_datetime(&naive)
        .latest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| AppError::Config("date range out of bounds".to_string()))
}

fn parse_bound(text: &str, end_of_day: bool) -> AppResult<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d") {
        return if end_of_day { day_end(date) } else { day_start(date) };
    }
    value_as_datetime(&serde_json::Value::String(text.to_string()))
        .ok_or_else(|| AppError::Config(format!("unparseable custom date '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, 30, 0)
            .single()
            .expect("local timestamp")
    }

    #[test]
    fn all_time_resolves_to_no_bounds() {
        let range = DateRange::Preset {
            preset: DatePreset::AllTime,
        };
        assert!(resolve_date_range(&range, at(2026, 8, 30, 10))
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn today_covers_midnight_to_midnight() {
        let now = at(2026, 8, 30, 10);
        let (start, end) = resolve_date_range(
            &DateRange::Preset {
                preset: DatePreset::Today,
            },
            now,
        )
        .expect("resolve")
        .expect("bounds");
        assert!(start <= now.with_timezone(&Utc));
        assert!(end >= now.with_timezone(&Utc));
        assert_eq!((end - start).num_seconds(), 86_399);
    }

    #[test]
    fn weeks_start_on_sunday() {
        // 2026-08-26 is a Wednesday; the week began Sunday the 23rd.
        let now = at(2026, 8, 26, 12);
        let (start, end) = resolve_date_range(
            &DateRange::Preset {
                preset: DatePreset::ThisWeek,
            },
            now,
        )
        .expect("resolve")
        .expect("bounds");
        assert_eq!(start.with_timezone(&Local).date_naive().day(), 23);
        assert_eq!(end.with_timezone(&Local).date_naive().day(), 29);
    }

    #[test]
    fn mtd_ends_today_while_this_month_covers_the_calendar_month() {
        let now = at(2026, 8, 15, 9);
        let (_, mtd_end) = resolve_date_range(
            &DateRange::Preset {
                preset: DatePreset::Mtd,
            },
            now,
        )
        .expect("resolve")
        .expect("bounds");
        let (_, month_end) = resolve_date_range(
            &DateRange::Preset {
                preset: DatePreset::ThisMonth,
            },
            now,
        )
        .expect("resolve")
        .expect("bounds");
        assert!(mtd_end < month_end);
        assert_eq!(month_end.with_timezone(&Local).date_naive().day(), 31);
    }

    #[test]
    fn rolling_months_window_ends_now() {
        let now = at(2026, 8, 30, 10);
        let (start, end) = resolve_date_range(
            &DateRange::Rolling {
                count: 6,
                unit: RollingUnit::Months,
            },
            now,
        )
        .expect("resolve")
        .expect("bounds");
        assert_eq!(end, now.with_timezone(&Utc));
        assert_eq!(start.with_timezone(&Local).date_naive().month(), 2);
    }

    #[test]
    fn custom_bounds_expand_bare_dates() {
        let range = DateRange::Custom {
            start_date: "2026-01-01".to_string(),
            end_date: "2026-01-31".to_string(),
        };
        let (start, end) = resolve_date_range(&range, at(2026, 8, 30, 10))
            .expect("resolve")
            .expect("bounds");
        assert!(end > start);
        assert_eq!(end.with_timezone(&Local).date_naive().day(), 31);

        let bad = DateRange::Custom {
            start_date: "soon".to_string(),
            end_date: "later".to_string(),
        };
        assert!(resolve_date_range(&bad, at(2026, 8, 30, 10)).is_err());
    }
}
