use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    GeneratedReport, QueueStatus, ReportQueueItem, ScheduleFrequency, ScheduleSpec,
    ScheduledReport, SchedulerError, SchedulerRunState, SchedulerStatus,
};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Months, NaiveDate, Timelike, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tokio::time::Duration;
use uuid::Uuid;

pub const TICK_PERIOD: Duration = Duration::from_secs(60);

type Executor = Arc<dyn Fn(&str, &str) -> Option<GeneratedReport> + Send + Sync>;

/// Timer-driven scheduler. Once per minute it scans persisted schedules,
/// runs the due ones through the injected executor sequentially in array
/// order, and recomputes each schedule's next run. The in-memory running
/// flag only gates whether the timer task exists; due-detection is always
/// recomputed from stored data.
pub struct ReportScheduler {
    db: Arc<Database>,
    executor: RwLock<Option<Executor>>,
    running: AtomicBool,
    stop: Arc<Notify>,
}

impl ReportScheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            executor: RwLock::new(None),
            running: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        let mut writer = self
            .executor
            .write()
            .expect("scheduler executor write lock");
        *writer = Some(executor);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.persist_run_state(|state| {
            state.is_running = true;
            state.started_at = Some(Utc::now());
            state.stopped_at = None;
        });

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_PERIOD);
            // The immediate first tick from tokio's interval is consumed so
            // the first real check happens one period after start.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !scheduler.is_running() {
                            break;
                        }
                        scheduler.tick(Local::now());
                    }
                    _ = scheduler.stop.notified() => break,
                }
            }
            scheduler.persist_run_state(|state| {
                state.is_running = false;
                state.stopped_at = Some(Utc::now());
            });
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }

    /// One scheduler pass. Public so manual "check now" and tests can drive
    /// it without the timer.
    pub fn tick(&self, now: DateTime<Local>) {
        self.persist_run_state(|state| {
            state.last_check = Some(now.with_timezone(&Utc));
        });

        let schedules = match self.db.list_schedules() {
            Ok(schedules) => schedules,
            Err(error) => {
                tracing::warn!(error = %error, "scheduler could not load schedules");
                return;
            }
        };

        let now_utc = now.with_timezone(&Utc);
        for schedule in schedules {
            if !schedule.is_active || schedule.next_run > now_utc {
                continue;
            }
            self.execute_due(&schedule, now);
        }
    }

    fn execute_due(&self, schedule: &ScheduledReport, now: DateTime<Local>) {
        let queue_item = ReportQueueItem {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            template_id: schedule.template_id.clone(),
            scheduled_for: schedule.next_run,
            priority: schedule.schedule.frequency.queue_priority(),
            status: QueueStatus::Pending,
            report_id: None,
            error: None,
        };
        if let Err(error) = self.db.push_queue_item(&queue_item) {
            tracing::warn!(schedule_id = %schedule.id, error = %error, "failed to enqueue report run");
        }
        self.update_queue(&queue_item.id, QueueStatus::Processing, None, None);

        let executor = self
            .executor
            .read()
            .expect("scheduler executor read lock")
            .clone();
        let outcome = match executor {
            Some(executor) => executor(&schedule.template_id, &schedule.created_by),
            None => {
                tracing::warn!(schedule_id = %schedule.id, "no executor installed, marking run failed");
                None
            }
        };

        match outcome {
            Some(report) => {
                self.update_queue(
                    &queue_item.id,
                    QueueStatus::Completed,
                    Some(report.id.clone()),
                    None,
                );
                let date_key = now.format("%Y-%m-%d").to_string();
                if let Err(error) = self.db.increment_daily_count(&date_key) {
                    tracing::warn!(error = %error, "failed to bump daily execution counter");
                }
            }
            None => {
                let message = format!(
                    "scheduled generation failed for template {}",
                    schedule.template_id
                );
                self.update_queue(
                    &queue_item.id,
                    QueueStatus::Failed,
                    None,
                    Some(message.clone()),
                );
                self.record_error(schedule, message);
            }
        }

        // Failed runs stay active and are re-planned like successful ones;
        // there is no backoff and no automatic disablement.
        let mut updated = schedule.clone();
        updated.last_run = Some(now.with_timezone(&Utc));
        updated.run_count += 1;
        updated.next_run = match next_run_after(&schedule.schedule, now) {
            Ok(next) => next,
            Err(error) => {
                tracing::warn!(schedule_id = %schedule.id, error = %error, "next-run calculation failed, deferring one day");
                now.with_timezone(&Utc) + ChronoDuration::days(1)
            }
        };
        if let Err(error) = self.db.save_schedule(&updated) {
            tracing::warn!(schedule_id = %schedule.id, error = %error, "failed to persist schedule update");
        }
    }

    fn update_queue(&self, id: &str, status: QueueStatus, report_id: Option<String>, error: Option<String>) {
        if let Err(err) = self.db.update_queue_item(id, status, report_id, error) {
            tracing::warn!(queue_item = %id, error = %err, "failed to update queue item");
        }
    }

    fn record_error(&self, schedule: &ScheduledReport, message: String) {
        let schedule_name = self
            .db
            .get_template(&schedule.template_id)
            .ok()
            .flatten()
            .map(|template| template.name)
            .unwrap_or_else(|| schedule.template_id.clone());
        let entry = SchedulerError {
            id: Uuid::new_v4().to_string(),
            schedule_id: schedule.id.clone(),
            schedule_name,
            error: message,
            occurred_at: Utc::now(),
            resolved: false,
        };
        if let Err(error) = self.db.push_scheduler_error(&entry) {
            tracing::warn!(schedule_id = %schedule.id, error = %error, "failed to record scheduler error");
        }
    }

    fn persist_run_state(&self, apply: impl FnOnce(&mut SchedulerRunState)) {
        let result = self.db.scheduler_state().and_then(|mut state| {
            apply(&mut state);
            self.db.save_scheduler_state(&state)
        });
        if let Err(error) = result {
            tracing::warn!(error = %error, "failed to persist scheduler run state");
        }
    }

    pub fn status(&self) -> AppResult<SchedulerStatus> {
        let state = self.db.scheduler_state()?;
        let schedules = self.db.list_schedules()?;
        let errors = self.db.list_scheduler_errors()?;
        let today = Local::now().format("%Y-%m-%d").to_string();

        let mut recent_errors: Vec<SchedulerError> = errors
            .into_iter()
            .rev()
            .filter(|entry| !entry.resolved)
            .take(10)
            .collect();
        recent_errors.reverse();

        Ok(SchedulerStatus {
            is_running: self.is_running(),
            last_check: state.last_check,
            next_check: state
                .last_check
                .map(|check| check + ChronoDuration::seconds(TICK_PERIOD.as_secs() as i64)),
            active_schedules: schedules.iter().filter(|s| s.is_active).count(),
            completed_today: self.db.daily_count(&today)?,
            recent_errors,
        })
    }
}

pub fn parse_schedule_time(time: &str) -> AppResult<(u32, u32)> {
    let (hours, minutes) = time
        .split_once(':')
        .ok_or_else(|| AppError::Config(format!("schedule time '{time}' is not HH:MM")))?;
    let hours: u32 = hours
        .parse()
        .map_err(|_| AppError::Config(format!("schedule time '{time}' is not HH:MM")))?;
    let minutes: u32 = minutes
        .parse()
        .map_err(|_| AppError::Config(format!("schedule time '{time}' is not HH:MM")))?;
    if hours > 23 || minutes > 59 {
        return Err(AppError::Config(format!(
            "schedule time '{time}' is out of range"
        )));
    }
    Ok((hours, minutes))
}

/// Next execution instant: anchor today at the schedule's HH:MM, then
/// advance exactly one period. Repeated application is strictly
/// increasing. `dayOfMonth` pinning clamps to the target month's length
/// (day 31 in a 30-day month becomes day 30).
pub fn next_run_after(spec: &ScheduleSpec, now: DateTime<Local>) -> AppResult<DateTime<Utc>> {
    let (hours, minutes) = parse_schedule_time(&spec.time)?;
    let anchor = now
        .with_hour(hours)
        .and_then(|at| at.with_minute(minutes))
        .and_then(|at| at.with_second(0))
        .and_then(|at| at.with_nanosecond(0))
        .ok_or_else(|| AppError::Config(format!("schedule time '{}' unrepresentable", spec.time)))?;

    let next = match spec.frequency {
        ScheduleFrequency::Daily => anchor + ChronoDuration::days(1),
        ScheduleFrequency::Weekly => anchor + ChronoDuration::days(7),
        ScheduleFrequency::Monthly => pin_day(advance_months(anchor, 1)?, spec.day_of_month)?,
        ScheduleFrequency::Quarterly => pin_day(advance_months(anchor, 3)?, spec.day_of_month)?,
        ScheduleFrequency::Yearly => pin_day(advance_months(anchor, 12)?, spec.day_of_month)?,
    };
    Ok(next.with_timezone(&Utc))
}

fn advance_months(at: DateTime<Local>, months: u32) -> AppResult<DateTime<Local>> {
    at.checked_add_months(Months::new(months))
        .ok_or_else(|| AppError::Config("next run out of calendar range".to_string()))
}

fn pin_day(at: DateTime<Local>, day_of_month: Option<u32>) -> AppResult<DateTime<Local>> {
    let Some(day) = day_of_month else {
        return Ok(at);
    };
    let clamped = day.min(days_in_month(at.year(), at.month())?);
    at.with_day(clamped)
        .ok_or_else(|| AppError::Config("next run out of calendar range".to_string()))
}

fn days_in_month(year: i32, month: u32) -> AppResult<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| AppError::Config("next run out of calendar range".to_string()))?;
    let next = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| AppError::Config("next run out of calendar range".to_string()))?;
    Ok((next - first).num_days() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReportData, ReportParameters, ScheduleFrequency};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("local timestamp")
    }

    fn daily_spec(time: &str) -> ScheduleSpec {
        ScheduleSpec {
            frequency: ScheduleFrequency::Daily,
            time: time.to_string(),
            day_of_month: None,
        }
    }

    fn dummy_report(template_id: &str) -> GeneratedReport {
        GeneratedReport {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            template_name: "dummy".to_string(),
            config: crate::models::ReportConfig {
                data_sources: vec![],
                date_range: crate::models::DateRange::Preset {
                    preset: crate::models::DatePreset::AllTime,
                },
                filters: vec![],
                dimensions: vec![],
                metrics: vec![],
                sort_by: vec![],
                limit: None,
            },
            data: ReportData {
                rows: vec![],
                summary: BTreeMap::new(),
                row_count: 0,
                filtered_row_count: 0,
            },
            generated_at: Utc::now(),
            generated_by: "scheduler".to_string(),
            parameters: ReportParameters {
                date_range: "All time".to_string(),
                dimensions: vec![],
                metrics: vec![],
            },
        }
    }

    fn schedule(id: &str, active: bool, next_run: DateTime<Utc>) -> ScheduledReport {
        ScheduledReport {
            id: id.to_string(),
            template_id: "t-1".to_string(),
            created_by: "user-1".to_string(),
            is_active: active,
            schedule: daily_spec("09:00"),
            next_run,
            last_run: None,
            run_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn daily_next_run_is_twenty_four_hours_out_and_strictly_future() {
        let now = local(2026, 8, 30, 10, 15);
        let next = next_run_after(&daily_spec("09:00"), now).expect("next run");
        let expected = local(2026, 8, 31, 9, 0).with_timezone(&Utc);
        assert_eq!(next, expected);
        assert!(next > now.with_timezone(&Utc));

        let after = next_run_after(&daily_spec("09:00"), next.with_timezone(&Local)).expect("again");
        assert!(after > next);
    }

    #[test]
    fn monthly_pinning_clamps_day_overflow() {
        let spec = ScheduleSpec {
            frequency: ScheduleFrequency::Monthly,
            time: "08:00".to_string(),
            day_of_month: Some(31),
        };
        let now = local(2026, 1, 15, 12, 0);
        let next = next_run_after(&spec, now).expect("next run");
        let next_local = next.with_timezone(&Local);
        assert_eq!(next_local.month(), 2);
        assert_eq!(next_local.day(), 28);
    }

    #[test]
    fn malformed_times_are_rejected() {
        assert!(parse_schedule_time("9").is_err());
        assert!(parse_schedule_time("25:00").is_err());
        assert!(parse_schedule_time("09:75").is_err());
        assert_eq!(parse_schedule_time("09:30").expect("time"), (9, 30));
    }

    #[test]
    fn tick_runs_due_schedules_and_skips_inactive_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let scheduler = ReportScheduler::new(Arc::clone(&db));
        scheduler.set_executor(Arc::new(|template_id, _user| Some(dummy_report(template_id))));

        let now = Local::now();
        let past = now.with_timezone(&Utc) - ChronoDuration::minutes(1);
        db.save_schedule(&schedule("due", true, past)).expect("save due");
        db.save_schedule(&schedule("dormant", false, past))
            .expect("save dormant");

        scheduler.tick(now);

        let queue = db.list_queue().expect("queue");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].schedule_id, "due");
        assert_eq!(queue[0].status, QueueStatus::Completed);
        assert!(queue[0].report_id.is_some());

        let updated = db.get_schedule("due").expect("get").expect("exists");
        assert_eq!(updated.run_count, 1);
        assert!(updated.next_run > now.with_timezone(&Utc));
        assert!(updated.is_active);

        let dormant = db.get_schedule("dormant").expect("get").expect("exists");
        assert_eq!(dormant.run_count, 0);
    }

    #[test]
    fn failed_runs_keep_the_schedule_active_and_log_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let scheduler = ReportScheduler::new(Arc::clone(&db));
        scheduler.set_executor(Arc::new(|_, _| None));

        let now = Local::now();
        let past = now.with_timezone(&Utc) - ChronoDuration::minutes(5);
        db.save_schedule(&schedule("flaky", true, past)).expect("save");

        scheduler.tick(now);

        let queue = db.list_queue().expect("queue");
        assert_eq!(queue[0].status, QueueStatus::Failed);
        assert!(queue[0].error.is_some());

        let errors = db.list_scheduler_errors().expect("errors");
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].resolved);

        let updated = db.get_schedule("flaky").expect("get").expect("exists");
        assert!(updated.is_active);
        assert!(updated.next_run > now.with_timezone(&Utc));
        assert_eq!(updated.run_count, 1);

        let status = scheduler.status().expect("status");
        assert_eq!(status.recent_errors.len(), 1);
        assert_eq!(status.completed_today, 0);
    }

    #[tokio::test]
    async fn start_and_stop_persist_run_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let scheduler = Arc::new(ReportScheduler::new(Arc::clone(&db)));

        scheduler.start();
        assert!(scheduler.is_running());
        let state = db.scheduler_state().expect("state");
        assert!(state.is_running);
        assert!(state.started_at.is_some());

        scheduler.stop();
        assert!(!scheduler.is_running());
        // The spawned task persists the stopped state asynchronously.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = db.scheduler_state().expect("state");
        assert!(!state.is_running);
        assert!(state.stopped_at.is_some());
    }
}
