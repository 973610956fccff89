use crate::daterange::describe_date_range;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    GeneratedReport, HistoryStatus, ReportConfig, ReportHistoryEntry, ReportParameters,
    ReportQueueItem, ReportTemplate, ScheduleSpec, ScheduledReport, SchedulerError,
};
use crate::query::execute_report_query;
use crate::scheduler::{next_run_after, parse_schedule_time, ReportScheduler};
use crate::sources::DataSources;
use chrono::{Local, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Facade over the template store, the query executor and the scheduler
/// bookkeeping. One instance per process; all operations are synchronous.
pub struct ReportEngine {
    db: Arc<Database>,
    sources: DataSources,
}

impl ReportEngine {
    pub fn new(db: Arc<Database>) -> Self {
        let sources = DataSources::new(Arc::clone(&db));
        Self { db, sources }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Wire this engine in as the scheduler's executor.
    pub fn attach_to_scheduler(self: &Arc<Self>, scheduler: &ReportScheduler) {
        let engine = Arc::clone(self);
        scheduler.set_executor(Arc::new(move |template_id, user_id| {
            engine.generate_report(template_id, user_id, "scheduler")
        }));
    }

    // ── templates ───────────────────────────────────────────────────────

    pub fn list_templates(&self, user_id: &str) -> AppResult<Vec<ReportTemplate>> {
        self.db.list_templates(user_id)
    }

    pub fn get_template(&self, id: &str) -> AppResult<Option<ReportTemplate>> {
        self.db.get_template(id)
    }

    pub fn create_template(
        &self,
        name: &str,
        description: &str,
        config: ReportConfig,
        user_id: &str,
    ) -> AppResult<ReportTemplate> {
        if let Err(problems) = config.validate() {
            return Err(AppError::Config(problems.join("; ")));
        }
        let now = Utc::now();
        let template = ReportTemplate {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            config,
            created_by: user_id.to_string(),
            shared_with: Vec::new(),
            is_shared: false,
            is_system_template: false,
            generation_count: 0,
            last_generated: None,
            is_favorite: false,
            created_at: now,
            updated_at: now,
        };
        self.db.save_template(&template)
    }

    pub fn save_template(&self, template: &ReportTemplate) -> AppResult<ReportTemplate> {
        self.db.save_template(template)
    }

    pub fn delete_template(&self, id: &str) -> AppResult<()> {
        self.db.delete_template(id)
    }

    pub fn toggle_favorite(&self, id: &str) -> AppResult<ReportTemplate> {
        self.db.toggle_favorite(id)
    }

    pub fn share_template(
        &self,
        id: &str,
        user_ids: Vec<String>,
        broadcast: bool,
    ) -> AppResult<ReportTemplate> {
        let mut template = self
            .db
            .get_template(id)?
            .ok_or_else(|| AppError::NotFound(format!("template {id}")))?;
        template.shared_with = user_ids;
        template.is_shared = broadcast;
        self.db.save_template(&template)
    }

    pub fn duplicate_template(&self, id: &str, user_id: &str) -> AppResult<ReportTemplate> {
        let source = self
            .db
            .get_template(id)?
            .ok_or_else(|| AppError::NotFound(format!("template {id}")))?;
        let now = Utc::now();
        let copy = ReportTemplate {
            id: Uuid::new_v4().to_string(),
            name: format!("{} (copy)", source.name),
            created_by: user_id.to_string(),
            shared_with: Vec::new(),
            is_shared: false,
            is_system_template: false,
            generation_count: 0,
            last_generated: None,
            is_favorite: false,
            created_at: now,
            updated_at: now,
            ..source
        };
        self.db.save_template(&copy)
    }

    // ── generation ──────────────────────────────────────────────────────

    /// Generate a report from a template. Hard failures are recorded as a
    /// failed history entry and surface as `None`; they never propagate as
    /// panics or errors to the caller. Side bookkeeping (history, template
    /// counters, report persistence) is best-effort.
    pub fn generate_report(
        &self,
        template_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Option<GeneratedReport> {
        let started = Instant::now();
        match self.try_generate(template_id, user_name) {
            Ok(report) => {
                self.record_history(ReportHistoryEntry {
                    report_id: Some(report.id.clone()),
                    template_id: template_id.to_string(),
                    executed_at: report.generated_at,
                    executed_by: user_id.to_string(),
                    status: HistoryStatus::Success,
                    row_count: report.data.row_count,
                    execution_time: started.elapsed().as_millis() as u64,
                    error: None,
                });
                if let Err(error) = self.db.mark_template_generated(template_id) {
                    tracing::warn!(template_id, error = %error, "failed to bump template generation count");
                }
                if let Err(error) = self.db.push_generated_report(&report) {
                    tracing::warn!(template_id, error = %error, "failed to persist generated report");
                }
                Some(report)
            }
            Err(error) => {
                tracing::warn!(template_id, error = %error, "report generation failed");
                self.record_history(ReportHistoryEntry {
                    report_id: None,
                    template_id: template_id.to_string(),
                    executed_at: Utc::now(),
                    executed_by: user_id.to_string(),
                    status: HistoryStatus::Failed,
                    row_count: 0,
                    execution_time: started.elapsed().as_millis() as u64,
                    error: Some(error.to_string()),
                });
                None
            }
        }
    }

    fn try_generate(&self, template_id: &str, user_name: &str) -> AppResult<GeneratedReport> {
        let template = self
            .db
            .get_template(template_id)?
            .ok_or_else(|| AppError::NotFound(format!("template {template_id}")))?;
        let config = template.config.clone();
        let data = execute_report_query(&self.sources, &config, Local::now())?;

        let parameters = ReportParameters {
            date_range: describe_date_range(&config.date_range),
            dimensions: config.dimensions.iter().map(|d| d.label.clone()).collect(),
            metrics: config.metrics.iter().map(|m| m.label.clone()).collect(),
        };

        Ok(GeneratedReport {
            id: Uuid::new_v4().to_string(),
            template_id: template.id,
            template_name: template.name,
            config,
            data,
            generated_at: Utc::now(),
            generated_by: user_name.to_string(),
            parameters,
        })
    }

    fn record_history(&self, entry: ReportHistoryEntry) {
        if let Err(error) = self.db.push_history(&entry) {
            tracing::warn!(template_id = %entry.template_id, error = %error, "failed to record report history");
        }
    }

    pub fn generated_reports(&self) -> AppResult<Vec<GeneratedReport>> {
        self.db.list_generated_reports()
    }

    pub fn get_generated_report(&self, id: &str) -> AppResult<Option<GeneratedReport>> {
        self.db.get_generated_report(id)
    }

    pub fn report_history(&self) -> AppResult<Vec<ReportHistoryEntry>> {
        self.db.list_history()
    }

    // ── scheduling ──────────────────────────────────────────────────────

    pub fn create_scheduled_report(
        &self,
        template_id: &str,
        created_by: &str,
        schedule: ScheduleSpec,
    ) -> AppResult<ScheduledReport> {
        parse_schedule_time(&schedule.time)?;
        if self.db.get_template(template_id)?.is_none() {
            return Err(AppError::NotFound(format!("template {template_id}")));
        }
        let now = Local::now();
        let scheduled = ScheduledReport {
            id: Uuid::new_v4().to_string(),
            template_id: template_id.to_string(),
            created_by: created_by.to_string(),
            is_active: true,
            next_run: next_run_after(&schedule, now)?,
            schedule,
            last_run: None,
            run_count: 0,
            created_at: now.with_timezone(&Utc),
        };
        self.db.save_schedule(&scheduled)?;
        Ok(scheduled)
    }

    pub fn scheduled_reports(&self) -> AppResult<Vec<ScheduledReport>> {
        self.db.list_schedules()
    }

    pub fn set_schedule_active(&self, id: &str, active: bool) -> AppResult<ScheduledReport> {
        let mut schedule = self
            .db
            .get_schedule(id)?
            .ok_or_else(|| AppError::NotFound(format!("scheduled report {id}")))?;
        schedule.is_active = active;
        self.db.save_schedule(&schedule)?;
        Ok(schedule)
    }

    pub fn delete_scheduled_report(&self, id: &str) -> AppResult<()> {
        self.db.delete_schedule(id)
    }

    pub fn queue(&self) -> AppResult<Vec<ReportQueueItem>> {
        self.db.list_queue()
    }

    pub fn scheduler_errors(&self) -> AppResult<Vec<SchedulerError>> {
        self.db.list_scheduler_errors()
    }

    pub fn resolve_scheduler_error(&self, id: &str) -> AppResult<()> {
        self.db.resolve_scheduler_error(id)
    }
}
