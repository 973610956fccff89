use crate::errors::{AppError, AppResult};
use crate::models::{
    Aggregation, DataSource, DatePreset, DateRange, Dimension, GeneratedReport, Metric,
    MetricFormat, FormatType, ReportConfig, ReportHistoryEntry, ReportQueueItem, ReportTemplate,
    ScheduledReport, SchedulerError, SchedulerRunState, SourceModule, QueueStatus,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const KEY_TEMPLATES: &str = "report_templates";
pub const KEY_GENERATED_REPORTS: &str = "generated_reports";
pub const KEY_SCHEDULED_REPORTS: &str = "scheduled_reports";
pub const KEY_HISTORY: &str = "report_history";
pub const KEY_QUEUE: &str = "report_queue";
pub const KEY_SCHEDULER_ERRORS: &str = "scheduler_errors";
pub const KEY_SCHEDULER_STATE: &str = "scheduler_state";
pub const KEY_SCHEDULER_DAILY: &str = "scheduler_daily";

pub const MAX_GENERATED_REPORTS: usize = 100;
pub const MAX_HISTORY_ENTRIES: usize = 500;
pub const MAX_QUEUE_ITEMS: usize = 100;
pub const MAX_ERROR_LOG_ENTRIES: usize = 50;

/// Key-value blob store: one JSON array (or object) per key, read and
/// written whole. The single mutexed connection is the writer discipline
/// that keeps manual and scheduled runs from losing updates to the same
/// collection.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.seed_system_templates()?;
        Ok(db)
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn read_key_conn(conn: &Connection, key: &str) -> AppResult<Option<serde_json::Value>> {
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM collections WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write_key_conn(conn: &Connection, key: &str, payload: &serde_json::Value) -> AppResult<()> {
        conn.execute(
            "INSERT INTO collections (key, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(payload)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Raw read used by the upstream-source repositories, which apply their
    /// own corrupt-data tolerance.
    pub fn read_raw(&self, key: &str) -> AppResult<Option<serde_json::Value>> {
        let conn = self.lock()?;
        Self::read_key_conn(&conn, key)
    }

    /// Raw write; upstream modules own their collections, this crate only
    /// uses it for its own keys and for test seeding.
    pub fn write_raw(&self, key: &str, payload: &serde_json::Value) -> AppResult<()> {
        let conn = self.lock()?;
        Self::write_key_conn(&conn, key, payload)
    }

    pub fn read_collection<T: DeserializeOwned>(&self, key: &str) -> AppResult<Vec<T>> {
        let conn = self.lock()?;
        Self::read_collection_conn(&conn, key)
    }

    fn read_collection_conn<T: DeserializeOwned>(conn: &Connection, key: &str) -> AppResult<Vec<T>> {
        match Self::read_key_conn(conn, key)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Read-modify-write of a whole collection under one lock acquisition.
    fn update_collection<T, R, F>(&self, key: &str, apply: F) -> AppResult<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Vec<T>) -> R,
    {
        let conn = self.lock()?;
        let mut items: Vec<T> = Self::read_collection_conn(&conn, key)?;
        let result = apply(&mut items);
        Self::write_key_conn(&conn, key, &serde_json::to_value(&items)?)?;
        Ok(result)
    }

    fn push_capped<T>(&self, key: &str, item: T, cap: usize) -> AppResult<()>
    where
        T: Serialize + DeserializeOwned,
    {
        self.update_collection(key, |items: &mut Vec<T>| {
            items.push(item);
            if items.len() > cap {
                let excess = items.len() - cap;
                items.drain(..excess);
            }
        })
    }

    // ── templates ───────────────────────────────────────────────────────

    pub fn list_templates(&self, user_id: &str) -> AppResult<Vec<ReportTemplate>> {
        let templates: Vec<ReportTemplate> = self.read_collection(KEY_TEMPLATES)?;
        Ok(templates
            .into_iter()
            .filter(|t| {
                t.is_system_template
                    || t.created_by == user_id
                    || t.is_shared
                    || t.shared_with.iter().any(|id| id == user_id)
            })
            .collect())
    }

    pub fn get_template(&self, id: &str) -> AppResult<Option<ReportTemplate>> {
        let templates: Vec<ReportTemplate> = self.read_collection(KEY_TEMPLATES)?;
        Ok(templates.into_iter().find(|t| t.id == id))
    }

    /// Upsert by id, stamping `updatedAt`. System-template configs are not
    /// guarded here; only deletion is protected.
    pub fn save_template(&self, template: &ReportTemplate) -> AppResult<ReportTemplate> {
        let mut stamped = template.clone();
        stamped.updated_at = Utc::now();
        let saved = stamped.clone();
        self.update_collection(KEY_TEMPLATES, |templates: &mut Vec<ReportTemplate>| {
            match templates.iter_mut().find(|t| t.id == stamped.id) {
                Some(existing) => *existing = stamped,
                None => templates.push(stamped),
            }
        })?;
        Ok(saved)
    }

    pub fn delete_template(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        self.update_collection(KEY_TEMPLATES, |templates: &mut Vec<ReportTemplate>| {
            let Some(position) = templates.iter().position(|t| t.id == id) else {
                return Err(AppError::NotFound(format!("template {id}")));
            };
            if templates[position].is_system_template {
                return Err(AppError::SystemTemplateProtected(format!(
                    "system template {id} cannot be deleted"
                )));
            }
            templates.remove(position);
            Ok(())
        })?
    }

    pub fn toggle_favorite(&self, id: &str) -> AppResult<ReportTemplate> {
        let id = id.to_string();
        self.update_collection(KEY_TEMPLATES, |templates: &mut Vec<ReportTemplate>| {
            match templates.iter_mut().find(|t| t.id == id) {
                Some(template) => {
                    template.is_favorite = !template.is_favorite;
                    Ok(template.clone())
                }
                None => Err(AppError::NotFound(format!("template {id}"))),
            }
        })?
    }

    /// Post-generation bookkeeping: bump the counter and stamp the run time.
    pub fn mark_template_generated(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        let now = Utc::now();
        self.update_collection(KEY_TEMPLATES, |templates: &mut Vec<ReportTemplate>| {
            if let Some(template) = templates.iter_mut().find(|t| t.id == id) {
                template.generation_count += 1;
                template.last_generated = Some(now);
            }
        })
    }

    // ── generated reports ───────────────────────────────────────────────

    pub fn push_generated_report(&self, report: &GeneratedReport) -> AppResult<()> {
        self.push_capped(KEY_GENERATED_REPORTS, report.clone(), MAX_GENERATED_REPORTS)
    }

    pub fn list_generated_reports(&self) -> AppResult<Vec<GeneratedReport>> {
        self.read_collection(KEY_GENERATED_REPORTS)
    }

    pub fn get_generated_report(&self, id: &str) -> AppResult<Option<GeneratedReport>> {
        let reports: Vec<GeneratedReport> = self.read_collection(KEY_GENERATED_REPORTS)?;
        Ok(reports.into_iter().find(|r| r.id == id))
    }

    // ── history ─────────────────────────────────────────────────────────

    pub fn push_history(&self, entry: &ReportHistoryEntry) -> AppResult<()> {
        self.push_capped(KEY_HISTORY, entry.clone(), MAX_HISTORY_ENTRIES)
    }

    pub fn list_history(&self) -> AppResult<Vec<ReportHistoryEntry>> {
        self.read_collection(KEY_HISTORY)
    }

    // ── scheduled reports ───────────────────────────────────────────────

    pub fn list_schedules(&self) -> AppResult<Vec<ScheduledReport>> {
        self.read_collection(KEY_SCHEDULED_REPORTS)
    }

    pub fn get_schedule(&self, id: &str) -> AppResult<Option<ScheduledReport>> {
        let schedules: Vec<ScheduledReport> = self.read_collection(KEY_SCHEDULED_REPORTS)?;
        Ok(schedules.into_iter().find(|s| s.id == id))
    }

    pub fn save_schedule(&self, schedule: &ScheduledReport) -> AppResult<()> {
        let schedule = schedule.clone();
        self.update_collection(KEY_SCHEDULED_REPORTS, |schedules: &mut Vec<ScheduledReport>| {
            match schedules.iter_mut().find(|s| s.id == schedule.id) {
                Some(existing) => *existing = schedule,
                None => schedules.push(schedule),
            }
        })
    }

    pub fn delete_schedule(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        self.update_collection(KEY_SCHEDULED_REPORTS, |schedules: &mut Vec<ScheduledReport>| {
            let before = schedules.len();
            schedules.retain(|s| s.id != id);
            if schedules.len() == before {
                Err(AppError::NotFound(format!("scheduled report {id}")))
            } else {
                Ok(())
            }
        })?
    }

    // ── scheduler queue / errors / state ────────────────────────────────

    pub fn push_queue_item(&self, item: &ReportQueueItem) -> AppResult<()> {
        self.push_capped(KEY_QUEUE, item.clone(), MAX_QUEUE_ITEMS)
    }

    pub fn update_queue_item(
        &self,
        id: &str,
        status: QueueStatus,
        report_id: Option<String>,
        error: Option<String>,
    ) -> AppResult<()> {
        let id = id.to_string();
        self.update_collection(KEY_QUEUE, |items: &mut Vec<ReportQueueItem>| {
            if let Some(item) = items.iter_mut().find(|i| i.id == id) {
                item.status = status;
                item.report_id = report_id;
                item.error = error;
            }
        })
    }

    pub fn list_queue(&self) -> AppResult<Vec<ReportQueueItem>> {
        self.read_collection(KEY_QUEUE)
    }

    pub fn push_scheduler_error(&self, entry: &SchedulerError) -> AppResult<()> {
        self.push_capped(KEY_SCHEDULER_ERRORS, entry.clone(), MAX_ERROR_LOG_ENTRIES)
    }

    pub fn list_scheduler_errors(&self) -> AppResult<Vec<SchedulerError>> {
        self.read_collection(KEY_SCHEDULER_ERRORS)
    }

    pub fn resolve_scheduler_error(&self, id: &str) -> AppResult<()> {
        let id = id.to_string();
        self.update_collection(KEY_SCHEDULER_ERRORS, |entries: &mut Vec<SchedulerError>| {
            match entries.iter_mut().find(|e| e.id == id) {
                Some(entry) => {
                    entry.resolved = true;
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("scheduler error {id}"))),
            }
        })?
    }

    pub fn scheduler_state(&self) -> AppResult<SchedulerRunState> {
        match self.read_raw(KEY_SCHEDULER_STATE)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(SchedulerRunState::default()),
        }
    }

    pub fn save_scheduler_state(&self, state: &SchedulerRunState) -> AppResult<()> {
        self.write_raw(KEY_SCHEDULER_STATE, &serde_json::to_value(state)?)
    }

    pub fn increment_daily_count(&self, date_key: &str) -> AppResult<u64> {
        let conn = self.lock()?;
        let mut counts = match Self::read_key_conn(&conn, KEY_SCHEDULER_DAILY)? {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        let next = counts.get(date_key).and_then(|v| v.as_u64()).unwrap_or(0) + 1;
        counts.insert(date_key.to_string(), serde_json::json!(next));
        Self::write_key_conn(&conn, KEY_SCHEDULER_DAILY, &serde_json::Value::Object(counts))?;
        Ok(next)
    }

    pub fn daily_count(&self, date_key: &str) -> AppResult<u64> {
        match self.read_raw(KEY_SCHEDULER_DAILY)? {
            Some(value) => Ok(value.get(date_key).and_then(|v| v.as_u64()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    // ── seeding ─────────────────────────────────────────────────────────

    fn seed_system_templates(&self) -> AppResult<()> {
        let conn = self.lock()?;
        if Self::read_key_conn(&conn, KEY_TEMPLATES)?.is_some() {
            return Ok(());
        }
        let seeds = default_system_templates();
        Self::write_key_conn(&conn, KEY_TEMPLATES, &serde_json::to_value(&seeds)?)
    }
}

fn default_system_templates() -> Vec<ReportTemplate> {
    let now = Utc::now();
    let template = |id: &str, name: &str, description: &str, config: ReportConfig| ReportTemplate {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        config,
        created_by: "system".to_string(),
        shared_with: Vec::new(),
        is_shared: true,
        is_system_template: true,
        generation_count: 0,
        last_generated: None,
        is_favorite: false,
        created_at: now,
        updated_at: now,
    };

    vec![
        template(
            "system-property-status",
            "Properties by Status",
            "Count of listed properties grouped by status.",
            ReportConfig {
                data_sources: vec![DataSource {
                    module: SourceModule::Properties,
                    entity: "property".to_string(),
                }],
                date_range: DateRange::Preset {
                    preset: DatePreset::AllTime,
                },
                filters: vec![],
                dimensions: vec![Dimension {
                    field: "status".to_string(),
                    label: "Status".to_string(),
                    group_by: true,
                }],
                metrics: vec![Metric {
                    id: "propertyCount".to_string(),
                    field: "id".to_string(),
                    label: "Properties".to_string(),
                    aggregation: Aggregation::Count,
                    format: Some(MetricFormat {
                        kind: FormatType::Number,
                        decimals: Some(0),
                    }),
                }],
                sort_by: vec![],
                limit: None,
            },
        ),
        template(
            "system-lead-sources",
            "Lead Source Breakdown",
            "Leads from the last 30 days grouped by source.",
            ReportConfig {
                data_sources: vec![DataSource {
                    module: SourceModule::Leads,
                    entity: "lead".to_string(),
                }],
                date_range: DateRange::Preset {
                    preset: DatePreset::Last30Days,
                },
                filters: vec![],
                dimensions: vec![Dimension {
                    field: "source".to_string(),
                    label: "Source".to_string(),
                    group_by: true,
                }],
                metrics: vec![Metric {
                    id: "leadCount".to_string(),
                    field: "id".to_string(),
                    label: "Leads".to_string(),
                    aggregation: Aggregation::Count,
                    format: Some(MetricFormat {
                        kind: FormatType::Number,
                        decimals: Some(0),
                    }),
                }],
                sort_by: vec![],
                limit: None,
            },
        ),
        template(
            "system-deal-revenue",
            "Deal Revenue This Year",
            "Total commission value of deals closed year to date.",
            ReportConfig {
                data_sources: vec![DataSource {
                    module: SourceModule::Deals,
                    entity: "deal".to_string(),
                }],
                date_range: DateRange::Preset {
                    preset: DatePreset::Ytd,
                },
                filters: vec![],
                dimensions: vec![],
                metrics: vec![Metric {
                    id: "totalCommission".to_string(),
                    field: "commissionAmount".to_string(),
                    label: "Commission".to_string(),
                    aggregation: Aggregation::Sum,
                    format: Some(MetricFormat {
                        kind: FormatType::Currency,
                        decimals: Some(2),
                    }),
                }],
                sort_by: vec![],
                limit: None,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HistoryStatus;

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("test.db")).expect("db")
    }

    fn history_entry(n: usize) -> ReportHistoryEntry {
        ReportHistoryEntry {
            report_id: Some(format!("report-{n}")),
            template_id: "t-1".to_string(),
            executed_at: Utc::now(),
            executed_by: "user-1".to_string(),
            status: HistoryStatus::Success,
            row_count: n,
            execution_time: 5,
            error: None,
        }
    }

    #[test]
    fn system_templates_are_seeded_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let templates = db.list_templates("nobody").expect("list");
        assert_eq!(templates.len(), 3);
        assert!(templates.iter().all(|t| t.is_system_template));
    }

    #[test]
    fn deleting_a_system_template_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let err = db
            .delete_template("system-property-status")
            .expect_err("delete should fail");
        assert!(matches!(err, AppError::SystemTemplateProtected(_)));
        assert!(db
            .get_template("system-property-status")
            .expect("get")
            .is_some());
    }

    #[test]
    fn history_ring_buffer_keeps_latest_500() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        for n in 0..600 {
            db.push_history(&history_entry(n)).expect("push history");
        }
        let history = db.list_history().expect("list history");
        assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(history[0].row_count, 100);
        assert_eq!(history.last().expect("last").row_count, 599);
    }

    #[test]
    fn error_log_caps_at_50() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        for n in 0..70 {
            db.push_scheduler_error(&SchedulerError {
                id: format!("err-{n}"),
                schedule_id: "s-1".to_string(),
                schedule_name: "nightly".to_string(),
                error: "boom".to_string(),
                occurred_at: Utc::now(),
                resolved: false,
            })
            .expect("push error");
        }
        let errors = db.list_scheduler_errors().expect("list errors");
        assert_eq!(errors.len(), MAX_ERROR_LOG_ENTRIES);
        assert_eq!(errors[0].id, "err-20");
    }

    #[test]
    fn favorite_toggle_flips_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let toggled = db
            .toggle_favorite("system-lead-sources")
            .expect("toggle favorite");
        assert!(toggled.is_favorite);
        let again = db
            .toggle_favorite("system-lead-sources")
            .expect("toggle back");
        assert!(!again.is_favorite);
    }

    #[test]
    fn daily_counter_increments_per_date() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        assert_eq!(db.increment_daily_count("2026-08-30").expect("inc"), 1);
        assert_eq!(db.increment_daily_count("2026-08-30").expect("inc"), 2);
        assert_eq!(db.daily_count("2026-08-30").expect("count"), 2);
        assert_eq!(db.daily_count("2026-08-29").expect("count"), 0);
    }
}
