use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceModule {
    Properties,
    Leads,
    Contacts,
    Deals,
    Financials,
    Portfolio,
    Requirements,
}

impl SourceModule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Leads => "leads",
            Self::Contacts => "contacts",
            Self::Deals => "deals",
            Self::Financials => "financials",
            Self::Portfolio => "portfolio",
            Self::Requirements => "requirements",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub module: SourceModule,
    pub entity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatePreset {
    Today,
    Yesterday,
    ThisWeek,
    LastWeek,
    ThisMonth,
    LastMonth,
    ThisQuarter,
    ThisYear,
    Mtd,
    Ytd,
    #[serde(rename = "last-7-days")]
    Last7Days,
    #[serde(rename = "last-30-days")]
    Last30Days,
    #[serde(rename = "last-90-days")]
    Last90Days,
    #[serde(rename = "last-12-months")]
    Last12Months,
    AllTime,
}

impl DatePreset {
    pub fn label(self) -> &'static str {
        match self {
            Self::Today => "Today",
            Self::Yesterday => "Yesterday",
            Self::ThisWeek => "This week",
            Self::LastWeek => "Last week",
            Self::ThisMonth => "This month",
            Self::LastMonth => "Last month",
            Self::ThisQuarter => "This quarter",
            Self::ThisYear => "This year",
            Self::Mtd => "Month to date",
            Self::Ytd => "Year to date",
            Self::Last7Days => "Last 7 days",
            Self::Last30Days => "Last 30 days",
            Self::Last90Days => "Last 90 days",
            Self::Last12Months => "Last 12 months",
            Self::AllTime => "All time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollingUnit {
    Days,
    Weeks,
    Months,
    Years,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DateRange {
    Preset {
        preset: DatePreset,
    },
    #[serde(rename_all = "camelCase")]
    Custom {
        start_date: String,
        end_date: String,
    },
    Rolling {
        count: u32,
        unit: RollingUnit,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterDataType {
    String,
    Number,
    Date,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: serde_json::Value,
    pub data_type: FilterDataType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub field: String,
    pub label: String,
    #[serde(default)]
    pub group_by: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    Count,
    CountDistinct,
    Sum,
    Average,
    Min,
    Max,
    Median,
    First,
    Last,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FormatType {
    Currency,
    Percentage,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricFormat {
    #[serde(rename = "type")]
    pub kind: FormatType,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: String,
    pub field: String,
    pub label: String,
    pub aggregation: Aggregation,
    pub format: Option<MetricFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    pub data_sources: Vec<DataSource>,
    pub date_range: DateRange,
    #[serde(default)]
    pub filters: Vec<ReportFilter>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub sort_by: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl ReportConfig {
    /// Builder-side validation. The executor itself only requires a data
    /// source and tolerates everything else being empty.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.data_sources.is_empty() {
            problems.push("at least one data source is required".to_string());
        }
        if self.metrics.is_empty() {
            problems.push("at least one metric is required".to_string());
        }
        for metric in &self.metrics {
            if metric.id.trim().is_empty() {
                problems.push(format!("metric '{}' has an empty id", metric.label));
            }
        }
        for filter in &self.filters {
            if filter.field.trim().is_empty() {
                problems.push("filter with empty field".to_string());
            }
            match filter.operator {
                FilterOperator::Between => {
                    let ok = filter
                        .value
                        .as_array()
                        .map(|values| values.len() == 2)
                        .unwrap_or(false);
                    if !ok {
                        problems.push(format!(
                            "between filter on '{}' requires a two-element value",
                            filter.field
                        ));
                    }
                }
                FilterOperator::In | FilterOperator::NotIn => {
                    if !filter.value.is_array() {
                        problems.push(format!(
                            "in/not-in filter on '{}' requires an array value",
                            filter.field
                        ));
                    }
                }
                _ => {}
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub config: ReportConfig,
    pub created_by: String,
    #[serde(default)]
    pub shared_with: Vec<String>,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub is_system_template: bool,
    #[serde(default)]
    pub generation_count: u64,
    pub last_generated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Loosely typed record as read from an upstream module collection.
pub type SourceRecord = serde_json::Value;

/// One output row: field name to value, always carrying a synthetic `id`.
pub type ReportRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryValue {
    pub value: f64,
    pub formatted: String,
    pub percent_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub rows: Vec<ReportRow>,
    pub summary: BTreeMap<String, SummaryValue>,
    pub row_count: usize,
    pub filtered_row_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportParameters {
    pub date_range: String,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedReport {
    pub id: String,
    pub template_id: String,
    pub template_name: String,
    pub config: ReportConfig,
    pub data: ReportData,
    pub generated_at: DateTime<Utc>,
    pub generated_by: String,
    pub parameters: ReportParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl ScheduleFrequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    /// Display-ordering weight for queue items. Does not affect execution
    /// order, which stays array order within a tick.
    pub fn queue_priority(self) -> i32 {
        match self {
            Self::Daily => 100,
            Self::Weekly => 80,
            Self::Monthly => 60,
            Self::Quarterly => 40,
            Self::Yearly => 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub frequency: ScheduleFrequency,
    /// "HH:MM", local clock.
    pub time: String,
    pub day_of_month: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReport {
    pub id: String,
    pub template_id: String,
    pub created_by: String,
    pub is_active: bool,
    pub schedule: ScheduleSpec,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQueueItem {
    pub id: String,
    pub schedule_id: String,
    pub template_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub priority: i32,
    pub status: QueueStatus,
    pub report_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerError {
    pub id: String,
    pub schedule_id: String,
    pub schedule_name: String,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportHistoryEntry {
    pub report_id: Option<String>,
    pub template_id: String,
    pub executed_at: DateTime<Utc>,
    pub executed_by: String,
    pub status: HistoryStatus,
    pub row_count: usize,
    /// Wall-clock execution time in milliseconds.
    pub execution_time: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRunState {
    #[serde(default)]
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
    pub active_schedules: usize,
    pub completed_today: u64,
    pub recent_errors: Vec<SchedulerError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_round_trips_through_tagged_json() {
        let raw = r#"{"type":"preset","preset":"last-30-days"}"#;
        let range: DateRange = serde_json::from_str(raw).expect("parse preset range");
        assert!(matches!(
            range,
            DateRange::Preset {
                preset: DatePreset::Last30Days
            }
        ));

        let rolling = DateRange::Rolling {
            count: 6,
            unit: RollingUnit::Months,
        };
        let encoded = serde_json::to_string(&rolling).expect("encode rolling range");
        assert!(encoded.contains("\"type\":\"rolling\""));
    }

    #[test]
    fn config_validation_reports_all_problems() {
        let config = ReportConfig {
            data_sources: vec![],
            date_range: DateRange::Preset {
                preset: DatePreset::AllTime,
            },
            filters: vec![ReportFilter {
                field: "price".to_string(),
                operator: FilterOperator::Between,
                value: serde_json::json!([100]),
                data_type: FilterDataType::Number,
            }],
            dimensions: vec![],
            metrics: vec![],
            sort_by: vec![],
            limit: None,
        };

        let problems = config.validate().expect_err("config should be invalid");
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn frequency_priority_ordering_matches_cadence() {
        assert!(ScheduleFrequency::Daily.queue_priority() > ScheduleFrequency::Weekly.queue_priority());
        assert!(ScheduleFrequency::Weekly.queue_priority() > ScheduleFrequency::Monthly.queue_priority());
        assert!(ScheduleFrequency::Monthly.queue_priority() > ScheduleFrequency::Quarterly.queue_priority());
        assert!(ScheduleFrequency::Quarterly.queue_priority() > ScheduleFrequency::Yearly.queue_priority());
    }
}
