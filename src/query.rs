use crate::aggregate::{apply_aggregation, format_metric_value};
use crate::daterange::resolve_date_range;
use crate::errors::{AppError, AppResult};
use crate::models::{
    Dimension, FilterDataType, FilterOperator, Metric, ReportConfig, ReportData, ReportFilter,
    ReportRow, SortDirection, SortKey, SourceRecord, SummaryValue,
};
use crate::sources::DataSources;
use crate::value::{compare_values, is_null_like, value_as_datetime, value_as_f64, value_to_string, FieldPath};
use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

static NULL: Value = Value::Null;

/// Fields probed, in order, when date-filtering a record. A record with
/// none of them, or with an unparseable value, is kept: missing dates must
/// never silently drop data.
const DATE_FIELD_CANDIDATES: [&str; 5] = ["createdAt", "date", "startDate", "updatedAt", "timestamp"];

/// Run the full pipeline: fetch, date-range resolution, date filter,
/// predicate filters, grouping, sort, limit, summary. The summary is
/// computed over the post-limit row set, matching the reporting screens
/// this engine feeds.
pub fn execute_report_query(
    sources: &DataSources,
    config: &ReportConfig,
    now: DateTime<Local>,
) -> AppResult<ReportData> {
    if config.data_sources.is_empty() {
        return Err(AppError::Config(
            "report requires at least one data source".to_string(),
        ));
    }

    let mut records: Vec<SourceRecord> = Vec::new();
    for source in &config.data_sources {
        records.extend(sources.fetch(source.module));
    }

    let bounds = resolve_date_range(&config.date_range, now)?;
    let records = apply_date_filter(records, bounds);
    let records = apply_filters(records, &config.filters);

    let mut rows = build_rows(&records, &config.dimensions, &config.metrics);
    sort_rows(&mut rows, &config.sort_by);

    let filtered_row_count = rows.len();
    if let Some(limit) = config.limit {
        rows.truncate(limit);
    }

    let summary = build_summary(&rows, &config.metrics);
    Ok(ReportData {
        row_count: rows.len(),
        filtered_row_count,
        rows,
        summary,
    })
}

fn apply_date_filter(
    records: Vec<SourceRecord>,
    bounds: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Vec<SourceRecord> {
    let Some((start, end)) = bounds else {
        return records;
    };
    records
        .into_iter()
        .filter(|record| match record_date(record) {
            Some(Some(date)) => date >= start && date <= end,
            // No recognizable or parseable date: keep the record.
            _ => true,
        })
        .collect()
}

/// Outer `None`: no date field at all. Inner `None`: present but unparseable.
fn record_date(record: &SourceRecord) -> Option<Option<DateTime<Utc>>> {
    for field in DATE_FIELD_CANDIDATES {
        if let Some(value) = record.get(field) {
            if value.is_null() {
                continue;
            }
            return Some(value_as_datetime(value));
        }
    }
    None
}

fn apply_filters(records: Vec<SourceRecord>, filters: &[ReportFilter]) -> Vec<SourceRecord> {
    if filters.is_empty() {
        return records;
    }
    let compiled: Vec<(FieldPath, &ReportFilter)> = filters
        .iter()
        .filter_map(|filter| match FieldPath::parse(&filter.field) {
            Ok(path) => Some((path, filter)),
            Err(error) => {
                tracing::warn!(field = %filter.field, error = %error, "skipping filter with bad field path");
                None
            }
        })
        .collect();

    records
        .into_iter()
        .filter(|record| {
            compiled
                .iter()
                .all(|(path, filter)| matches_filter(record, path, filter))
        })
        .collect()
}

fn matches_filter(record: &SourceRecord, path: &FieldPath, filter: &ReportFilter) -> bool {
    let current = path.resolve(record);
    let null = is_null_like(current);
    match filter.operator {
        FilterOperator::IsNull => null,
        FilterOperator::IsNotNull => !null,
        FilterOperator::Equals => {
            !null && equals_loose(current.unwrap_or(&NULL), &filter.value, filter.data_type)
        }
        FilterOperator::NotEquals => {
            null || !equals_loose(current.unwrap_or(&NULL), &filter.value, filter.data_type)
        }
        FilterOperator::Contains => string_op(current, &filter.value, |h, n| h.contains(n)),
        FilterOperator::NotContains => !string_op(current, &filter.value, |h, n| h.contains(n)),
        FilterOperator::StartsWith => string_op(current, &filter.value, |h, n| h.starts_with(n)),
        FilterOperator::EndsWith => string_op(current, &filter.value, |h, n| h.ends_with(n)),
        FilterOperator::GreaterThan => ordered_op(current, &filter.value, filter.data_type, |o| {
            o == Ordering::Greater
        }),
        FilterOperator::LessThan => ordered_op(current, &filter.value, filter.data_type, |o| {
            o == Ordering::Less
        }),
        FilterOperator::GreaterOrEqual => {
            ordered_op(current, &filter.value, filter.data_type, |o| o != Ordering::Less)
        }
        FilterOperator::LessOrEqual => ordered_op(current, &filter.value, filter.data_type, |o| {
            o != Ordering::Greater
        }),
        FilterOperator::Between => {
            let Some(candidates) = filter.value.as_array() else {
                return false;
            };
            if candidates.len() != 2 {
                return false;
            }
            let (Some(value), Some(low), Some(high)) = (
                scalar(current.unwrap_or(&NULL), filter.data_type),
                scalar(&candidates[0], filter.data_type),
                scalar(&candidates[1], filter.data_type),
            ) else {
                return false;
            };
            value >= low && value <= high
        }
        FilterOperator::In => in_set(current, &filter.value, filter.data_type),
        FilterOperator::NotIn => !in_set(current, &filter.value, filter.data_type),
    }
}

fn in_set(current: Option<&Value>, candidates: &Value, data_type: FilterDataType) -> bool {
    if is_null_like(current) {
        return false;
    }
    candidates
        .as_array()
        .map(|values| {
            values
                .iter()
                .any(|candidate| equals_loose(current.unwrap_or(&NULL), candidate, data_type))
        })
        .unwrap_or(false)
}

fn equals_loose(current: &Value, target: &Value, data_type: FilterDataType) -> bool {
    match data_type {
        FilterDataType::Number => match (value_as_f64(current), value_as_f64(target)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        FilterDataType::Boolean => match (truthy(current), truthy(target)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        FilterDataType::Date => match (value_as_datetime(current), value_as_datetime(target)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        FilterDataType::String => value_to_string(current) == value_to_string(target),
    }
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => Some(number.as_f64().map(|n| n != 0.0).unwrap_or(false)),
        Value::String(text) => match text.to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn string_op(current: Option<&Value>, needle: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
    if is_null_like(current) {
        return false;
    }
    let haystack = value_to_string(current.unwrap_or(&NULL)).to_lowercase();
    let needle = value_to_string(needle).to_lowercase();
    op(&haystack, &needle)
}

fn ordered_op(
    current: Option<&Value>,
    target: &Value,
    data_type: FilterDataType,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    let (Some(a), Some(b)) = (
        current.and_then(|value| scalar(value, data_type)),
        scalar(target, data_type),
    ) else {
        return false;
    };
    a.partial_cmp(&b).map(accept).unwrap_or(false)
}

fn scalar(value: &Value, data_type: FilterDataType) -> Option<f64> {
    match data_type {
        FilterDataType::Date => value_as_datetime(value).map(|dt| dt.timestamp_millis() as f64),
        _ => value_as_f64(value),
    }
}

/// Group records by the dimension tuple and aggregate metrics per group.
/// With no dimensions, each record passes through 1:1 with a synthetic id.
fn build_rows(records: &[SourceRecord], dimensions: &[Dimension], metrics: &[Metric]) -> Vec<ReportRow> {
    if dimensions.is_empty() {
        return records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let mut row = match record {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("value".to_string(), other.clone());
                        map
                    }
                };
                row.entry("id".to_string())
                    .or_insert_with(|| Value::from(format!("row-{index}")));
                row
            })
            .collect();
    }

    let dimension_paths: Vec<(FieldPath, &Dimension)> = dimensions
        .iter()
        .filter_map(|dimension| match FieldPath::parse(&dimension.field) {
            Ok(path) => Some((path, dimension)),
            Err(error) => {
                tracing::warn!(field = %dimension.field, error = %error, "skipping dimension with bad field path");
                None
            }
        })
        .collect();

    // First-seen order of group keys is preserved.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&SourceRecord>> = HashMap::new();
    for record in records {
        let key = dimension_paths
            .iter()
            .map(|(path, _)| value_to_string(path.resolve(record).unwrap_or(&NULL)))
            .collect::<Vec<_>>()
            .join("|");
        groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
    }
    for record in records {
        let key = dimension_paths
            .iter()
            .map(|(path, _)| value_to_string(path.resolve(record).unwrap_or(&NULL)))
            .collect::<Vec<_>>()
            .join("|");
        if let Some(members) = groups.get_mut(&key) {
            members.push(record);
        }
    }

    order
        .iter()
        .enumerate()
        .map(|(index, key)| {
            let members = &groups[key];
            let mut row = serde_json::Map::new();
            row.insert("id".to_string(), Value::from(format!("group-{index}")));
            if let Some(first) = members.first() {
                for (path, dimension) in &dimension_paths {
                    row.insert(
                        dimension.field.clone(),
                        path.resolve(first).cloned().unwrap_or(Value::Null),
                    );
                }
            }
            for metric in metrics {
                let values: Vec<&Value> = members
                    .iter()
                    .map(|record| metric_path_resolve(metric, record))
                    .collect();
                row.insert(metric_key(metric), apply_aggregation(metric.aggregation, &values));
            }
            row
        })
        .collect()
}

fn metric_path_resolve<'a>(metric: &Metric, record: &'a SourceRecord) -> &'a Value {
    FieldPath::parse(&metric.field)
        .ok()
        .and_then(|path| path.resolve(record))
        .unwrap_or(&NULL)
}

fn metric_key(metric: &Metric) -> String {
    if metric.id.trim().is_empty() {
        metric.field.clone()
    } else {
        metric.id.clone()
    }
}

fn sort_rows(rows: &mut [ReportRow], sort_by: &[SortKey]) {
    if sort_by.is_empty() {
        return;
    }
    let mut keys: Vec<&SortKey> = sort_by.iter().collect();
    keys.sort_by_key(|key| key.priority);

    rows.sort_by(|a, b| {
        for key in &keys {
            let ordering = compare_values(row_value(a, &key.field), row_value(b, &key.field));
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn row_value<'a>(row: &'a ReportRow, field: &str) -> Option<&'a Value> {
    if let Some(value) = row.get(field) {
        return Some(value);
    }
    // Pass-through rows keep nested record shapes, so dotted paths still work.
    let mut current: Option<&Value> = None;
    for (position, segment) in field.split('.').enumerate() {
        current = match (position, current) {
            (0, _) => row.get(segment),
            (_, Some(value)) => value.get(segment),
            (_, None) => return None,
        };
        current?;
    }
    current
}

fn build_summary(rows: &[ReportRow], metrics: &[Metric]) -> BTreeMap<String, SummaryValue> {
    let mut summary = BTreeMap::new();
    for metric in metrics {
        let key = metric_key(metric);
        let values: Vec<&Value> = rows
            .iter()
            .map(|row| {
                row.get(&key)
                    .or_else(|| row_value(row, &metric.field))
                    .unwrap_or(&NULL)
            })
            .collect();
        let aggregated = apply_aggregation(metric.aggregation, &values);
        summary.insert(
            key,
            SummaryValue {
                value: value_as_f64(&aggregated).unwrap_or(0.0),
                formatted: format_metric_value(metric.format.as_ref(), &aggregated),
                percent_change: None,
            },
        );
    }
    summary
}
