use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// A validated dotted field path into a loosely typed record, e.g.
/// `"address.city"`. Parsed once at config time so row evaluation is a
/// plain walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("empty field path".to_string()));
        }
        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(AppError::Config(format!("malformed field path '{raw}'")));
        }
        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn resolve<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        let mut current = record;
        for segment in &self.segments {
            current = current.get(segment)?;
        }
        Some(current)
    }
}

pub fn is_null_like(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// String form used for group keys, distinct counting and loose equality.
/// Null maps to the empty string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Timestamps arrive as RFC 3339 strings, bare dates, or epoch
/// milliseconds depending on which module wrote the record.
pub fn value_as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => parse_datetime_str(text),
        Value::Number(number) => {
            let millis = number.as_i64()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

fn parse_datetime_str(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return local_to_utc(parsed);
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return local_to_utc(parsed.and_hms_opt(0, 0, 0)?);
    }
    None
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Sort comparator over record values: numeric when both sides cast,
/// case-insensitive lexicographic otherwise. Missing values order first.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => {
            if let (Some(x), Some(y)) = (value_as_f64(left), value_as_f64(right)) {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            } else {
                value_to_string(left)
                    .to_lowercase()
                    .cmp(&value_to_string(right).to_lowercase())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_path_resolves_nested_values() {
        let record = json!({"address": {"city": "Haifa"}, "price": 120});
        let path = FieldPath::parse("address.city").expect("parse path");
        assert_eq!(path.resolve(&record), Some(&json!("Haifa")));
        assert!(FieldPath::parse("missing.branch")
            .expect("parse")
            .resolve(&record)
            .is_none());
    }

    #[test]
    fn field_path_rejects_malformed_input() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert!(FieldPath::parse("  ").is_err());
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        assert_eq!(
            compare_values(Some(&json!("9")), Some(&json!("10"))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!("Beta")), Some(&json!("alpha"))),
            Ordering::Greater
        );
        assert_eq!(compare_values(None, Some(&json!(0))), Ordering::Less);
    }

    #[test]
    fn datetime_parsing_accepts_common_shapes() {
        assert!(value_as_datetime(&json!("2026-03-01T10:00:00Z")).is_some());
        assert!(value_as_datetime(&json!("2026-03-01")).is_some());
        assert!(value_as_datetime(&json!(1_760_000_000_000_i64)).is_some());
        assert!(value_as_datetime(&json!("not a date")).is_none());
        assert!(value_as_datetime(&json!(["2026-03-01"])).is_none());
    }
}
