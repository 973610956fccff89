use crate::models::{Aggregation, FormatType, MetricFormat};
use crate::value::{value_as_f64, value_to_string};
use serde_json::Value;
use std::collections::HashSet;

/// Apply one aggregation over the field values of a record set, in
/// original array order. Missing fields arrive as `Value::Null`.
pub fn apply_aggregation(aggregation: Aggregation, values: &[&Value]) -> Value {
    match aggregation {
        Aggregation::Count => Value::from(values.len()),
        Aggregation::CountDistinct => {
            let distinct: HashSet<String> = values
                .iter()
                .filter(|value| !value.is_null())
                .map(|value| value_to_string(value))
                .collect();
            Value::from(distinct.len())
        }
        Aggregation::Sum => Value::from(numeric(values).iter().sum::<f64>()),
        Aggregation::Average => {
            let numbers = numeric(values);
            if numbers.is_empty() {
                Value::from(0.0)
            } else {
                Value::from(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        Aggregation::Min => numeric(values)
            .into_iter()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.min(n))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        Aggregation::Max => numeric(values)
            .into_iter()
            .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.max(n))))
            .map(Value::from)
            .unwrap_or(Value::Null),
        Aggregation::Median => {
            let mut numbers = numeric(values);
            if numbers.is_empty() {
                return Value::Null;
            }
            numbers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = numbers.len() / 2;
            let median = if numbers.len() % 2 == 0 {
                (numbers[mid - 1] + numbers[mid]) / 2.0
            } else {
                numbers[mid]
            };
            Value::from(median)
        }
        Aggregation::First => values.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
        Aggregation::Last => values.last().map(|v| (*v).clone()).unwrap_or(Value::Null),
        Aggregation::None => Value::Null,
    }
}

fn numeric(values: &[&Value]) -> Vec<f64> {
    values.iter().filter_map(|value| value_as_f64(value)).collect()
}

/// Render a metric value per its declared format for the summary block.
pub fn format_metric_value(format: Option<&MetricFormat>, value: &Value) -> String {
    let Some(number) = value_as_f64(value) else {
        return value_to_string(value);
    };
    match format {
        Some(MetricFormat {
            kind: FormatType::Currency,
            decimals,
        }) => format!("${}", with_thousands(number, decimals.unwrap_or(2))),
        Some(MetricFormat {
            kind: FormatType::Percentage,
            decimals,
        }) => format!("{:.*}%", usize::from(decimals.unwrap_or(1)), number),
        Some(MetricFormat {
            kind: FormatType::Number,
            decimals,
        }) => with_thousands(number, decimals.unwrap_or(default_decimals(number))),
        None => with_thousands(number, default_decimals(number)),
    }
}

fn default_decimals(number: f64) -> u8 {
    if number.fract() == 0.0 {
        0
    } else {
        2
    }
}

fn with_thousands(number: f64, decimals: u8) -> String {
    let formatted = format!("{:.*}", usize::from(decimals), number.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (formatted, None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (offset, digit) in digits.iter().enumerate() {
        if offset > 0 && (digits.len() - offset) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*digit);
    }

    let sign = if number < 0.0 { "-" } else { "" };
    match frac_part {
        Some(frac) => format!("{sign}{grouped}.{frac}"),
        None => format!("{sign}{grouped}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn refs(values: &[Value]) -> Vec<&Value> {
        values.iter().collect()
    }

    #[test]
    fn median_uses_the_midpoint_rule() {
        let even = [json!(10), json!(20), json!(30), json!(40)];
        assert_eq!(
            apply_aggregation(Aggregation::Median, &refs(&even)),
            json!(25.0)
        );
        let odd = [json!(30), json!(10), json!(20)];
        assert_eq!(
            apply_aggregation(Aggregation::Median, &refs(&odd)),
            json!(20.0)
        );
    }

    #[test]
    fn count_distinct_ignores_nulls() {
        let values = [json!("A"), json!("A"), json!("B"), json!("B"), json!("C"), Value::Null];
        assert_eq!(
            apply_aggregation(Aggregation::CountDistinct, &refs(&values)),
            json!(3)
        );
    }

    #[test]
    fn sum_of_all_null_field_is_zero() {
        let values = [Value::Null, Value::Null];
        assert_eq!(apply_aggregation(Aggregation::Sum, &refs(&values)), json!(0.0));
    }

    #[test]
    fn first_and_last_follow_original_order() {
        let values = [json!("b"), json!("a"), json!("c")];
        assert_eq!(
            apply_aggregation(Aggregation::First, &refs(&values)),
            json!("b")
        );
        assert_eq!(
            apply_aggregation(Aggregation::Last, &refs(&values)),
            json!("c")
        );
    }

    #[test]
    fn numeric_strings_participate_in_sums() {
        let values = [json!("100"), json!(50), json!("not a number")];
        assert_eq!(apply_aggregation(Aggregation::Sum, &refs(&values)), json!(150.0));
    }

    #[test]
    fn currency_formatting_groups_thousands() {
        let format = MetricFormat {
            kind: FormatType::Currency,
            decimals: Some(2),
        };
        assert_eq!(
            format_metric_value(Some(&format), &json!(1234567.5)),
            "$1,234,567.50"
        );
        assert_eq!(format_metric_value(Some(&format), &json!(-900)), "$-900.00");
    }

    #[test]
    fn plain_numbers_trim_whole_values() {
        assert_eq!(format_metric_value(None, &json!(1200)), "1,200");
        assert_eq!(format_metric_value(None, &json!(3.25)), "3.25");
        assert_eq!(format_metric_value(None, &json!("n/a")), "n/a");
    }
}
