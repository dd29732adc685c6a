use chrono::{DateTime, NaiveDate, NaiveDateTime};
use datafusion::scalar::ScalarValue;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

use crate::catalog::{ParamSpec, ParamType};
use crate::error::DataAccessError;

/// Validates and coerces request values against the declared specs, in
/// declaration order, producing the named values bound to the view
/// query's placeholders.
///
/// A view declared with no specs passes incoming parameters through
/// unchecked as strings; older view definitions predate the spec list
/// and still rely on that loose mode.
pub fn apply_params(
    values: &HashMap<String, String>,
    specs: &[ParamSpec],
) -> Result<Vec<(String, ScalarValue)>, DataAccessError> {
    if specs.is_empty() {
        let mut passthrough: Vec<(String, ScalarValue)> = values
            .iter()
            .map(|(k, v)| (k.clone(), ScalarValue::from(v.as_str())))
            .collect();
        passthrough.sort_by(|a, b| a.0.cmp(&b.0));
        return Ok(passthrough);
    }

    let mut bound = Vec::with_capacity(specs.len());
    for spec in specs {
        let raw = match values.get(&spec.name) {
            Some(v) => v.clone(),
            None if spec.required => {
                return Err(DataAccessError::MissingRequiredParam {
                    name: spec.name.clone(),
                })
            }
            None => match &spec.default {
                Some(default) => default.clone(),
                // Optional without default: simply absent from the
                // bound set; the view query must not reference it.
                None => continue,
            },
        };

        let value = coerce(spec, &raw)?;
        check_range(spec, &value)?;
        check_enum(spec, &raw)?;
        bound.push((spec.name.clone(), value));
    }

    Ok(bound)
}

fn coerce(spec: &ParamSpec, raw: &str) -> Result<ScalarValue, DataAccessError> {
    let invalid = || DataAccessError::InvalidType {
        name: spec.name.clone(),
        expected: spec.param_type.as_str().to_string(),
        value: raw.to_string(),
    };

    match spec.param_type {
        ParamType::Numeric => {
            if let Ok(int) = raw.parse::<i64>() {
                return Ok(ScalarValue::Int64(Some(int)));
            }
            match raw.parse::<f64>() {
                Ok(float) if float.is_finite() => Ok(ScalarValue::Float64(Some(float))),
                _ => Err(invalid()),
            }
        }
        ParamType::Boolean => match raw {
            "true" | "1" => Ok(ScalarValue::Boolean(Some(true))),
            "false" | "0" => Ok(ScalarValue::Boolean(Some(false))),
            _ => Err(invalid()),
        },
        ParamType::String => Ok(ScalarValue::from(raw)),
        ParamType::Date => {
            let decoded = percent_decode_str(raw)
                .decode_utf8()
                .map_err(|_| invalid())?
                .into_owned();
            let normalized = normalize_utc_offset(&decoded);
            parse_date(&normalized).ok_or_else(invalid)
        }
    }
}

/// Clients commonly send RFC 3339 timestamps with a bare hour offset
/// ("+01" instead of "+01:00"); chrono rejects those, so the minutes are
/// appended before parsing. Plain dates are left untouched.
fn normalize_utc_offset(value: &str) -> String {
    if !value.contains(':') {
        return value.to_string();
    }
    let bytes = value.as_bytes();
    if bytes.len() > 3 {
        let tail = &bytes[bytes.len() - 3..];
        if (tail[0] == b'+' || tail[0] == b'-')
            && tail[1].is_ascii_digit()
            && tail[2].is_ascii_digit()
        {
            return format!("{}:00", value);
        }
    }
    value.to_string()
}

fn parse_date(value: &str) -> Option<ScalarValue> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(ScalarValue::TimestampMicrosecond(
            Some(instant.timestamp_micros()),
            None,
        ));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ScalarValue::TimestampMicrosecond(
                Some(naive.and_utc().timestamp_micros()),
                None,
            ));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid epoch");
        return Some(ScalarValue::Date32(Some(
            (date - epoch).num_days() as i32,
        )));
    }
    None
}

fn check_range(spec: &ParamSpec, value: &ScalarValue) -> Result<(), DataAccessError> {
    let (min, max) = match (spec.min, spec.max) {
        (None, None) => return Ok(()),
        bounds => bounds,
    };
    let numeric = match value {
        ScalarValue::Int64(Some(v)) => *v as f64,
        ScalarValue::Float64(Some(v)) => *v,
        // Range bounds only make sense for numeric parameters.
        _ => return Ok(()),
    };
    let min = min.unwrap_or(f64::NEG_INFINITY);
    let max = max.unwrap_or(f64::INFINITY);
    if numeric < min || numeric > max {
        return Err(DataAccessError::OutOfRange {
            name: spec.name.clone(),
            value: numeric,
            min,
            max,
        });
    }
    Ok(())
}

fn check_enum(spec: &ParamSpec, raw: &str) -> Result<(), DataAccessError> {
    if let Some(allowed) = &spec.one_of {
        if !allowed.iter().any(|choice| choice == raw) {
            return Err(DataAccessError::NotInEnum {
                name: spec.name.clone(),
                value: raw.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParamType;

    fn spec(name: &str, param_type: ParamType) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            param_type,
            required: false,
            default: None,
            min: None,
            max: None,
            one_of: None,
        }
    }

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn binds_every_declared_name_when_values_satisfy_specs() {
        let specs = vec![
            ParamSpec {
                required: true,
                ..spec("age", ParamType::Numeric)
            },
            ParamSpec {
                default: Some("true".to_string()),
                ..spec("active", ParamType::Boolean)
            },
            spec("name", ParamType::String),
        ];
        let bound = apply_params(&values(&[("age", "30"), ("name", "ana")]), &specs).unwrap();

        let names: Vec<&str> = bound.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["age", "active", "name"]);
        assert_eq!(bound[0].1, ScalarValue::Int64(Some(30)));
        assert_eq!(bound[1].1, ScalarValue::Boolean(Some(true)));
    }

    #[test]
    fn missing_required_fails_regardless_of_other_params() {
        let specs = vec![
            ParamSpec {
                required: true,
                ..spec("age", ParamType::Numeric)
            },
            spec("name", ParamType::String),
        ];
        let err = apply_params(&values(&[("name", "ana")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "MissingRequiredParam");
    }

    #[test]
    fn optional_without_default_is_simply_absent() {
        let specs = vec![spec("age", ParamType::Numeric)];
        let bound = apply_params(&values(&[]), &specs).unwrap();
        assert!(bound.is_empty());
    }

    #[test]
    fn numeric_coercion_rejects_non_finite_and_garbage() {
        let specs = vec![spec("age", ParamType::Numeric)];
        for bad in ["abc", "NaN", "inf", ""] {
            let err = apply_params(&values(&[("age", bad)]), &specs).unwrap_err();
            assert_eq!(err.kind(), "InvalidType", "value {:?}", bad);
        }
        let bound = apply_params(&values(&[("age", "2.5")]), &specs).unwrap();
        assert_eq!(bound[0].1, ScalarValue::Float64(Some(2.5)));
    }

    #[test]
    fn boolean_accepts_true_and_one_only() {
        let specs = vec![spec("active", ParamType::Boolean)];
        for (raw, expected) in [("true", true), ("1", true), ("false", false), ("0", false)] {
            let bound = apply_params(&values(&[("active", raw)]), &specs).unwrap();
            assert_eq!(bound[0].1, ScalarValue::Boolean(Some(expected)));
        }
        let err = apply_params(&values(&[("active", "yes")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "InvalidType");
    }

    #[test]
    fn date_percent_decodes_and_normalizes_bare_offset() {
        let specs = vec![spec("since", ParamType::Date)];
        // 2024-03-01T10:00:00+01 percent-encoded, bare hour offset
        let bound =
            apply_params(&values(&[("since", "2024-03-01T10%3A00%3A00%2B01")]), &specs).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-03-01T10:00:00+01:00")
            .unwrap()
            .timestamp_micros();
        assert_eq!(
            bound[0].1,
            ScalarValue::TimestampMicrosecond(Some(expected), None)
        );
    }

    #[test]
    fn plain_date_is_not_mangled_by_offset_normalization() {
        let specs = vec![spec("day", ParamType::Date)];
        let bound = apply_params(&values(&[("day", "2024-03-01")]), &specs).unwrap();
        assert!(matches!(bound[0].1, ScalarValue::Date32(Some(_))));

        let err = apply_params(&values(&[("day", "not-a-date")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "InvalidType");
    }

    #[test]
    fn range_violation_fails_even_when_coercion_succeeds() {
        let specs = vec![ParamSpec {
            min: Some(0.0),
            max: Some(100.0),
            ..spec("age", ParamType::Numeric)
        }];
        assert!(apply_params(&values(&[("age", "100")]), &specs).is_ok());
        assert!(apply_params(&values(&[("age", "0")]), &specs).is_ok());
        let err = apply_params(&values(&[("age", "101")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "OutOfRange");
        let err = apply_params(&values(&[("age", "-0.5")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "OutOfRange");
    }

    #[test]
    fn enum_violation_fails_even_when_coercion_succeeds() {
        let specs = vec![ParamSpec {
            one_of: Some(vec!["north".to_string(), "south".to_string()]),
            ..spec("region", ParamType::String)
        }];
        assert!(apply_params(&values(&[("region", "north")]), &specs).is_ok());
        let err = apply_params(&values(&[("region", "east")]), &specs).unwrap_err();
        assert_eq!(err.kind(), "NotInEnum");
    }

    #[test]
    fn empty_spec_list_passes_values_through_unchecked() {
        let bound = apply_params(&values(&[("limit", "10"), ("anything", "x")]), &[]).unwrap();
        assert_eq!(bound.len(), 2);
        assert!(bound
            .iter()
            .all(|(_, v)| matches!(v, ScalarValue::Utf8(Some(_)))));
    }

    #[test]
    fn default_is_validated_like_a_supplied_value() {
        let specs = vec![ParamSpec {
            default: Some("200".to_string()),
            min: Some(0.0),
            max: Some(100.0),
            ..spec("age", ParamType::Numeric)
        }];
        let err = apply_params(&values(&[]), &specs).unwrap_err();
        assert_eq!(err.kind(), "OutOfRange");
    }
}
