use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::DataAccessError;

/// Translated request of the legacy query endpoint.
#[derive(Debug, PartialEq)]
pub struct LegacyQuery {
    pub dataset_id: String,
    pub view_id: String,
    pub params: HashMap<String, String>,
    pub page_start: i64,
    pub page_size: i64,
}

/// Reshapes a legacy request into the regular execution path. The
/// dataset is referenced as a path whose last segment is the dataset
/// id; `param`-prefixed keys carry the view parameters.
///
/// A `param_not_` prefix historically signalled negation. That logic
/// was never finished upstream, so the prefix is stripped and the value
/// forwarded as-is.
pub fn adapt_legacy_params(
    query: &HashMap<String, String>,
) -> Result<LegacyQuery, DataAccessError> {
    let path = query.get("path").ok_or_else(|| DataAccessError::BadRequest {
        message: "path is required".to_string(),
    })?;
    let view_id = query
        .get("dataAccessId")
        .ok_or_else(|| DataAccessError::BadRequest {
            message: "dataAccessId is required".to_string(),
        })?
        .clone();

    let dataset_id = path
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if dataset_id.is_empty() {
        return Err(DataAccessError::BadRequest {
            message: format!("path {:?} does not reference a dataset", path),
        });
    }

    let mut params = HashMap::new();
    for (key, value) in query {
        if let Some(cleaned) = clean_param_key(key) {
            params.insert(cleaned.to_string(), value.clone());
        }
    }

    let page_start = parse_page_field(query, "pageStart", 0)?;
    let page_size = parse_page_field(query, "pageSize", 0)?;
    if query.contains_key("pageSize") {
        params.insert("limit".to_string(), page_size.to_string());
    }
    if query.contains_key("pageStart") {
        params.insert("offset".to_string(), page_start.to_string());
    }

    Ok(LegacyQuery {
        dataset_id,
        view_id,
        params,
        page_start,
        page_size,
    })
}

fn clean_param_key(key: &str) -> Option<&str> {
    let stripped = key.strip_prefix("param")?;
    let cleaned = stripped.strip_prefix("_not_").unwrap_or(stripped);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn parse_page_field(
    query: &HashMap<String, String>,
    name: &str,
    default: i64,
) -> Result<i64, DataAccessError> {
    match query.get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| DataAccessError::BadRequest {
            message: format!("{} must be an integer, got {:?}", name, raw),
        }),
    }
}

/// Reshapes plain row objects into the legacy
/// `{metadata, resultset, queryInfo}` envelope: column descriptors,
/// rows as positional arrays, and paging info.
pub fn to_legacy_result(rows: &[Value], page_start: i64, page_size: i64) -> Value {
    let columns: Vec<String> = rows
        .first()
        .and_then(|row| row.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    let metadata: Vec<Value> = columns
        .iter()
        .enumerate()
        .map(|(index, name)| json!({"colIndex": index, "colName": name}))
        .collect();

    let resultset: Vec<Value> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| row.get(col).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    json!({
        "metadata": metadata,
        "resultset": resultset,
        "queryInfo": {
            "pageStart": page_start,
            "pageSize": page_size,
            "totalRows": resultset.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_dataset_from_path_and_cleans_param_keys() {
        let adapted = adapt_legacy_params(&query(&[
            ("path", "/legacy/folder/sales"),
            ("dataAccessId", "by_age"),
            ("paramage", "30"),
            ("param_not_region", "north"),
            ("unrelated", "x"),
        ]))
        .unwrap();

        assert_eq!(adapted.dataset_id, "sales");
        assert_eq!(adapted.view_id, "by_age");
        assert_eq!(adapted.params.get("age").map(String::as_str), Some("30"));
        assert_eq!(
            adapted.params.get("region").map(String::as_str),
            Some("north")
        );
        assert!(!adapted.params.contains_key("unrelated"));
    }

    #[test]
    fn maps_paging_fields_to_limit_and_offset() {
        let adapted = adapt_legacy_params(&query(&[
            ("path", "sales"),
            ("dataAccessId", "by_age"),
            ("pageSize", "50"),
            ("pageStart", "100"),
        ]))
        .unwrap();

        assert_eq!(adapted.params.get("limit").map(String::as_str), Some("50"));
        assert_eq!(
            adapted.params.get("offset").map(String::as_str),
            Some("100")
        );
        assert_eq!(adapted.page_size, 50);
        assert_eq!(adapted.page_start, 100);
    }

    #[test]
    fn missing_path_or_access_id_is_a_client_error() {
        let err = adapt_legacy_params(&query(&[("dataAccessId", "v")])).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
        let err = adapt_legacy_params(&query(&[("path", "sales")])).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[test]
    fn legacy_envelope_turns_rows_into_positional_arrays() {
        let rows = vec![
            json!({"age": 30, "id": 1, "name": "ana"}),
            json!({"age": 40, "id": 3, "name": "carlos"}),
        ];
        let envelope = to_legacy_result(&rows, 0, 10);

        let metadata = envelope["metadata"].as_array().unwrap();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata[0]["colIndex"], 0);

        let resultset = envelope["resultset"].as_array().unwrap();
        assert_eq!(resultset.len(), 2);
        assert_eq!(resultset[0].as_array().unwrap().len(), 3);
        assert_eq!(envelope["queryInfo"]["totalRows"], 2);
    }

    #[test]
    fn empty_result_keeps_the_envelope_shape() {
        let envelope = to_legacy_result(&[], 5, 20);
        assert_eq!(envelope["metadata"], json!([]));
        assert_eq!(envelope["resultset"], json!([]));
        assert_eq!(envelope["queryInfo"]["totalRows"], 0);
        assert_eq!(envelope["queryInfo"]["pageStart"], 5);
    }
}
