use bytes::Bytes;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::json::ArrayWriter;
use datafusion::dataframe::DataFrame;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::scalar::ScalarValue;
use futures::Stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tracing::debug;

use crate::error::DataAccessError;
use crate::pool::PooledConnection;

/// Largest integer JSON consumers can hold exactly in a double.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

async fn plan(
    conn: &PooledConnection,
    query: &str,
    params: Vec<(String, ScalarValue)>,
) -> Result<DataFrame, DataAccessError> {
    // The stored query was validated when the view was defined; a
    // planning failure here is an engine-side condition, most commonly
    // the dataset object not having materialized yet.
    let df = conn
        .ctx()
        .sql(query)
        .await
        .map_err(|e| DataAccessError::EngineError {
            message: e.to_string(),
        })?;

    if params.is_empty() {
        return Ok(df);
    }
    df.with_param_values(params)
        .map_err(|e| DataAccessError::EngineError {
            message: e.to_string(),
        })
}

/// Runs the query to completion and returns the full ordered row set.
/// The connection is released on every exit path when `conn` drops.
pub async fn run_buffered(
    conn: PooledConnection,
    query: &str,
    params: Vec<(String, ScalarValue)>,
) -> Result<Vec<Value>, DataAccessError> {
    let df = plan(&conn, query, params).await?;
    let batches = df
        .collect()
        .await
        .map_err(|e| DataAccessError::EngineError {
            message: e.to_string(),
        })?;

    let mut rows = Vec::new();
    for batch in &batches {
        rows.extend(batch_to_rows(batch)?);
    }
    debug!(rows = rows.len(), "Buffered query completed");
    Ok(rows)
}

/// Opens a lazy, forward-only cursor over the query and returns a
/// stream of NDJSON lines. The pooled connection travels inside the
/// stream and is released exactly once: on completion, on error, or on
/// drop when the consumer disconnects mid-stream.
pub async fn run_streamed(
    conn: PooledConnection,
    query: &str,
    params: Vec<(String, ScalarValue)>,
) -> Result<RowStream, DataAccessError> {
    let df = plan(&conn, query, params).await?;
    let cursor = df
        .execute_stream()
        .await
        .map_err(|e| DataAccessError::EngineError {
            message: e.to_string(),
        })?;

    Ok(RowStream {
        cursor,
        conn: Some(conn),
        pending: VecDeque::new(),
        done: false,
    })
}

pub struct RowStream {
    cursor: SendableRecordBatchStream,
    conn: Option<PooledConnection>,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl Stream for RowStream {
    type Item = Result<Bytes, DataAccessError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            // Pulling the next chunk only after the previous lines were
            // consumed keeps the producer from materializing the result
            // set; a saturated sink parks this future until drained.
            match ready!(self.cursor.as_mut().poll_next(cx)) {
                Some(Ok(batch)) => match serialize_batch(&batch) {
                    Ok(lines) => self.pending.extend(lines),
                    Err(e) => {
                        self.done = true;
                        self.conn.take();
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Some(Err(e)) => {
                    self.done = true;
                    self.conn.take();
                    return Poll::Ready(Some(Err(DataAccessError::EngineError {
                        message: e.to_string(),
                    })));
                }
                None => {
                    self.done = true;
                    self.conn.take();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

fn serialize_batch(batch: &RecordBatch) -> Result<Vec<Bytes>, DataAccessError> {
    batch_to_rows(batch)?
        .into_iter()
        .map(|row| {
            let mut line = serde_json::to_vec(&row)?;
            line.push(b'\n');
            Ok(Bytes::from(line))
        })
        .collect()
}

/// Converts a record batch into JSON row objects, with integers beyond
/// the double-safe range downgraded to a JSON-safe representation.
pub fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<Value>, DataAccessError> {
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(batch)?;
    writer.finish()?;
    let rows: Vec<Value> = serde_json::from_slice(&writer.into_inner())?;
    Ok(rows.into_iter().map(to_json_safe).collect())
}

fn to_json_safe(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            // unsigned_abs keeps i64::MIN in range.
            let unsafe_int = n
                .as_i64()
                .map(|i| i.unsigned_abs() > MAX_SAFE_INTEGER as u64)
                .or_else(|| n.as_u64().map(|u| u > MAX_SAFE_INTEGER as u64))
                .unwrap_or(false);
            if unsafe_int {
                let as_float = n.as_i64().map(|i| i as f64).or_else(|| {
                    n.as_u64().map(|u| u as f64)
                });
                match as_float.and_then(serde_json::Number::from_f64) {
                    Some(f) => Value::Number(f),
                    None => Value::Number(n),
                }
            } else {
                Value::Number(n)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(to_json_safe).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k, to_json_safe(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_within_the_safe_range_stay_exact() {
        let value = json!({"count": MAX_SAFE_INTEGER, "neg": -MAX_SAFE_INTEGER});
        assert_eq!(to_json_safe(value.clone()), value);
    }

    #[test]
    fn oversized_integers_become_json_safe_floats() {
        let value = json!({"big": MAX_SAFE_INTEGER + 1});
        let safe = to_json_safe(value);
        assert_eq!(
            safe["big"].as_f64(),
            Some((MAX_SAFE_INTEGER + 1) as f64)
        );
    }

    #[test]
    fn extreme_integers_convert_without_overflow() {
        let safe = to_json_safe(json!(i64::MIN));
        assert_eq!(safe.as_f64(), Some(i64::MIN as f64));

        let safe = to_json_safe(json!(u64::MAX));
        assert_eq!(safe.as_f64(), Some(u64::MAX as f64));
    }

    #[test]
    fn conversion_recurses_into_arrays_and_objects() {
        let value = json!([{"nested": {"big": i64::MAX}}, 7]);
        let safe = to_json_safe(value);
        assert_eq!(safe[0]["nested"]["big"].as_f64(), Some(i64::MAX as f64));
        assert_eq!(safe[1], json!(7));
    }
}
