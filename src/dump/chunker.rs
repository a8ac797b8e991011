//! Splits a table into approximately-equal-byte ranges (spec §4.5).

use anyhow::Result;

use crate::session::{ColumnType, Session, Value};

use super::range::Range;

const DEFAULT_ROW_BYTES: u64 = 256;
const MAX_REFINE_ITERATIONS: u32 = 10;
const MAX_REFINE_RETRIES: u32 = 10;

pub struct ChunkPlan {
    pub ranges: Vec<Range>,
}

/// Produce a chunk plan for `schema.table`, keyed on `key_column` (the
/// leading column of the Instance Cache's chosen index), targeting
/// `bytes_per_chunk` bytes per range.
///
/// `key_column` is `None` when no usable index was found; the table then
/// dumps as a single whole-table range (spec §4.5 "no valid index").
pub fn plan(
    session: &mut dyn Session,
    schema: &str,
    table: &str,
    key_column: Option<&str>,
    key_type: ColumnType,
    row_count_estimate: u64,
    avg_row_length: Option<u64>,
    bytes_per_chunk: u64,
    extra_condition: Option<&str>,
) -> Result<ChunkPlan> {
    if row_count_estimate == 0 {
        return Ok(ChunkPlan { ranges: Vec::new() });
    }

    let key_column = match key_column {
        Some(c) => c,
        None => {
            log::warn!("{}.{}: no usable index, dumping as a single range", schema, table);
            return Ok(ChunkPlan {
                ranges: vec![Range::whole_table()],
            });
        }
    };

    let avg_row_length = avg_row_length.unwrap_or_else(|| {
        log::info!(
            "{}.{}: no row-length statistics, assuming {} bytes/row (run ANALYZE TABLE to refresh statistics)",
            schema,
            table,
            DEFAULT_ROW_BYTES
        );
        DEFAULT_ROW_BYTES
    });

    let rows_per_chunk = (bytes_per_chunk / avg_row_length.max(1)).max(1);

    let (min, max) = session.min_max(schema, table, key_column)?;
    if min.is_null() {
        return Ok(ChunkPlan {
            ranges: vec![Range::whole_table()],
        });
    }

    if key_type.is_integer() {
        arithmetic_striding(
            session,
            schema,
            table,
            key_column,
            &min,
            &max,
            row_count_estimate,
            rows_per_chunk,
            extra_condition,
        )
    } else {
        limit_walking(session, schema, table, key_column, &max, rows_per_chunk, extra_condition)
    }
}

fn arithmetic_striding(
    session: &mut dyn Session,
    schema: &str,
    table: &str,
    key_column: &str,
    min: &Value,
    max: &Value,
    row_count_estimate: u64,
    rows_per_chunk: u64,
    extra_condition: Option<&str>,
) -> Result<ChunkPlan> {
    let min_i = min.as_i64().unwrap_or(0);
    let max_i = max.as_i64().unwrap_or(min_i);

    let chunk_count = (row_count_estimate / rows_per_chunk).max(1);
    let span = (max_i - min_i).max(0);
    let mut step = if chunk_count > 0 { span / chunk_count as i64 } else { span };
    if step < 1 {
        step = 1;
    }

    let tolerance = (rows_per_chunk / 10).max(10) as u64;

    let mut ranges = Vec::new();
    let mut prev = min_i;
    let mut current = (min_i + step).min(max_i);
    let mut first = true;

    loop {
        let mut candidate = current;
        let mut accepted = candidate == max_i;

        if !accepted {
            let mut lo = prev;
            let mut hi = (prev + 2 * step).min(max_i).max(prev);

            'retry: for _ in 0..MAX_REFINE_RETRIES {
                let mut probe_lo = lo;
                let mut probe_hi = hi;
                for _ in 0..MAX_REFINE_ITERATIONS {
                    let middle = probe_lo + (probe_hi - probe_lo) / 2;
                    if middle == probe_lo {
                        candidate = middle;
                        break;
                    }
                    let mut clause = format!("`{}` BETWEEN {} AND {}", key_column, prev, middle);
                    if let Some(extra) = extra_condition {
                        clause = format!("({}) AND ({})", clause, extra);
                    }
                    let estimate = session.explain_count(schema, table, &clause)?;

                    if estimate >= rows_per_chunk.saturating_sub(tolerance)
                        && estimate <= rows_per_chunk.saturating_add(tolerance)
                    {
                        candidate = middle;
                        accepted = true;
                        break 'retry;
                    } else if estimate < rows_per_chunk {
                        probe_lo = middle;
                    } else {
                        probe_hi = middle;
                    }
                }
                candidate = probe_hi;
                if candidate >= max_i {
                    candidate = max_i;
                    accepted = true;
                    break;
                }
                lo = candidate;
                hi = (lo + 2 * step).min(max_i).max(lo);
            }
        }

        if candidate > max_i || accepted && candidate == max_i {
            candidate = candidate.min(max_i);
        }

        ranges.push(Range {
            key_type: ColumnType::Integer,
            begin: Value::Int(prev),
            end: Value::Int(candidate),
            include_nulls: first,
        });
        first = false;

        if candidate >= max_i {
            break;
        }
        prev = candidate + 1;
        current = (prev + step).min(max_i);
        if prev > max_i {
            break;
        }
    }

    Ok(ChunkPlan { ranges })
}

fn limit_walking(
    session: &mut dyn Session,
    schema: &str,
    table: &str,
    key_column: &str,
    max: &Value,
    rows_per_chunk: u64,
    extra_condition: Option<&str>,
) -> Result<ChunkPlan> {
    let mut ranges = Vec::new();
    let mut lower: Option<Value> = None;
    let mut first = true;

    loop {
        let mut where_clause = match &lower {
            None => "1=1".to_string(),
            Some(prev_upper) => format!("`{}` > {}", key_column, literal(prev_upper)),
        };
        if let Some(extra) = extra_condition {
            where_clause = format!("({}) AND ({})", where_clause, extra);
        }
        let order_by = format!("`{}` ASC", key_column);

        let next_upper = session.nth_key(
            schema,
            table,
            key_column,
            &where_clause,
            &order_by,
            rows_per_chunk.saturating_sub(1),
        )?;

        let upper = match next_upper {
            Some(v) => v,
            None => max.clone(),
        };

        let begin = lower.clone().unwrap_or_else(|| upper.clone());
        ranges.push(Range {
            key_type: ColumnType::String,
            begin,
            end: upper.clone(),
            include_nulls: first,
        });
        first = false;

        if upper == *max {
            break;
        }
        lower = Some(upper);
    }

    Ok(ChunkPlan { ranges })
}

fn literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::Bytes(b) => format!("'{}'", String::from_utf8_lossy(b).replace('\'', "\\'")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::fake::{FakeInstance, FakeInstanceHandle};
    use crate::session::FakeSession;

    fn empty_session() -> FakeSession {
        FakeSession::new(FakeInstanceHandle::new(FakeInstance::default()))
    }

    #[test]
    fn zero_rows_produces_no_ranges() {
        let mut session = empty_session();
        let plan = plan(
            &mut session,
            "s",
            "t",
            Some("id"),
            ColumnType::Integer,
            0,
            Some(100),
            1024,
            None,
        )
        .unwrap();
        assert!(plan.ranges.is_empty());
    }

    #[test]
    fn no_index_is_whole_table() {
        let mut session = empty_session();
        let plan = plan(
            &mut session,
            "s",
            "t",
            None,
            ColumnType::Integer,
            10,
            Some(100),
            1024,
            None,
        )
        .unwrap();
        assert_eq!(plan.ranges.len(), 1);
        assert!(plan.ranges[0].is_whole_table());
    }
}
