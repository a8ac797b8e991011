//! An in-memory `Session` fixture used by this crate's own test suite
//! (spec §8 "Testable properties"). Not wired to any network; every table is
//! held as a plain in-memory row vector.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::{ColumnMeta, ColumnType, IndexMeta, RoutineKind, RoutineMeta, Session, Value};

#[derive(Debug, Clone)]
pub struct FakeTable {
    pub columns: Vec<ColumnMeta>,
    pub indexes: Vec<IndexMeta>,
    pub rows: Vec<Vec<Value>>,
    pub create_sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct FakeSchema {
    pub tables: BTreeMap<String, FakeTable>,
    pub views: BTreeMap<String, String>,
    pub create_sql: String,
    /// Event name -> `SHOW CREATE EVENT` text.
    pub events: BTreeMap<String, String>,
    /// Routine name -> (function/procedure, `SHOW CREATE` text).
    pub routines: BTreeMap<String, (RoutineKind, String)>,
    /// Trigger name -> (owning table, `SHOW CREATE TRIGGER` text).
    pub triggers: BTreeMap<String, (String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeInstance {
    pub schemas: BTreeMap<String, FakeSchema>,
    pub gtid_executed: Option<String>,
    /// Accounts as `user@host`.
    pub users: Vec<String>,
    /// `user@host` -> that account's grants.
    pub grants: BTreeMap<String, Vec<String>>,
    /// Grants of the session's own (dumping) user.
    pub current_user_grants: Vec<String>,
}

/// Shared, lock-protected instance fixture; clone the handle into each
/// `FakeSession` the way every real `Worker` shares one backing server.
#[derive(Clone, Default)]
pub struct FakeInstanceHandle(pub Arc<Mutex<FakeInstance>>);

impl FakeInstanceHandle {
    pub fn new(instance: FakeInstance) -> Self {
        FakeInstanceHandle(Arc::new(Mutex::new(instance)))
    }
}

pub struct FakeSession {
    instance: FakeInstanceHandle,
    locked: bool,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl FakeSession {
    pub fn new(instance: FakeInstanceHandle) -> Self {
        FakeSession {
            instance,
            locked: false,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn with_table<R>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&FakeTable) -> Result<R>,
    ) -> Result<R> {
        let guard = self.instance.0.lock().unwrap();
        let schema = guard
            .schemas
            .get(schema)
            .ok_or_else(|| anyhow!("unknown schema {}", schema))?;
        let table = schema
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("unknown table {}.{}", schema.create_sql, table))?;
        f(table)
    }
}

fn ordinal(row: &[Value], columns: &[ColumnMeta], name: &str) -> Option<usize> {
    columns.iter().position(|c| c.name == name).filter(|i| *i < row.len())
}

impl Session for FakeSession {
    fn session_setup(&mut self, _character_set: &str, _utc_time_zone: bool) -> Result<()> {
        Ok(())
    }

    fn flush_with_read_lock(&mut self) -> Result<()> {
        self.locked = true;
        Ok(())
    }

    fn lock_tables(&mut self, _tables: &[(String, String)]) -> Result<()> {
        self.locked = true;
        Ok(())
    }

    fn unlock_tables(&mut self) -> Result<()> {
        self.locked = false;
        Ok(())
    }

    fn lock_instance_for_backup(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn start_consistent_snapshot(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<()> {
        Ok(())
    }

    fn gtid_executed(&mut self) -> Result<Option<String>> {
        Ok(self.instance.0.lock().unwrap().gtid_executed.clone())
    }

    fn list_schemas(&mut self) -> Result<Vec<String>> {
        Ok(self.instance.0.lock().unwrap().schemas.keys().cloned().collect())
    }

    fn list_tables(&mut self, schema: &str) -> Result<Vec<String>> {
        let guard = self.instance.0.lock().unwrap();
        Ok(guard
            .schemas
            .get(schema)
            .map(|s| s.tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_views(&mut self, schema: &str) -> Result<Vec<String>> {
        let guard = self.instance.0.lock().unwrap();
        Ok(guard
            .schemas
            .get(schema)
            .map(|s| s.views.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn list_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>> {
        self.with_table(schema, table, |t| Ok(t.columns.clone()))
    }

    fn list_indexes(&mut self, schema: &str, table: &str) -> Result<Vec<IndexMeta>> {
        self.with_table(schema, table, |t| Ok(t.indexes.clone()))
    }

    fn table_status(&mut self, schema: &str, table: &str) -> Result<(u64, Option<u64>)> {
        self.with_table(schema, table, |t| Ok((t.rows.len() as u64, None)))
    }

    fn show_create_table(&mut self, schema: &str, table: &str) -> Result<String> {
        self.with_table(schema, table, |t| Ok(t.create_sql.clone()))
    }

    fn show_create_schema(&mut self, schema: &str) -> Result<String> {
        let guard = self.instance.0.lock().unwrap();
        guard
            .schemas
            .get(schema)
            .map(|s| s.create_sql.clone())
            .ok_or_else(|| anyhow!("unknown schema {}", schema))
    }

    fn show_create_view(&mut self, schema: &str, view: &str) -> Result<String> {
        let guard = self.instance.0.lock().unwrap();
        guard
            .schemas
            .get(schema)
            .and_then(|s| s.views.get(view).cloned())
            .ok_or_else(|| anyhow!("unknown view {}.{}", schema, view))
    }

    fn min_max(&mut self, schema: &str, table: &str, key_column: &str) -> Result<(Value, Value)> {
        self.with_table(schema, table, |t| {
            let idx = ordinal(&[], &t.columns, key_column)
                .or_else(|| t.columns.iter().position(|c| c.name == key_column))
                .ok_or_else(|| anyhow!("unknown column {}", key_column))?;
            let mut min: Option<i64> = None;
            let mut max: Option<i64> = None;
            let mut has_null = false;
            for row in &t.rows {
                match row.get(idx) {
                    Some(Value::Int(v)) => {
                        min = Some(min.map_or(*v, |m| m.min(*v)));
                        max = Some(max.map_or(*v, |m| m.max(*v)));
                    }
                    Some(Value::UInt(v)) => {
                        let v = *v as i64;
                        min = Some(min.map_or(v, |m| m.min(v)));
                        max = Some(max.map_or(v, |m| m.max(v)));
                    }
                    Some(Value::Null) | None => has_null = true,
                    _ => {}
                }
            }
            let _ = has_null;
            Ok((
                min.map(Value::Int).unwrap_or(Value::Null),
                max.map(Value::Int).unwrap_or(Value::Null),
            ))
        })
    }

    fn explain_count(&mut self, schema: &str, table: &str, where_clause: &str) -> Result<u64> {
        // The fixture has no planner; evaluate the `BETWEEN` predicate
        // literally so chunker tests exercise real boundary math.
        self.with_table(schema, table, |t| {
            Ok(where_clause::matching_rows(&t.rows, &t.columns, where_clause).len() as u64)
        })
    }

    fn nth_key(
        &mut self,
        schema: &str,
        table: &str,
        key_column: &str,
        where_clause: &str,
        _order_by: &str,
        skip: u64,
    ) -> Result<Option<Value>> {
        self.with_table(schema, table, |t| {
            let idx = t
                .columns
                .iter()
                .position(|c| c.name == key_column)
                .ok_or_else(|| anyhow!("unknown column {}", key_column))?;
            let matching = where_clause::matching_rows(&t.rows, &t.columns, where_clause);
            let mut keys: Vec<&Value> = matching.iter().filter_map(|r| r.get(idx)).collect();
            keys.sort_by(|a, b| format!("{:?}", a).cmp(&format!("{:?}", b)));
            Ok(keys.get(skip as usize).cloned().cloned())
        })
    }

    fn stream_range(
        &mut self,
        schema: &str,
        table: &str,
        columns: &[String],
        where_clause: &str,
        _order_by: &str,
        sink: &mut dyn FnMut(Vec<Value>) -> Result<bool>,
    ) -> Result<u64> {
        self.with_table(schema, table, |t| {
            let idxs: Vec<usize> = columns
                .iter()
                .map(|name| {
                    t.columns
                        .iter()
                        .position(|c| &c.name == name)
                        .ok_or_else(|| anyhow!("unknown column {}", name))
                })
                .collect::<Result<_>>()?;

            let matching = where_clause::matching_rows(&t.rows, &t.columns, where_clause);
            let mut count = 0u64;
            for row in matching {
                let projected: Vec<Value> = idxs.iter().map(|i| row[*i].clone()).collect();
                count += 1;
                if self.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                if !sink(projected)? {
                    break;
                }
            }
            Ok(count)
        })
    }

    fn kill_query(&mut self) -> Result<()> {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn list_events(&mut self, schema: &str) -> Result<Vec<String>> {
        let guard = self.instance.0.lock().unwrap();
        Ok(guard
            .schemas
            .get(schema)
            .map(|s| s.events.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn show_create_event(&mut self, schema: &str, event: &str) -> Result<String> {
        let guard = self.instance.0.lock().unwrap();
        guard
            .schemas
            .get(schema)
            .and_then(|s| s.events.get(event).cloned())
            .ok_or_else(|| anyhow!("unknown event {}.{}", schema, event))
    }

    fn list_routines(&mut self, schema: &str) -> Result<Vec<RoutineMeta>> {
        let guard = self.instance.0.lock().unwrap();
        Ok(guard
            .schemas
            .get(schema)
            .map(|s| {
                s.routines
                    .iter()
                    .map(|(name, (kind, _))| RoutineMeta {
                        name: name.clone(),
                        kind: *kind,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn show_create_routine(&mut self, schema: &str, routine: &RoutineMeta) -> Result<String> {
        let guard = self.instance.0.lock().unwrap();
        guard
            .schemas
            .get(schema)
            .and_then(|s| s.routines.get(&routine.name))
            .map(|(_, sql)| sql.clone())
            .ok_or_else(|| anyhow!("unknown routine {}.{}", schema, routine.name))
    }

    fn list_triggers(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let guard = self.instance.0.lock().unwrap();
        Ok(guard
            .schemas
            .get(schema)
            .map(|s| {
                s.triggers
                    .iter()
                    .filter(|(_, (owner, _))| owner == table)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn show_create_trigger(&mut self, schema: &str, trigger: &str) -> Result<String> {
        let guard = self.instance.0.lock().unwrap();
        guard
            .schemas
            .get(schema)
            .and_then(|s| s.triggers.get(trigger))
            .map(|(_, sql)| sql.clone())
            .ok_or_else(|| anyhow!("unknown trigger {}.{}", schema, trigger))
    }

    fn list_users(&mut self) -> Result<Vec<String>> {
        Ok(self.instance.0.lock().unwrap().users.clone())
    }

    fn show_grants_for_user(&mut self, user: &str) -> Result<Vec<String>> {
        Ok(self
            .instance
            .0
            .lock()
            .unwrap()
            .grants
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    fn current_user_grants(&mut self) -> Result<Vec<String>> {
        Ok(self.instance.0.lock().unwrap().current_user_grants.clone())
    }
}

/// Minimal evaluator for the small grammar `dump::worker`, `dump::chunker`
/// and `dump::range` actually emit: `1=1`, `` `col` BETWEEN a AND b ``
/// (optionally `` OR `col` IS NULL``), `` `col` > a `` (LIMIT-walking's
/// probe clause), and a compound `(A) AND (B)` for a table's
/// `extra_condition`. Enough to exercise real boundary math in tests
/// without a server; it does not attempt to parse arbitrary SQL.
mod where_clause {
    use super::{ColumnMeta, Value};

    pub fn matching_rows<'a>(
        rows: &'a [Vec<Value>],
        columns: &[ColumnMeta],
        clause: &str,
    ) -> Vec<&'a Vec<Value>> {
        rows.iter().filter(|row| eval(clause, row, columns)).collect()
    }

    fn eval(clause: &str, row: &[Value], columns: &[ColumnMeta]) -> bool {
        let clause = strip_comment(clause).trim();

        if let Some((left, right)) = split_and(clause) {
            return eval(left, row, columns) && eval(right, row, columns);
        }
        if clause == "1=1" {
            return true;
        }
        if let Some((col, lo, hi)) = parse_between(clause) {
            let include_nulls = clause.contains("IS NULL");
            return match columns.iter().position(|c| c.name == col).and_then(|i| row.get(i)) {
                Some(Value::Null) => include_nulls,
                Some(v) => v.as_i64().map_or(false, |n| n >= lo && n <= hi),
                None => false,
            };
        }
        if let Some((col, threshold)) = parse_gt(clause) {
            return match columns.iter().position(|c| c.name == col).and_then(|i| row.get(i)) {
                Some(v) => v.as_i64().map_or(false, |n| n > threshold),
                None => false,
            };
        }
        // Unrecognized clause: permissive default, matching every row.
        true
    }

    fn strip_comment(s: &str) -> &str {
        match s.find("/*") {
            Some(i) => &s[..i],
            None => s,
        }
    }

    /// Splits a top-level `(A) AND (B)`, honoring paren nesting depth so an
    /// `A` that itself contains parens (e.g. an already-parenthesized
    /// `BETWEEN ... OR ... IS NULL`) isn't split early.
    fn split_and(s: &str) -> Option<(&str, &str)> {
        if !s.starts_with('(') {
            return None;
        }
        let bytes = s.as_bytes();
        let mut depth = 0i32;
        let mut close_idx = None;
        for (i, &b) in bytes.iter().enumerate() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        close_idx = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close_idx = close_idx?;
        let rest = s[close_idx + 1..].trim_start().strip_prefix("AND")?.trim_start();
        if !rest.starts_with('(') || !rest.ends_with(')') {
            return None;
        }
        Some((&s[1..close_idx], &rest[1..rest.len() - 1]))
    }

    fn column_name(rest: &str) -> Option<(String, &str)> {
        let start = rest.find('`')?;
        let end = rest[start + 1..].find('`')? + start + 1;
        Some((rest[start + 1..end].to_string(), &rest[end + 1..]))
    }

    fn parse_between(clause: &str) -> Option<(String, i64, i64)> {
        // `` `col` BETWEEN lo AND hi [OR `col` IS NULL] ``
        let rest = clause.trim().trim_start_matches('(');
        let (col, after) = column_name(rest)?;
        let after = after.trim_start().strip_prefix("BETWEEN")?.trim_start();
        let mut parts = after.splitn(2, "AND");
        let lo_str = parts.next()?.trim();
        let hi_rest = parts.next()?.trim();
        let hi_str = hi_rest.split(|c: char| c == ' ' || c == ')').next()?;
        let lo = lo_str.parse::<i64>().ok()?;
        let hi = hi_str.parse::<i64>().ok()?;
        Some((col, lo, hi))
    }

    fn parse_gt(clause: &str) -> Option<(String, i64)> {
        // `` `col` > val ``
        let rest = clause.trim().trim_start_matches('(');
        let (col, after) = column_name(rest)?;
        let after = after.trim_start().strip_prefix('>')?.trim_start();
        let val_str = after.split(|c: char| c == ' ' || c == ')').next()?;
        let val = val_str.parse::<i64>().ok()?;
        Some((col, val))
    }

    #[cfg(test)]
    mod test {
        use super::*;

        fn columns() -> Vec<ColumnMeta> {
            vec![ColumnMeta {
                name: "id".into(),
                r#type: crate::session::ColumnType::Integer,
            }]
        }

        #[test]
        fn between_filters_inclusive() {
            let rows: Vec<Vec<Value>> = (0..10).map(|i| vec![Value::Int(i)]).collect();
            let matched = matching_rows(&rows, &columns(), "`id` BETWEEN 3 AND 5");
            assert_eq!(matched.len(), 3);
        }

        #[test]
        fn null_included_only_when_requested() {
            let mut rows: Vec<Vec<Value>> = (0..5).map(|i| vec![Value::Int(i)]).collect();
            rows.push(vec![Value::Null]);
            let without_null = matching_rows(&rows, &columns(), "`id` BETWEEN 0 AND 4");
            assert_eq!(without_null.len(), 5);
            let with_null = matching_rows(&rows, &columns(), "`id` BETWEEN 0 AND 4 OR `id` IS NULL");
            assert_eq!(with_null.len(), 6);
        }

        #[test]
        fn greater_than_filters_strictly() {
            let rows: Vec<Vec<Value>> = (0..10).map(|i| vec![Value::Int(i)]).collect();
            let matched = matching_rows(&rows, &columns(), "`id` > 6");
            assert_eq!(matched.len(), 3);
        }

        #[test]
        fn compound_and_intersects_both_sides() {
            let rows: Vec<Vec<Value>> = (0..10).map(|i| vec![Value::Int(i)]).collect();
            let matched = matching_rows(&rows, &columns(), "(`id` BETWEEN 0 AND 7) AND (`id` > 3)");
            assert_eq!(matched.len(), 4);
        }
    }
}
