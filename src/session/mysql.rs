//! Concrete `Session` over `mysql_async`.
//!
//! Grounded in `other_examples/db4fd3bc_Selphyz-migrasiquel__src-dump.rs`,
//! which drives the same driver for the same purpose. Spec §5 models each
//! Worker as an OS thread with its own session; `mysql_async` is inherently
//! async, so each `MysqlSession` carries its own single-threaded Tokio
//! runtime and blocks the owning thread on it. No HTTP/server stack is
//! pulled in for this — only `rt`, `macros`, `time`, `sync`.

use anyhow::{anyhow, Context, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts};
use tokio::runtime::Runtime;

use super::{ColumnMeta, ColumnType, IndexMeta, RoutineKind, RoutineMeta, Session, Value};

pub struct MysqlSession {
    rt: Runtime,
    conn: Conn,
    /// A second connection used only for `KILL QUERY`, so cancellation
    /// doesn't race the in-flight query on the main connection.
    aux_conn: Option<Conn>,
    connection_id: u32,
}

impl MysqlSession {
    pub fn connect(url: &str) -> Result<Self> {
        let rt = Runtime::new().context("failed to start per-worker tokio runtime")?;
        let opts = Opts::from_url(url).context("invalid MySQL connection URL")?;
        let (conn, connection_id) = rt.block_on(async {
            let conn = mysql_async::Conn::new(opts.clone()).await?;
            let id = conn.id();
            Ok::<_, mysql_async::Error>((conn, id))
        })?;
        Ok(MysqlSession {
            rt,
            conn,
            aux_conn: None,
            connection_id,
        })
    }

    fn ensure_aux(&mut self) -> Result<()> {
        if self.aux_conn.is_some() {
            return Ok(());
        }
        // Re-derive the aux connection from the same opts as the primary.
        let opts = self.conn.opts().clone();
        let aux = self.rt.block_on(Conn::new(opts))?;
        self.aux_conn = Some(aux);
        Ok(())
    }

    fn query_values(&mut self, sql: &str) -> Result<Vec<Vec<Value>>> {
        let conn = &mut self.conn;
        let rows: Vec<mysql_async::Row> = self.rt.block_on(sql.with(()).fetch(conn))?;
        Ok(rows.into_iter().map(row_to_values).collect())
    }

    fn exec_drop(&mut self, sql: &str) -> Result<()> {
        let conn = &mut self.conn;
        self.rt.block_on(sql.ignore(conn))?;
        Ok(())
    }
}

/// `mysql_async::Row` stores its cells as `mysql_common::Value` under the
/// hood (grounded in `other_examples`' direct use of that type); match on
/// it explicitly rather than the driver's `mysql_async::Value` re-export.
fn row_to_values(row: mysql_async::Row) -> Vec<Value> {
    (0..row.len())
        .map(|i| match row.as_ref(i) {
            None | Some(mysql_common::Value::NULL) => Value::Null,
            Some(mysql_common::Value::Int(v)) => Value::Int(*v),
            Some(mysql_common::Value::UInt(v)) => Value::UInt(*v),
            Some(mysql_common::Value::Float(v)) => Value::Float(*v as f64),
            Some(mysql_common::Value::Double(v)) => Value::Float(*v),
            Some(mysql_common::Value::Bytes(v)) => Value::Bytes(v.clone()),
            _ => Value::Null,
        })
        .collect()
}

fn mysql_type_to_column_type(type_name: &str) -> ColumnType {
    let t = type_name.to_ascii_lowercase();
    if t.contains("blob") || t.contains("binary") {
        ColumnType::Binary
    } else if t.contains("geometry") || t.contains("point") || t.contains("polygon") {
        ColumnType::Spatial
    } else if t.contains("json") {
        ColumnType::Json
    } else if t.contains("int") {
        ColumnType::Integer
    } else if t.contains("float") || t.contains("double") {
        ColumnType::Float
    } else if t.contains("decimal") || t.contains("numeric") {
        ColumnType::Decimal
    } else if t.contains("date") || t.contains("time") {
        ColumnType::DateTime
    } else {
        ColumnType::String
    }
}

impl Session for MysqlSession {
    fn session_setup(&mut self, character_set: &str, utc_time_zone: bool) -> Result<()> {
        self.exec_drop("SET sql_mode = ''")?;
        self.exec_drop(&format!("SET NAMES '{}'", character_set))?;
        self.exec_drop("SET SESSION net_write_timeout = 1800")?;
        self.exec_drop("SET SESSION wait_timeout = 31536000")?;
        if utc_time_zone {
            self.exec_drop("SET time_zone = '+00:00'")?;
        }
        Ok(())
    }

    fn flush_with_read_lock(&mut self) -> Result<()> {
        self.exec_drop("FLUSH TABLES WITH READ LOCK")
    }

    fn lock_tables(&mut self, tables: &[(String, String)]) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let list: Vec<String> = tables
            .iter()
            .map(|(s, t)| format!("`{}`.`{}` READ", s, t))
            .collect();
        self.exec_drop(&format!("LOCK TABLES {}", list.join(", ")))
    }

    fn unlock_tables(&mut self) -> Result<()> {
        self.exec_drop("UNLOCK TABLES")
    }

    fn lock_instance_for_backup(&mut self) -> Result<bool> {
        match self.exec_drop("LOCK INSTANCE FOR BACKUP") {
            Ok(()) => Ok(true),
            Err(err) => {
                log::warn!("backup lock unavailable, continuing without it: {}", err);
                Ok(false)
            }
        }
    }

    fn start_consistent_snapshot(&mut self) -> Result<()> {
        self.exec_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT, READ ONLY")
    }

    fn start_transaction(&mut self) -> Result<()> {
        self.exec_drop("START TRANSACTION READ ONLY")
    }

    fn gtid_executed(&mut self) -> Result<Option<String>> {
        let rows = self.query_values("SHOW MASTER STATUS")?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().nth(4))
            .and_then(|v| match v {
                Value::Bytes(b) => String::from_utf8(b).ok(),
                Value::Text(s) => Some(s),
                _ => None,
            }))
    }

    fn list_schemas(&mut self) -> Result<Vec<String>> {
        let rows = self.query_values(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT IN ('mysql','information_schema','performance_schema','sys')",
        )?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn list_tables(&mut self, schema: &str) -> Result<Vec<String>> {
        let rows = self.query_values(&format!(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_type = 'BASE TABLE'",
            escape_literal(schema)
        ))?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn list_views(&mut self, schema: &str) -> Result<Vec<String>> {
        let rows = self.query_values(&format!(
            "SELECT table_name FROM information_schema.views WHERE table_schema = '{}'",
            escape_literal(schema)
        ))?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn list_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>> {
        let rows = self.query_values(&format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
            escape_literal(schema),
            escape_literal(table)
        ))?;
        Ok(rows
            .into_iter()
            .filter_map(|mut r| {
                if r.len() < 2 {
                    return None;
                }
                let type_name = bytes_to_string(r.pop()?)?;
                let name = bytes_to_string(r.pop()?)?;
                Some(ColumnMeta {
                    name,
                    r#type: mysql_type_to_column_type(&type_name),
                })
            })
            .collect())
    }

    fn list_indexes(&mut self, schema: &str, table: &str) -> Result<Vec<IndexMeta>> {
        let rows = self.query_values(&format!(
            "SELECT index_name, non_unique, column_name, nullable FROM information_schema.statistics \
             WHERE table_schema = '{}' AND table_name = '{}' ORDER BY index_name, seq_in_index",
            escape_literal(schema),
            escape_literal(table)
        ))?;

        let mut by_name: Vec<(String, bool, bool, Vec<String>)> = Vec::new();
        for mut r in rows {
            if r.len() < 4 {
                continue;
            }
            let nullable = bytes_to_string(r.pop().unwrap()).unwrap_or_default() != "";
            let column = match bytes_to_string(r.pop().unwrap()) {
                Some(c) => c,
                None => continue,
            };
            let non_unique = r.pop().and_then(|v| v.as_i64()).unwrap_or(1) != 0;
            let name = match bytes_to_string(r.pop().unwrap()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(entry) = by_name.iter_mut().find(|(n, ..)| *n == name) {
                entry.3.push(column);
                entry.2 = entry.2 || nullable;
            } else {
                by_name.push((name, !non_unique, nullable, vec![column]));
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, unique, nullable, columns)| IndexMeta {
                primary: name == "PRIMARY",
                unique,
                nullable,
                columns,
                name,
            })
            .collect())
    }

    fn table_status(&mut self, schema: &str, table: &str) -> Result<(u64, Option<u64>)> {
        let rows = self.query_values(&format!(
            "SHOW TABLE STATUS FROM `{}` LIKE '{}'",
            schema,
            escape_literal(table)
        ))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no table status for {}.{}", schema, table))?;
        // column order: Name, Engine, Version, Row_format, Rows, Avg_row_length, ...
        let rows_estimate = row.get(4).and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64;
        let avg_row_length = row.get(5).and_then(|v| v.as_i64()).filter(|v| *v > 0).map(|v| v as u64);
        Ok((rows_estimate, avg_row_length))
    }

    fn show_create_table(&mut self, schema: &str, table: &str) -> Result<String> {
        let rows = self.query_values(&format!("SHOW CREATE TABLE `{}`.`{}`", schema, table))?;
        let row = rows.into_iter().next().ok_or_else(|| anyhow!("no create statement for {}.{}", schema, table))?;
        row.into_iter()
            .nth(1)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE TABLE result"))
    }

    fn show_create_schema(&mut self, schema: &str) -> Result<String> {
        let rows = self.query_values(&format!("SHOW CREATE SCHEMA `{}`", schema))?;
        let row = rows.into_iter().next().ok_or_else(|| anyhow!("no create statement for {}", schema))?;
        row.into_iter()
            .nth(1)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE SCHEMA result"))
    }

    fn show_create_view(&mut self, schema: &str, view: &str) -> Result<String> {
        let rows = self.query_values(&format!("SHOW CREATE VIEW `{}`.`{}`", schema, view))?;
        let row = rows.into_iter().next().ok_or_else(|| anyhow!("no create statement for {}.{}", schema, view))?;
        row.into_iter()
            .nth(1)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE VIEW result"))
    }

    fn min_max(&mut self, schema: &str, table: &str, key_column: &str) -> Result<(Value, Value)> {
        let rows = self.query_values(&format!(
            "SELECT MIN(`{}`), MAX(`{}`) FROM `{}`.`{}`",
            key_column, key_column, schema, table
        ))?;
        let mut row = rows.into_iter().next().unwrap_or_default();
        let max = row.pop().unwrap_or(Value::Null);
        let min = row.pop().unwrap_or(Value::Null);
        Ok((min, max))
    }

    fn explain_count(&mut self, schema: &str, table: &str, where_clause: &str) -> Result<u64> {
        let rows = self.query_values(&format!(
            "EXPLAIN SELECT COUNT(*) FROM `{}`.`{}` WHERE {}",
            schema, table, where_clause
        ))?;
        // `rows` column is index 8 in classic EXPLAIN output.
        let estimate = rows
            .into_iter()
            .next()
            .and_then(|r| r.get(8).and_then(|v| v.as_i64()))
            .unwrap_or(0);
        Ok(estimate.max(0) as u64)
    }

    fn nth_key(
        &mut self,
        schema: &str,
        table: &str,
        key_column: &str,
        where_clause: &str,
        order_by: &str,
        skip: u64,
    ) -> Result<Option<Value>> {
        let rows = self.query_values(&format!(
            "SELECT `{}` FROM `{}`.`{}` WHERE {} ORDER BY {} LIMIT {}, 1",
            key_column, schema, table, where_clause, order_by, skip
        ))?;
        Ok(rows.into_iter().next().and_then(|mut r| r.pop()))
    }

    fn stream_range(
        &mut self,
        schema: &str,
        table: &str,
        columns: &[String],
        where_clause: &str,
        order_by: &str,
        sink: &mut dyn FnMut(Vec<Value>) -> Result<bool>,
    ) -> Result<u64> {
        let column_list = columns
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM `{}`.`{}` WHERE {} ORDER BY {} /* dump chunk */",
            column_list, schema, table, where_clause, order_by
        );

        let conn = &mut self.conn;
        let mut count = 0u64;
        let mut sink_err: Option<anyhow::Error> = None;
        self.rt.block_on(async {
            let mut result = sql.with(()).run(conn).await?;
            while let Some(row) = result.next().await? {
                let row: mysql_async::Row = row;
                let values = row_to_values(row);
                count += 1;
                match sink(values) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => {
                        sink_err = Some(err);
                        break;
                    }
                }
            }
            Ok::<_, mysql_async::Error>(())
        })?;
        if let Some(err) = sink_err {
            return Err(err);
        }
        Ok(count)
    }

    fn kill_query(&mut self) -> Result<()> {
        self.ensure_aux()?;
        let id = self.connection_id;
        if let Some(aux) = self.aux_conn.as_mut() {
            self.rt.block_on(format!("KILL QUERY {}", id).ignore(aux))?;
        }
        Ok(())
    }

    fn list_events(&mut self, schema: &str) -> Result<Vec<String>> {
        let rows = self.query_values(&format!(
            "SELECT event_name FROM information_schema.events WHERE event_schema = '{}'",
            escape_literal(schema)
        ))?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn show_create_event(&mut self, schema: &str, event: &str) -> Result<String> {
        let rows = self.query_values(&format!("SHOW CREATE EVENT `{}`.`{}`", schema, event))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no create statement for event {}.{}", schema, event))?;
        // column order: Event, sql_mode, time_zone, Create Event, ...
        row.into_iter()
            .nth(3)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE EVENT result"))
    }

    fn list_routines(&mut self, schema: &str) -> Result<Vec<RoutineMeta>> {
        let rows = self.query_values(&format!(
            "SELECT routine_name, routine_type FROM information_schema.routines WHERE routine_schema = '{}'",
            escape_literal(schema)
        ))?;
        Ok(rows
            .into_iter()
            .filter_map(|mut r| {
                if r.len() < 2 {
                    return None;
                }
                let kind_str = bytes_to_string(r.pop()?)?;
                let name = bytes_to_string(r.pop()?)?;
                let kind = if kind_str.eq_ignore_ascii_case("FUNCTION") {
                    RoutineKind::Function
                } else {
                    RoutineKind::Procedure
                };
                Some(RoutineMeta { name, kind })
            })
            .collect())
    }

    fn show_create_routine(&mut self, schema: &str, routine: &RoutineMeta) -> Result<String> {
        let keyword = match routine.kind {
            RoutineKind::Function => "FUNCTION",
            RoutineKind::Procedure => "PROCEDURE",
        };
        let rows = self.query_values(&format!(
            "SHOW CREATE {} `{}`.`{}`",
            keyword, schema, routine.name
        ))?;
        let row = rows.into_iter().next().ok_or_else(|| {
            anyhow!("no create statement for routine {}.{}", schema, routine.name)
        })?;
        // column order: {Function,Procedure}, sql_mode, Create {Function,Procedure}, ...
        row.into_iter()
            .nth(2)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE ROUTINE result"))
    }

    fn list_triggers(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self.query_values(&format!(
            "SELECT trigger_name FROM information_schema.triggers \
             WHERE trigger_schema = '{}' AND event_object_table = '{}'",
            escape_literal(schema),
            escape_literal(table)
        ))?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn show_create_trigger(&mut self, schema: &str, trigger: &str) -> Result<String> {
        let rows = self.query_values(&format!("SHOW CREATE TRIGGER `{}`.`{}`", schema, trigger))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no create statement for trigger {}.{}", schema, trigger))?;
        // column order: Trigger, sql_mode, SQL Original Statement, ...
        row.into_iter()
            .nth(2)
            .and_then(value_to_string)
            .ok_or_else(|| anyhow!("malformed SHOW CREATE TRIGGER result"))
    }

    fn list_users(&mut self) -> Result<Vec<String>> {
        let rows = self.query_values(
            "SELECT CONCAT(user, '@', host) FROM mysql.user \
             WHERE user NOT IN ('mysql.sys','mysql.session','mysql.infoschema')",
        )?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn show_grants_for_user(&mut self, user: &str) -> Result<Vec<String>> {
        let (name, host) = user.split_once('@').unwrap_or((user, "%"));
        let rows = self.query_values(&format!(
            "SHOW GRANTS FOR '{}'@'{}'",
            escape_literal(name),
            escape_literal(host)
        ))?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }

    fn current_user_grants(&mut self) -> Result<Vec<String>> {
        let rows = self.query_values("SHOW GRANTS FOR CURRENT_USER()")?;
        Ok(rows.into_iter().filter_map(first_string).collect())
    }
}

fn first_string(mut row: Vec<Value>) -> Option<String> {
    row.pop().and_then(value_to_string)
}

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::Bytes(b) => String::from_utf8(b).ok(),
        Value::Text(s) => Some(s),
        _ => None,
    }
}

fn bytes_to_string(v: Value) -> Option<String> {
    value_to_string(v)
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
