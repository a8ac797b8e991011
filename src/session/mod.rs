//! The database collaborator.
//!
//! `spec.md` §6 treats snapshot control, metadata introspection and streaming
//! reads as an abstract contract with a fixed shape ("Database operations
//! consumed (abstract)"). This module gives that contract a concrete trait so
//! the rest of the crate (cache, chunker, worker, coordinator) can be written
//! and tested without a live server.

mod mysql;
pub use mysql::MysqlSession;

pub mod fake;
pub use fake::FakeSession;

use anyhow::Result;

/// One row of a result set, as loosely-typed column values. Concrete
/// sessions (`MysqlSession`) map driver-native values onto this; the writer
/// and chunker only ever see `Value`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A column's SQL type, coarsened to the degree the Chunker and Writer
/// actually need to know about (spec §3 "TableInfo").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Decimal,
    Binary,
    Spatial,
    Json,
    DateTime,
}

impl ColumnType {
    /// Binary-like types the Writer must hex/base64-encode in text output
    /// (spec §4.3 "Encoding-unsafe columns are identified by type").
    pub fn is_encoding_unsafe(self) -> bool {
        matches!(self, ColumnType::Binary | ColumnType::Spatial | ColumnType::Json)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ColumnType::Integer)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub r#type: ColumnType,
}

#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub name: String,
    pub primary: bool,
    pub unique: bool,
    pub nullable: bool,
    pub columns: Vec<String>,
}

/// Whether a routine is a stored function or a stored procedure (spec §4.4
/// "routines").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineKind {
    Function,
    Procedure,
}

#[derive(Debug, Clone)]
pub struct RoutineMeta {
    pub name: String,
    pub kind: RoutineKind,
}

/// One open, possibly-transactional connection to the source instance. Each
/// `Worker` owns exactly one; the `Coordinator` owns one more for session
/// setup, locking and the auxiliary kill-query channel (spec §5).
pub trait Session: Send {
    /// Run session setup: clear `sql_mode`, set character set, generous
    /// timeouts, UTC time zone if requested (spec §4.7).
    fn session_setup(&mut self, character_set: &str, utc_time_zone: bool) -> Result<()>;

    /// `FLUSH TABLES WITH READ LOCK` (or engine equivalent). Spec §4.8 step 2.
    fn flush_with_read_lock(&mut self) -> Result<()>;

    /// Fallback table-level lock path when the strong lock is denied.
    fn lock_tables(&mut self, tables: &[(String, String)]) -> Result<()>;

    fn unlock_tables(&mut self) -> Result<()>;

    /// Best-effort backup lock for DDL stability; caller treats failure as
    /// non-fatal (spec §4.8 step 3 / §7 recovered-locally (b)).
    fn lock_instance_for_backup(&mut self) -> Result<bool>;

    /// Begin a transaction that observes a consistent point-in-time snapshot.
    fn start_consistent_snapshot(&mut self) -> Result<()>;

    /// Begin a plain (non-consistent) transaction.
    fn start_transaction(&mut self) -> Result<()>;

    fn gtid_executed(&mut self) -> Result<Option<String>>;

    fn list_schemas(&mut self) -> Result<Vec<String>>;
    fn list_tables(&mut self, schema: &str) -> Result<Vec<String>>;
    fn list_views(&mut self, schema: &str) -> Result<Vec<String>>;
    fn list_columns(&mut self, schema: &str, table: &str) -> Result<Vec<ColumnMeta>>;
    fn list_indexes(&mut self, schema: &str, table: &str) -> Result<Vec<IndexMeta>>;

    /// `(row_count_estimate, avg_row_length_estimate)`, `None` if statistics
    /// are absent (spec §4.5 default row size fallback).
    fn table_status(&mut self, schema: &str, table: &str) -> Result<(u64, Option<u64>)>;

    fn show_create_table(&mut self, schema: &str, table: &str) -> Result<String>;
    fn show_create_schema(&mut self, schema: &str) -> Result<String>;
    fn show_create_view(&mut self, schema: &str, view: &str) -> Result<String>;

    /// `MIN(key), MAX(key)` on the chunking column, as raw `Value`s.
    fn min_max(&mut self, schema: &str, table: &str, key_column: &str) -> Result<(Value, Value)>;

    /// `EXPLAIN SELECT COUNT(*) FROM t WHERE key BETWEEN a AND b` —
    /// returns the planner's row estimate (spec §4.5 step 2).
    fn explain_count(&mut self, schema: &str, table: &str, where_clause: &str) -> Result<u64>;

    /// `SELECT key FROM t WHERE <where_clause> ORDER BY index LIMIT skip, 1`
    /// used by LIMIT-walking (spec §4.5 step 3) to find each chunk's upper
    /// boundary starting after the previous one.
    fn nth_key(
        &mut self,
        schema: &str,
        table: &str,
        key_column: &str,
        where_clause: &str,
        order_by: &str,
        skip: u64,
    ) -> Result<Option<Value>>;

    /// Stream a range of rows. `sink` is called once per row; returning
    /// `Ok(false)` stops the stream early (used on interrupt).
    fn stream_range(
        &mut self,
        schema: &str,
        table: &str,
        columns: &[String],
        where_clause: &str,
        order_by: &str,
        sink: &mut dyn FnMut(Vec<Value>) -> Result<bool>,
    ) -> Result<u64>;

    /// Best-effort `KILL QUERY` issued from an auxiliary connection on
    /// cancellation (spec §5 "Cancellation and timeouts").
    fn kill_query(&mut self) -> Result<()>;

    /// Event names defined in a schema (spec §4.3 "events"). Empty unless
    /// `--events` is requested.
    fn list_events(&mut self, schema: &str) -> Result<Vec<String>>;
    fn show_create_event(&mut self, schema: &str, event: &str) -> Result<String>;

    /// Stored functions and procedures in a schema (spec §4.3 "routines").
    fn list_routines(&mut self, schema: &str) -> Result<Vec<RoutineMeta>>;
    fn show_create_routine(&mut self, schema: &str, routine: &RoutineMeta) -> Result<String>;

    /// Triggers attached to a single table (spec §4.3 "triggers").
    fn list_triggers(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;
    fn show_create_trigger(&mut self, schema: &str, trigger: &str) -> Result<String>;

    /// Accounts as `user@host` (spec §4.3 "users"). Empty unless
    /// `--users` is requested.
    fn list_users(&mut self) -> Result<Vec<String>>;
    fn show_grants_for_user(&mut self, user: &str) -> Result<Vec<String>>;

    /// The dumping session's own grants, used for the EVENT/TRIGGER
    /// privilege probe in VALIDATED (spec §4.8 step 5).
    fn current_user_grants(&mut self) -> Result<Vec<String>>;
}
