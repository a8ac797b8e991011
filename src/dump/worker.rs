//! Worker: a thread-per-unit-of-parallelism task executor (spec §4.7, §5).
//!
//! Each Worker owns one `Session` and one `RateLimiter`. Suspension points
//! are only I/O: database round-trips, file writes, the limiter's sleep, and
//! the queue's condition wait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::config::DumpOptions;
use crate::session::{ColumnMeta, ColumnType, Session};

use super::chunker;
use super::dialect;
use super::manifest;
use super::queue::TaskQueue;
use super::rate_limiter::RateLimiter;
use super::schema_dump;
use super::task::Task;
use super::writer::Writer;

const PROGRESS_INTERVAL_ROWS: u64 = 2000;

/// Set by any Worker that hits an unrecoverable error; polled by every
/// Worker at task boundaries and inside the row-streaming loop, and by the
/// Coordinator after `join` (spec §5 "Cancellation and timeouts").
pub type Interrupt = Arc<AtomicBool>;

pub struct WorkerOutcome {
    pub error: Option<anyhow::Error>,
}

/// State shared by every Worker thread for the duration of one dump:
/// the task queue, where chunk files land, and the outstanding-chunking
/// counter that decides when to publish the final shutdown tasks (spec
/// §4.8 DUMPING: "the chunking-task counter reaches zero ... publish N
/// shutdown tasks").
pub struct WorkerContext {
    pub queue: Arc<TaskQueue>,
    pub output_dir: PathBuf,
    pub schema_basenames: HashMap<String, String>,
    pub table_basenames: Mutex<HashMap<(String, String), String>>,
    pub outstanding_chunk_tasks: Arc<AtomicU64>,
    pub worker_count: usize,
    /// One countdown per table with a `TableFilter::limit` in effect, shared
    /// across that table's chunks (SPEC_FULL §3).
    pub table_row_limits: Mutex<HashMap<(String, String), Arc<AtomicI64>>>,
    /// Manifest accumulators (spec §6 "@.done.json"): bytes counters are
    /// atomic, per-table and per-file byte maps use a mutex.
    pub total_data_bytes: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub table_data_bytes: Mutex<HashMap<(String, String), u64>>,
    pub file_bytes_written: Mutex<HashMap<String, u64>>,
    /// Accounts in scope for `--users` (spec §4.9 "user list"), resolved
    /// once before Workers start and shared read-only for the rest of the
    /// dump, the same way `schema_basenames` is.
    pub users: Vec<String>,
}

impl WorkerContext {
    /// Memoized per `(schema, table)` so repeat lookups (e.g. the
    /// Coordinator's schema manifest and a Worker's later chunk files) agree
    /// on the same basename — `basename::encode` itself is not idempotent
    /// across distinct calls for the same name.
    pub(crate) fn table_basename(&self, schema: &str, table: &str) -> String {
        let key = (schema.to_string(), table.to_string());
        let mut map = self.table_basenames.lock().unwrap();
        map.entry(key)
            .or_insert_with(|| super::basename::encode(table))
            .clone()
    }

    fn row_limit_counter(&self, schema: &str, table: &str, limit: u64) -> Arc<AtomicI64> {
        let key = (schema.to_string(), table.to_string());
        let mut map = self.table_row_limits.lock().unwrap();
        map.entry(key)
            .or_insert_with(|| Arc::new(AtomicI64::new(limit as i64)))
            .clone()
    }

    fn schema_basename(&self, schema: &str) -> String {
        self.schema_basenames
            .get(schema)
            .cloned()
            .unwrap_or_else(|| schema.to_string())
    }

    /// Folds one closed chunk file's byte counts into the manifest
    /// accumulators (spec §6 "@.done.json": aggregate `dataBytes`,
    /// per-schema per-table `dataBytes`, per-file `bytesWritten`).
    fn record_result(&self, schema: &str, table: &str, file_name: &str, result: &super::writer::WriterResult) {
        self.total_data_bytes.fetch_add(result.data_bytes, Ordering::Relaxed);
        self.total_bytes_written.fetch_add(result.bytes_written, Ordering::Relaxed);
        *self
            .table_data_bytes
            .lock()
            .unwrap()
            .entry((schema.to_string(), table.to_string()))
            .or_insert(0) += result.data_bytes;
        self.file_bytes_written
            .lock()
            .unwrap()
            .insert(file_name.to_string(), result.bytes_written);
    }
}

/// Run one Worker's task loop to completion. `job` identifies this dump for
/// the SQL comment trailer on ranged queries (spec §4.5 step 4).
pub fn run(
    job: &str,
    session: &mut dyn Session,
    ctx: &WorkerContext,
    interrupt: &Interrupt,
    options: &DumpOptions,
) -> WorkerOutcome {
    match run_inner(job, session, ctx, interrupt, options) {
        Ok(()) => WorkerOutcome { error: None },
        Err(err) => {
            interrupt.store(true, Ordering::SeqCst);
            WorkerOutcome { error: Some(err) }
        }
    }
}

fn run_inner(
    job: &str,
    session: &mut dyn Session,
    ctx: &WorkerContext,
    interrupt: &Interrupt,
    options: &DumpOptions,
) -> Result<()> {
    session.session_setup(&options.character_set, true)?;
    if options.consistent {
        session.start_consistent_snapshot()?;
    } else {
        session.start_transaction()?;
    }

    let mut limiter = RateLimiter::new(None);

    loop {
        if interrupt.load(Ordering::SeqCst) {
            break;
        }
        let task = match ctx.queue.pop() {
            Some(t) => t,
            None => break,
        };

        execute_task(job, session, ctx, &mut limiter, task, options)?;

        if interrupt.load(Ordering::SeqCst) {
            break;
        }
    }

    Ok(())
}

fn execute_task(
    job: &str,
    session: &mut dyn Session,
    ctx: &WorkerContext,
    limiter: &mut RateLimiter,
    task: Task,
    options: &DumpOptions,
) -> Result<()> {
    match task {
        Task::DumpSchemaDDL { schema } => {
            let create = session.show_create_schema(&schema)?;
            let mut ddl = schema_dump::dump_schema_ddl(&schema, &create, options);
            // Spec §6: the schema's `.sql` file carries its events and
            // routines too, when requested, alongside the schema's own DDL.
            if options.dump_events {
                for event in session.list_events(&schema)? {
                    let create = session.show_create_event(&schema, &event)?;
                    ddl.buffer.push('\n');
                    ddl.buffer.push_str(&schema_dump::frame_create(
                        "EVENT",
                        &format!("`{}`.`{}`", schema, event),
                        &create,
                    ));
                }
            }
            if options.dump_routines {
                for routine in session.list_routines(&schema)? {
                    let keyword = match routine.kind {
                        crate::session::RoutineKind::Function => "FUNCTION",
                        crate::session::RoutineKind::Procedure => "PROCEDURE",
                    };
                    let create = session.show_create_routine(&schema, &routine)?;
                    ddl.buffer.push('\n');
                    ddl.buffer.push_str(&schema_dump::frame_create(
                        keyword,
                        &format!("`{}`.`{}`", schema, routine.name),
                        &create,
                    ));
                }
            }
            report_issues(&ddl.issues)?;
            let basename = ctx.schema_basename(&schema);
            let path = ctx.output_dir.join(format!("{}.sql", basename));
            crate::tools::atomic_write(&path, ddl.buffer.as_bytes())?;
            Ok(())
        }
        Task::DumpTableDDL { schema, table } => {
            let create = session.show_create_table(&schema, &table)?;
            let ddl = schema_dump::dump_table_ddl(&schema, &table, &create, options);
            report_issues(&ddl.issues)?;
            let table_basename = ctx.table_basename(&schema, &table);
            let path = ctx.output_dir.join(format!("{}.sql", table_basename));
            crate::tools::atomic_write(&path, ddl.buffer.as_bytes())?;
            Ok(())
        }
        Task::DumpViewDDL { schema, view } => {
            let create = session.show_create_view(&schema, &view)?;
            let ddl = schema_dump::dump_view_ddl(&schema, &view, &create, options);
            report_issues(&ddl.issues)?;
            let basename = ctx.table_basename(&schema, &view);
            let path = ctx.output_dir.join(format!("{}.sql", basename));
            crate::tools::atomic_write(&path, ddl.buffer.as_bytes())?;
            Ok(())
        }
        Task::DumpTriggerDDL { schema, table } => {
            let mut buffer = String::new();
            for trigger in session.list_triggers(&schema, &table)? {
                let create = session.show_create_trigger(&schema, &trigger)?;
                buffer.push_str(&schema_dump::frame_create(
                    "TRIGGER",
                    &format!("`{}`.`{}`", schema, trigger),
                    &create,
                ));
            }
            let table_basename = ctx.table_basename(&schema, &table);
            let path = ctx.output_dir.join(format!("{}@.triggers.sql", table_basename));
            crate::tools::atomic_write(&path, buffer.as_bytes())?;
            Ok(())
        }
        Task::DumpUsersSql => {
            let mut grants = Vec::new();
            for user in &ctx.users {
                grants.extend(session.show_grants_for_user(user)?);
            }
            let path = ctx.output_dir.join("@.users.sql");
            manifest::write_users_sql(&path, &grants)
        }
        Task::ChunkTable { schema, table } => {
            let result = chunk_table(job, session, ctx, &schema, &table, options);
            let remaining = ctx.outstanding_chunk_tasks.fetch_sub(1, Ordering::SeqCst) - 1;
            if remaining == 0 {
                ctx.queue.shutdown(ctx.worker_count);
            }
            result
        }
        Task::DumpRange {
            schema,
            table,
            id,
            range,
            writer,
            index_file: _,
            row_limit,
        } => {
            let extra_condition = options
                .table_filters
                .get(&format!("{}.{}", schema, table))
                .and_then(|f| f.extra_condition.clone());
            dump_range(
                job,
                session,
                ctx,
                limiter,
                &schema,
                &table,
                id,
                &range,
                &writer,
                extra_condition.as_deref(),
                row_limit.as_deref(),
            )
        }
    }
}

fn chunk_table(
    job: &str,
    session: &mut dyn Session,
    ctx: &WorkerContext,
    schema: &str,
    table: &str,
    options: &DumpOptions,
) -> Result<()> {
    let columns = session.list_columns(schema, table)?;
    let indexes = session.list_indexes(schema, table)?;
    let (rows, avg_len) = session.table_status(schema, table)?;
    let key_column = indexes
        .iter()
        .find(|i| i.primary)
        .or_else(|| indexes.iter().find(|i| i.unique && !i.nullable))
        .or_else(|| indexes.first())
        .and_then(|i| i.columns.first().cloned());
    let key_type = key_column
        .as_ref()
        .and_then(|name| columns.iter().find(|c| &c.name == name))
        .map(|c| c.r#type)
        .unwrap_or(ColumnType::String);

    let filter = options.table_filters.get(&format!("{}.{}", schema, table));
    let extra_condition = filter.and_then(|f| f.extra_condition.clone());

    let plan = chunker::plan(
        session,
        schema,
        table,
        key_column.as_deref(),
        key_type,
        rows,
        avg_len,
        options.bytes_per_chunk,
        extra_condition.as_deref(),
    )?;

    let triggers = if options.dump_triggers {
        session.list_triggers(schema, table)?
    } else {
        Vec::new()
    };

    let schema_basename = ctx.schema_basename(schema);
    let table_basename = ctx.table_basename(schema, table);
    write_table_descriptor(
        ctx,
        options,
        schema,
        table,
        &table_basename,
        &columns,
        key_column.as_deref(),
        !plan.ranges.is_empty(),
        &triggers,
    )?;

    if plan.ranges.is_empty() {
        log::info!("{}.{}: no rows, no data tasks", schema, table);
        return Ok(());
    }

    let row_limit = filter
        .and_then(|f| f.limit)
        .map(|limit| ctx.row_limit_counter(schema, table, limit));

    let last_chunk_id = plan.ranges.len() - 1;
    for (chunk_id, range) in plan.ranges.into_iter().enumerate() {
        // The final range carries the doubled-separator tail marker (spec
        // §6, §8 invariant: "for every chunk file `<base>@k.<ext>`, either
        // `@k+1.<ext>` exists or `@@k.<ext>` exists") so a loader can detect
        // the end of a table's chunk sequence without listing the directory.
        let separator = if chunk_id == last_chunk_id { "@@" } else { "@" };
        let file_name = format!(
            "{}@{}{}{}.{}",
            schema_basename,
            table_basename,
            separator,
            chunk_id,
            dialect::extension(options.dialect)
        );
        let path = ctx.output_dir.join(file_name);
        let mut writer = Writer::open(
            path,
            options.compression,
            options.dialect,
            options.binary_encoding,
            options.row_index,
        )?;
        writer.write_preamble(
            &columns
                .iter()
                .map(|c| (c.name.clone(), c.r#type))
                .collect::<Vec<_>>(),
        )?;

        let task = Task::DumpRange {
            schema: schema.to_string(),
            table: table.to_string(),
            id: chunk_id as u64,
            range,
            writer: Arc::new(Mutex::new(writer)),
            index_file: None,
            row_limit: row_limit.clone(),
        };
        ctx.queue.push(task).ok();
    }

    let _ = job;
    Ok(())
}

fn dump_range(
    job: &str,
    session: &mut dyn Session,
    ctx: &WorkerContext,
    limiter: &mut RateLimiter,
    schema: &str,
    table: &str,
    id: u64,
    range: &super::range::Range,
    writer: &Arc<Mutex<Writer>>,
    extra_condition: Option<&str>,
    row_limit: Option<&AtomicI64>,
) -> Result<()> {
    let columns = session.list_columns(schema, table)?;
    let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    let column_types: Vec<ColumnType> = columns.iter().map(|c| c.r#type).collect();
    let key_column = column_names.first().cloned().unwrap_or_default();
    let where_clause = range.where_clause(&key_column, job, table, id, extra_condition);
    let order_by = format!("`{}`", key_column);

    let mut row_count_since_progress = 0u64;
    let mut bytes_since_report = 0u64;

    session.stream_range(
        schema,
        table,
        &column_names,
        &where_clause,
        &order_by,
        &mut |row| {
            if let Some(counter) = row_limit {
                if counter.fetch_sub(1, Ordering::SeqCst) <= 0 {
                    counter.fetch_add(1, Ordering::SeqCst);
                    return Ok(false);
                }
            }
            let mut w = writer.lock().unwrap();
            let before = w.result().data_bytes;
            w.write_row(&row, &column_types)?;
            bytes_since_report += w.result().data_bytes - before;
            row_count_since_progress += 1;
            if row_count_since_progress >= PROGRESS_INTERVAL_ROWS {
                log::debug!("{}.{} chunk {}: {} rows written", schema, table, id, row_count_since_progress);
                limiter.report(bytes_since_report);
                row_count_since_progress = 0;
                bytes_since_report = 0;
            }
            Ok(true)
        },
    )?;

    // Every chunk owns an independent Writer/output file (spec §3 "Writer
    // ... belongs to at most one task at a time"), so each one gets its own
    // postamble and close, not just the table's last chunk.
    let mut w = writer.lock().unwrap();
    w.write_postamble()?;
    let result = w.close()?;
    let file_name = w
        .final_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    drop(w);
    ctx.record_result(schema, table, &file_name, &result);
    Ok(())
}

/// Emits `<tableBasename>@.json`, the per-table descriptor the loader reads
/// to reassemble a table's chunk files (spec §6). Written for every table,
/// including empty ones with `chunking: false` (spec §9 "Empty table").
#[allow(clippy::too_many_arguments)]
fn write_table_descriptor(
    ctx: &WorkerContext,
    options: &DumpOptions,
    schema: &str,
    table: &str,
    table_basename: &str,
    columns: &[ColumnMeta],
    key_column: Option<&str>,
    chunking: bool,
    triggers: &[String],
) -> Result<()> {
    // Spec §4.9: the map is the column's HEX/BASE64 *inverse* — the SQL
    // decode function a loader invokes verbatim, not the forward encoding's
    // name.
    let decode_fn = match options.binary_encoding {
        crate::config::BinaryEncoding::Hex => "UNHEX",
        crate::config::BinaryEncoding::Base64 => "FROM_BASE64",
    };
    let decode_columns = columns
        .iter()
        .filter(|c| c.r#type.is_encoding_unsafe())
        .map(|c| (c.name.clone(), decode_fn.to_string()))
        .collect();

    let descriptor = manifest::TableManifest {
        schema: schema.to_string(),
        table: table.to_string(),
        columns: columns.iter().map(|c| c.name.clone()).collect(),
        decode_columns,
        primary_index: key_column.map(|s| s.to_string()),
        compression: format!("{:?}", options.compression).to_lowercase(),
        character_set: options.character_set.clone(),
        dialect: format!("{:?}", options.dialect).to_lowercase(),
        triggers: triggers.to_vec(),
        histograms: Vec::new(),
        includes_data: options.dump_data,
        includes_ddl: options.dump_ddl,
        extension: dialect::extension(options.dialect).to_string(),
        chunking,
    };
    let path = ctx.output_dir.join(format!("{}@.json", table_basename));
    manifest::write_table(&path, &descriptor)
}

fn report_issues(issues: &[schema_dump::Issue]) -> Result<()> {
    for issue in issues {
        match issue.status {
            schema_dump::IssueStatus::NeedsCompatibilityOption => {
                return Err(anyhow::anyhow!(issue.description.clone()));
            }
            schema_dump::IssueStatus::FixManually => {
                log::warn!("manual fix required: {}", issue.description);
            }
            schema_dump::IssueStatus::Fixed => {
                log::info!("compatibility rewrite applied: {}", issue.description);
            }
        }
    }
    Ok(())
}
