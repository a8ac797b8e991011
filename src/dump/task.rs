//! Task data model (spec §3 "Task") and the priority level it is posted at.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use super::range::Range;
use super::writer::Writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

pub enum Task {
    DumpSchemaDDL {
        schema: String,
    },
    DumpTableDDL {
        schema: String,
        table: String,
    },
    DumpViewDDL {
        schema: String,
        view: String,
    },
    /// One file per table, covering every trigger on it (spec §6
    /// `<tableBasename>@.triggers.sql`).
    DumpTriggerDDL {
        schema: String,
        table: String,
    },
    /// `@.users.sql`: one task, queries every dumped account's grants.
    DumpUsersSql,
    ChunkTable {
        schema: String,
        table: String,
    },
    DumpRange {
        schema: String,
        table: String,
        id: u64,
        range: Range,
        writer: Arc<std::sync::Mutex<Writer>>,
        index_file: Option<std::path::PathBuf>,
        /// Shared countdown for `TableFilter::limit` (SPEC_FULL §3); `None`
        /// when the table has no row cap. Every chunk of the same table
        /// shares one counter so the cap applies to the table, not the chunk.
        row_limit: Option<Arc<AtomicI64>>,
    },
}

impl Task {
    pub fn priority(&self) -> Priority {
        match self {
            Task::DumpSchemaDDL { .. }
            | Task::DumpTableDDL { .. }
            | Task::DumpViewDDL { .. }
            | Task::DumpTriggerDDL { .. }
            | Task::DumpUsersSql => Priority::High,
            Task::ChunkTable { .. } => Priority::Medium,
            Task::DumpRange { .. } => Priority::Low,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Task::DumpSchemaDDL { schema } => format!("DumpSchemaDDL({})", schema),
            Task::DumpTableDDL { schema, table } => format!("DumpTableDDL({}.{})", schema, table),
            Task::DumpViewDDL { schema, view } => format!("DumpViewDDL({}.{})", schema, view),
            Task::DumpTriggerDDL { schema, table } => format!("DumpTriggerDDL({}.{})", schema, table),
            Task::DumpUsersSql => "DumpUsersSql".to_string(),
            Task::ChunkTable { schema, table } => format!("ChunkTable({}.{})", schema, table),
            Task::DumpRange {
                schema, table, id, ..
            } => format!("DumpRange({}.{}, #{})", schema, table, id),
        }
    }
}
