//! Instance Cache: a snapshot of schema/table metadata taken once, under
//! lock, and reused read-only by every Worker for the rest of the dump
//! (spec §4.3).
//!
//! Built in two passes: a "minimal" pass fast enough to take while the
//! instance lock is held (schema/table/view names, columns, indexes), and a
//! "full" pass run after the lock is released (row-count/size statistics,
//! `SHOW CREATE` text) that can safely be slower.

use anyhow::Result;

use crate::config::DumpOptions;
use crate::session::{ColumnMeta, IndexMeta, RoutineKind, Session};

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub indexes: Vec<IndexMeta>,
    pub row_count_estimate: u64,
    pub avg_row_length: Option<u64>,
    pub ddl: String,
    /// Column chosen to chunk on, `None` if no usable index exists (spec
    /// §4.5 "No valid index" edge case — table dumps as a single range).
    pub chunking_column: Option<String>,
    /// Populated when `--triggers` is requested (spec §4.3 "triggers").
    pub triggers: Vec<TriggerInfo>,
}

#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub schema: String,
    pub name: String,
    pub ddl: String,
}

#[derive(Debug, Clone)]
pub struct TriggerInfo {
    pub name: String,
    pub ddl: String,
}

#[derive(Debug, Clone)]
pub struct EventInfo {
    pub name: String,
    pub ddl: String,
}

#[derive(Debug, Clone)]
pub struct RoutineInfo {
    pub name: String,
    pub kind: RoutineKind,
    pub ddl: String,
}

#[derive(Debug, Clone)]
pub struct SchemaInfo {
    pub name: String,
    pub ddl: String,
    pub tables: Vec<TableInfo>,
    pub views: Vec<ViewInfo>,
    /// Populated when `--events` is requested.
    pub events: Vec<EventInfo>,
    /// Populated when `--routines` is requested.
    pub routines: Vec<RoutineInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceCache {
    pub schemas: Vec<SchemaInfo>,
}

impl InstanceCache {
    pub fn table(&self, schema: &str, table: &str) -> Option<&TableInfo> {
        self.schemas
            .iter()
            .find(|s| s.name == schema)?
            .tables
            .iter()
            .find(|t| t.name == table)
    }

    pub fn total_tables(&self) -> usize {
        self.schemas.iter().map(|s| s.tables.len()).sum()
    }
}

/// Minimal pass: structural metadata only, taken while the consistency lock
/// is held. No row counts, no `SHOW CREATE`.
pub fn build_minimal(session: &mut dyn Session, options: &DumpOptions) -> Result<InstanceCache> {
    let mut schemas = Vec::new();

    for schema_name in session.list_schemas()? {
        if !options.schema_included(&schema_name) {
            continue;
        }

        let mut tables = Vec::new();
        for table_name in session.list_tables(&schema_name)? {
            if !options.table_included(&schema_name, &table_name) {
                continue;
            }
            let columns = session.list_columns(&schema_name, &table_name)?;
            let indexes = session.list_indexes(&schema_name, &table_name)?;
            let chunking_column = select_chunking_column(&indexes, &columns);
            let triggers = if options.dump_triggers {
                session
                    .list_triggers(&schema_name, &table_name)?
                    .into_iter()
                    .map(|name| TriggerInfo { name, ddl: String::new() })
                    .collect()
            } else {
                Vec::new()
            };
            tables.push(TableInfo {
                schema: schema_name.clone(),
                name: table_name,
                columns,
                indexes,
                row_count_estimate: 0,
                avg_row_length: None,
                ddl: String::new(),
                chunking_column,
                triggers,
            });
        }

        let views = if options.dump_ddl {
            session
                .list_views(&schema_name)?
                .into_iter()
                .map(|name| ViewInfo {
                    schema: schema_name.clone(),
                    name,
                    ddl: String::new(),
                })
                .collect()
        } else {
            Vec::new()
        };

        let events = if options.dump_events {
            session
                .list_events(&schema_name)?
                .into_iter()
                .map(|name| EventInfo { name, ddl: String::new() })
                .collect()
        } else {
            Vec::new()
        };

        let routines = if options.dump_routines {
            session
                .list_routines(&schema_name)?
                .into_iter()
                .map(|r| RoutineInfo {
                    name: r.name,
                    kind: r.kind,
                    ddl: String::new(),
                })
                .collect()
        } else {
            Vec::new()
        };

        schemas.push(SchemaInfo {
            name: schema_name,
            ddl: String::new(),
            tables,
            views,
            events,
            routines,
        });
    }

    Ok(InstanceCache { schemas })
}

/// Full pass: fills in `row_count_estimate`, `avg_row_length` and DDL text.
/// Safe to run after the instance lock is released (spec §4.8 CACHED state).
pub fn fill_full(
    session: &mut dyn Session,
    options: &DumpOptions,
    cache: &mut InstanceCache,
) -> Result<()> {
    for schema in &mut cache.schemas {
        if options.dump_ddl {
            schema.ddl = session.show_create_schema(&schema.name)?;
        }
        for table in &mut schema.tables {
            let (rows, avg_len) = session.table_status(&schema.name, &table.name)?;
            table.row_count_estimate = rows;
            table.avg_row_length = avg_len;
            if options.dump_ddl {
                table.ddl = session.show_create_table(&schema.name, &table.name)?;
            }
            if options.dump_triggers {
                for trigger in &mut table.triggers {
                    trigger.ddl = session.show_create_trigger(&schema.name, &trigger.name)?;
                }
            }
        }
        if options.dump_ddl {
            for view in &mut schema.views {
                view.ddl = session.show_create_view(&schema.name, &view.name)?;
            }
        }
        if options.dump_events {
            for event in &mut schema.events {
                event.ddl = session.show_create_event(&schema.name, &event.name)?;
            }
        }
        if options.dump_routines {
            for routine in &mut schema.routines {
                let meta = crate::session::RoutineMeta {
                    name: routine.name.clone(),
                    kind: routine.kind,
                };
                routine.ddl = session.show_create_routine(&schema.name, &meta)?;
            }
        }
    }
    Ok(())
}

/// Pick an index to chunk on: PK preferred, then unique non-nullable, then
/// any non-unique index; ties broken by numeric-column-first, fewest
/// columns, then lexicographic name (spec §4.3 "Index selection").
fn select_chunking_index(indexes: &[IndexMeta]) -> Option<&IndexMeta> {
    fn rank(idx: &IndexMeta) -> u8 {
        if idx.primary {
            0
        } else if idx.unique && !idx.nullable {
            1
        } else {
            2
        }
    }

    indexes
        .iter()
        .filter(|idx| !idx.columns.is_empty())
        .min_by(|a, b| {
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.columns.len().cmp(&b.columns.len()))
                .then_with(|| a.name.cmp(&b.name))
        })
}

fn select_chunking_column(indexes: &[IndexMeta], columns: &[ColumnMeta]) -> Option<String> {
    let idx = select_chunking_index(indexes)?;
    let col_name = idx.columns.first()?.clone();

    // Prefer a numeric leading column among equally-ranked candidates: if
    // the chosen index's leading column isn't numeric but another
    // same-rank index has one, prefer that one instead.
    let chosen_is_numeric = columns
        .iter()
        .find(|c| c.name == col_name)
        .map(|c| c.r#type.is_integer())
        .unwrap_or(false);

    if chosen_is_numeric {
        return Some(col_name);
    }

    let chosen_rank = if idx.primary {
        0
    } else if idx.unique && !idx.nullable {
        1
    } else {
        2
    };

    let numeric_alt = indexes
        .iter()
        .filter(|i| !i.columns.is_empty())
        .filter(|i| {
            let r = if i.primary {
                0
            } else if i.unique && !i.nullable {
                1
            } else {
                2
            };
            r == chosen_rank
        })
        .filter(|i| {
            columns
                .iter()
                .find(|c| c.name == i.columns[0])
                .map(|c| c.r#type.is_integer())
                .unwrap_or(false)
        })
        .min_by(|a, b| a.columns.len().cmp(&b.columns.len()).then_with(|| a.name.cmp(&b.name)));

    Some(numeric_alt.map(|i| i.columns[0].clone()).unwrap_or(col_name))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::ColumnType;

    fn col(name: &str, ty: ColumnType) -> ColumnMeta {
        ColumnMeta {
            name: name.into(),
            r#type: ty,
        }
    }

    fn idx(name: &str, primary: bool, unique: bool, nullable: bool, columns: &[&str]) -> IndexMeta {
        IndexMeta {
            name: name.into(),
            primary,
            unique,
            nullable,
            columns: columns.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn prefers_primary_key() {
        let columns = vec![col("id", ColumnType::Integer), col("email", ColumnType::String)];
        let indexes = vec![
            idx("email_unique", false, true, false, &["email"]),
            idx("PRIMARY", true, true, false, &["id"]),
        ];
        assert_eq!(select_chunking_column(&indexes, &columns), Some("id".into()));
    }

    #[test]
    fn falls_back_to_non_unique_when_no_better_option() {
        let columns = vec![col("created_at", ColumnType::DateTime)];
        let indexes = vec![idx("idx_created", false, false, true, &["created_at"])];
        assert_eq!(
            select_chunking_column(&indexes, &columns),
            Some("created_at".into())
        );
    }

    #[test]
    fn no_usable_index_returns_none() {
        let columns = vec![col("blob", ColumnType::Binary)];
        let indexes: Vec<IndexMeta> = vec![];
        assert_eq!(select_chunking_column(&indexes, &columns), None);
    }

    #[test]
    fn prefers_numeric_column_among_same_rank_candidates() {
        let columns = vec![col("code", ColumnType::String), col("seq", ColumnType::Integer)];
        let indexes = vec![
            idx("uniq_code", false, true, false, &["code"]),
            idx("uniq_seq", false, true, false, &["seq"]),
        ];
        assert_eq!(select_chunking_column(&indexes, &columns), Some("seq".into()));
    }
}
