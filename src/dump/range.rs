//! `Range` and SQL rendering for chunk boundaries (spec §3 "Range").

use crate::session::{ColumnType, Value};

/// A `{begin, end}` pair in the chunking column's type, rendered in a
/// type-preserving way: quoted for strings/decimals, bare for integers.
#[derive(Debug, Clone)]
pub struct Range {
    pub key_type: ColumnType,
    pub begin: Value,
    pub end: Value,
    /// Set on exactly the first range of a table (spec §3 invariants).
    pub include_nulls: bool,
}

impl Range {
    pub fn whole_table() -> Self {
        Range {
            key_type: ColumnType::Integer,
            begin: Value::Null,
            end: Value::Null,
            include_nulls: true,
        }
    }

    pub fn is_whole_table(&self) -> bool {
        self.begin.is_null() && self.end.is_null()
    }

    fn literal(&self, v: &Value) -> String {
        match v {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", escape(s)),
            Value::Bytes(b) => format!("'{}'", escape(&String::from_utf8_lossy(b))),
        }
    }

    /// Render the `WHERE` fragment a Worker's `SELECT` uses, including a
    /// trailing SQL comment identifying the job/table/chunk (spec §4.5
    /// step 4, used to correlate process-list entries with chunks).
    /// `extra_condition` is the table's `TableFilter::extra_condition`
    /// (SPEC_FULL §3), ANDed in when present.
    pub fn where_clause(
        &self,
        key_column: &str,
        job: &str,
        table: &str,
        chunk_id: u64,
        extra_condition: Option<&str>,
    ) -> String {
        let mut clause = if self.is_whole_table() {
            "1=1".to_string()
        } else {
            let mut c = format!(
                "`{}` BETWEEN {} AND {}",
                key_column,
                self.literal(&self.begin),
                self.literal(&self.end)
            );
            if self.include_nulls {
                c = format!("({} OR `{}` IS NULL)", c, key_column);
            }
            c
        };
        if let Some(extra) = extra_condition {
            clause = format!("({}) AND ({})", clause, extra);
        }
        format!("{} /* {} {} chunk {} */", clause, job, table, chunk_id)
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integer_literals_are_bare() {
        let r = Range {
            key_type: ColumnType::Integer,
            begin: Value::Int(1),
            end: Value::Int(100),
            include_nulls: false,
        };
        assert_eq!(
            r.where_clause("id", "job1", "t", 0, None),
            "`id` BETWEEN 1 AND 100 /* job1 t chunk 0 */"
        );
    }

    #[test]
    fn string_literals_are_quoted() {
        let r = Range {
            key_type: ColumnType::String,
            begin: Value::Text("a".into()),
            end: Value::Text("m".into()),
            include_nulls: true,
        };
        assert_eq!(
            r.where_clause("name", "job1", "t", 2, None),
            "(`name` BETWEEN 'a' AND 'm' OR `name` IS NULL) /* job1 t chunk 2 */"
        );
    }

    #[test]
    fn whole_table_has_trivial_predicate() {
        let r = Range::whole_table();
        assert_eq!(r.where_clause("id", "job1", "t", 0, None), "1=1 /* job1 t chunk 0 */");
    }

    #[test]
    fn extra_condition_is_anded_in() {
        let r = Range {
            key_type: ColumnType::Integer,
            begin: Value::Int(1),
            end: Value::Int(100),
            include_nulls: false,
        };
        assert_eq!(
            r.where_clause("id", "job1", "t", 0, Some("`active` = 1")),
            "(`id` BETWEEN 1 AND 100) AND (`active` = 1) /* job1 t chunk 0 */"
        );
    }
}
