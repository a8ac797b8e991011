//! Job configuration: the immutable, read-only-after-construction input to a
//! dump (spec §3 "Dump job").

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DumpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Csv,
    Tsv,
    Json,
    /// Free-form custom framing; `field_terminator`/`line_terminator` on
    /// [`DialectOptions`] take effect only for this variant.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialectOptions {
    pub field_terminator: String,
    pub line_terminator: String,
    pub enclosing_char: Option<char>,
    pub escape_char: Option<char>,
}

impl DialectOptions {
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Csv => DialectOptions {
                field_terminator: ",".into(),
                line_terminator: "\n".into(),
                enclosing_char: Some('"'),
                escape_char: Some('\\'),
            },
            Dialect::Tsv => DialectOptions {
                field_terminator: "\t".into(),
                line_terminator: "\n".into(),
                enclosing_char: None,
                escape_char: Some('\\'),
            },
            Dialect::Json => DialectOptions {
                field_terminator: ",".into(),
                line_terminator: "\n".into(),
                enclosing_char: None,
                escape_char: None,
            },
            Dialect::Custom => DialectOptions {
                field_terminator: "\x01".into(),
                line_terminator: "\x02".into(),
                enclosing_char: None,
                escape_char: None,
            },
        }
    }
}

/// How encoding-unsafe (binary-like) column values are rendered in text
/// output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryEncoding {
    Hex,
    Base64,
}

/// Inclusion/exclusion filter plus the two additive knobs from
/// SPEC_FULL.md §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableFilter {
    pub extra_condition: Option<String>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpOptions {
    pub output_url: PathBuf,
    pub threads: usize,
    pub bytes_per_chunk: u64,
    pub row_index: bool,
    pub compression: Compression,
    pub dialect: Dialect,
    pub character_set: String,
    pub consistent: bool,

    pub dump_ddl: bool,
    pub dump_data: bool,
    pub dump_users: bool,
    pub dump_events: bool,
    pub dump_routines: bool,
    pub dump_triggers: bool,

    pub include_schemas: HashSet<String>,
    pub exclude_schemas: HashSet<String>,
    pub include_tables: HashSet<String>,
    pub exclude_tables: HashSet<String>,
    pub include_users: HashSet<String>,

    pub compatibility_target: Option<String>,
    pub binary_encoding: BinaryEncoding,

    /// Validate the plan and report counts without writing anything (SPEC_FULL §3).
    pub dry_run: bool,
    #[serde(default)]
    pub table_filters: std::collections::HashMap<String, TableFilter>,
}

/// Sub-floor `bytes_per_chunk` values make the chunker's refinement loop
/// thrash without bound (SPEC_FULL §3); clamp and warn instead of failing.
pub const MIN_BYTES_PER_CHUNK: u64 = 64 * 1024;

impl Default for DumpOptions {
    fn default() -> Self {
        DumpOptions {
            output_url: PathBuf::from("."),
            threads: 4,
            bytes_per_chunk: 64 * 1024 * 1024,
            row_index: true,
            compression: Compression::Zstd,
            dialect: Dialect::Tsv,
            character_set: "utf8mb4".into(),
            consistent: true,
            dump_ddl: true,
            dump_data: true,
            dump_users: false,
            dump_events: false,
            dump_routines: false,
            dump_triggers: false,
            include_schemas: HashSet::new(),
            exclude_schemas: HashSet::new(),
            include_tables: HashSet::new(),
            exclude_tables: HashSet::new(),
            include_users: HashSet::new(),
            compatibility_target: None,
            binary_encoding: BinaryEncoding::Hex,
            dry_run: false,
            table_filters: Default::default(),
        }
    }
}

impl DumpOptions {
    /// Validate option combinations that would otherwise fail deep inside
    /// the Coordinator's state machine. Fails before `INIT` (spec §7).
    pub fn validate(&mut self) -> Result<(), DumpError> {
        if self.threads == 0 {
            return Err(DumpError::InvalidConfig("threads must be at least 1".into()));
        }
        if !self.include_schemas.is_empty()
            && self
                .include_schemas
                .iter()
                .any(|s| self.exclude_schemas.contains(s))
        {
            return Err(DumpError::InvalidConfig(
                "a schema cannot be both included and excluded".into(),
            ));
        }
        if !self.dump_ddl && !self.dump_data {
            return Err(DumpError::InvalidConfig(
                "at least one of dump_ddl / dump_data must be set".into(),
            ));
        }
        let clamped = num_traits::clamp(self.bytes_per_chunk, MIN_BYTES_PER_CHUNK, u64::MAX);
        if clamped != self.bytes_per_chunk {
            log::warn!(
                "bytes_per_chunk {} below floor {}, clamping",
                self.bytes_per_chunk,
                MIN_BYTES_PER_CHUNK
            );
            self.bytes_per_chunk = clamped;
        }
        Ok(())
    }

    pub fn schema_included(&self, schema: &str) -> bool {
        if self.exclude_schemas.contains(schema) {
            return false;
        }
        self.include_schemas.is_empty() || self.include_schemas.contains(schema)
    }

    pub fn table_included(&self, schema: &str, table: &str) -> bool {
        if !self.schema_included(schema) {
            return false;
        }
        let qualified = format!("{}.{}", schema, table);
        if self.exclude_tables.contains(&qualified) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.contains(&qualified)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_zero_threads() {
        let mut opts = DumpOptions {
            threads: 0,
            ..DumpOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn clamps_tiny_chunk_size() {
        let mut opts = DumpOptions {
            bytes_per_chunk: 10,
            ..DumpOptions::default()
        };
        opts.validate().unwrap();
        assert_eq!(opts.bytes_per_chunk, MIN_BYTES_PER_CHUNK);
    }

    #[test]
    fn schema_inclusion_exclusion() {
        let mut opts = DumpOptions::default();
        opts.exclude_schemas.insert("mysql".into());
        assert!(!opts.schema_included("mysql"));
        assert!(opts.schema_included("shop"));
    }
}
