//! Structured JSON descriptors written alongside the dumped data (spec §4.9).
//!
//! The manifest is written last; its presence on disk certifies that the
//! dump completed (spec §5 "Ordering guarantees").

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub user: String,
    pub host: String,
    pub server: String,
    pub version: String,
}

/// `@.json`, written before any data or DDL task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartManifest {
    pub dumper: String,
    pub version: String,
    pub schemas: Vec<String>,
    pub schema_basenames: HashMap<String, String>,
    pub users: Vec<String>,
    pub default_character_set: String,
    pub time_zone_utc: bool,
    pub bytes_per_chunk: u64,
    pub server: ServerIdentity,
    pub gtid_executed: Option<String>,
    pub gtid_executed_inconsistent: bool,
    pub consistent: bool,
    pub compatibility: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// `@.done.json`, written once all Workers have joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneManifest {
    pub end_time: DateTime<Utc>,
    pub data_bytes: u64,
    pub table_data_bytes: HashMap<String, HashMap<String, u64>>,
    pub file_bytes_written: HashMap<String, u64>,
}

/// `<schemaBasename>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaManifest {
    pub includes_ddl: bool,
    pub includes_views_ddl: bool,
    pub includes_data: bool,
    pub tables: Vec<String>,
    pub views: Vec<String>,
    pub events: Vec<String>,
    pub functions: Vec<String>,
    pub procedures: Vec<String>,
    pub table_basenames: HashMap<String, String>,
}

/// `<tableBasename>@.json`, consumed by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableManifest {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub decode_columns: HashMap<String, String>,
    pub primary_index: Option<String>,
    pub compression: String,
    pub character_set: String,
    pub dialect: String,
    pub triggers: Vec<String>,
    pub histograms: Vec<String>,
    pub includes_data: bool,
    pub includes_ddl: bool,
    pub extension: String,
    pub chunking: bool,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).context("failed to serialize manifest")?;
    atomic_write(path, &body)
}

pub fn write_start(path: &Path, manifest: &StartManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn write_done(path: &Path, manifest: &DoneManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn write_schema(path: &Path, manifest: &SchemaManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn write_table(path: &Path, manifest: &TableManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn write_users_sql(path: &Path, grants: &[String]) -> Result<()> {
    let mut body = String::new();
    for grant in grants {
        body.push_str(grant);
        if !grant.trim_end().ends_with(';') {
            body.push(';');
        }
        body.push('\n');
    }
    atomic_write(path, body.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_manifest_round_trips_through_json() {
        let manifest = StartManifest {
            dumper: "shell-dumper".into(),
            version: "0.1.0".into(),
            schemas: vec!["shop".into()],
            schema_basenames: HashMap::new(),
            users: vec![],
            default_character_set: "utf8mb4".into(),
            time_zone_utc: true,
            bytes_per_chunk: 64 * 1024 * 1024,
            server: ServerIdentity {
                user: "root".into(),
                host: "localhost".into(),
                server: "mysqld".into(),
                version: "8.0.34".into(),
            },
            gtid_executed: None,
            gtid_executed_inconsistent: false,
            consistent: true,
            compatibility: None,
            start_time: "2026-07-27T00:00:00Z".parse().unwrap(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("@.json");
        write_start(&path, &manifest).unwrap();

        let read_back: StartManifest =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read_back.schemas, manifest.schemas);
    }

    #[test]
    fn users_sql_appends_missing_semicolons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("@.users.sql");
        write_users_sql(&path, &["GRANT ALL ON *.* TO 'a'@'%'".into()]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "GRANT ALL ON *.* TO 'a'@'%';\n");
    }
}
