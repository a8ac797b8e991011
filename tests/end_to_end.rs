//! Exercises the whole dump pipeline end to end against `FakeSession`
//! fixtures (spec §8 "Testable properties"): row coverage without
//! duplication, a complete manifest set, accurate byte accounting, and the
//! per-table row-limit/extra-condition knobs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use shell_dumper::config::{BinaryEncoding, Compression, Dialect, DumpOptions, TableFilter};
use shell_dumper::dump::manifest::{DoneManifest, SchemaManifest, StartManifest, TableManifest};
use shell_dumper::dump::SessionFactory;
use shell_dumper::session::fake::{FakeInstance, FakeInstanceHandle, FakeSchema, FakeTable};
use shell_dumper::session::{ColumnMeta, ColumnType, IndexMeta, Session, Value};

fn int_pk_table(row_count: i64) -> FakeTable {
    FakeTable {
        columns: vec![
            ColumnMeta {
                name: "id".into(),
                r#type: ColumnType::Integer,
            },
            ColumnMeta {
                name: "qty".into(),
                r#type: ColumnType::Integer,
            },
        ],
        indexes: vec![IndexMeta {
            name: "PRIMARY".into(),
            primary: true,
            unique: true,
            nullable: false,
            columns: vec!["id".into()],
        }],
        rows: (0..row_count).map(|i| vec![Value::Int(i), Value::Int(i % 7)]).collect(),
        create_sql: "CREATE TABLE t (id INT PRIMARY KEY, qty INT)".into(),
    }
}

fn instance(schema_name: &str, tables: Vec<(&str, FakeTable)>) -> FakeInstanceHandle {
    let mut schema = FakeSchema::default();
    schema.create_sql = format!("CREATE DATABASE `{}`", schema_name);
    for (name, table) in tables {
        schema.tables.insert(name.to_string(), table);
    }
    let mut fixture = FakeInstance::default();
    fixture.schemas.insert(schema_name.to_string(), schema);
    FakeInstanceHandle::new(fixture)
}

fn factory(handle: FakeInstanceHandle) -> SessionFactory {
    Arc::new(move || -> Result<Box<dyn Session>> {
        Ok(Box::new(shell_dumper::session::FakeSession::new(handle.clone())))
    })
}

fn base_options(output: &Path) -> DumpOptions {
    DumpOptions {
        output_url: output.to_path_buf(),
        threads: 3,
        dialect: Dialect::Tsv,
        compression: Compression::None,
        binary_encoding: BinaryEncoding::Hex,
        row_index: true,
        ..DumpOptions::default()
    }
}

fn chunk_files_for(dir: &Path, schema_basename: &str, table_basename: &str) -> Vec<std::path::PathBuf> {
    let prefix = format!("{}@{}@", schema_basename, table_basename);
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn produces_complete_manifest_set_with_accurate_byte_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance(
        "shop_a",
        vec![("items", int_pk_table(50)), ("orders", int_pk_table(1000))],
    );
    let mut options = base_options(dir.path());
    let summary = shell_dumper::run(&mut options, factory(handle)).unwrap();

    assert_eq!(summary.schema_count, 1);
    assert_eq!(summary.table_count, 2);
    assert!(summary.raw_bytes > 0);
    assert_eq!(summary.raw_bytes, summary.compressed_bytes); // uncompressed
    assert!(summary.throughput_bytes_per_sec >= 0.0);

    let start: StartManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.json")).unwrap()).unwrap();
    let schema_basename = start.schema_basenames.get("shop_a").unwrap().clone();

    let schema_manifest: SchemaManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}.json", schema_basename))).unwrap(),
    )
    .unwrap();
    let tables: HashSet<String> = schema_manifest.tables.iter().cloned().collect();
    let expected: HashSet<String> = ["items", "orders"].iter().map(|s| s.to_string()).collect();
    assert_eq!(tables, expected);

    let items_basename = schema_manifest.table_basenames.get("items").unwrap().clone();
    let orders_basename = schema_manifest.table_basenames.get("orders").unwrap().clone();

    let items_descriptor: TableManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}@.json", items_basename))).unwrap(),
    )
    .unwrap();
    assert!(items_descriptor.chunking);
    assert_eq!(items_descriptor.primary_index.as_deref(), Some("id"));
    assert_eq!(items_descriptor.columns, vec!["id".to_string(), "qty".to_string()]);

    let done: DoneManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.done.json")).unwrap()).unwrap();
    assert_eq!(done.data_bytes, summary.raw_bytes);
    assert!(done.table_data_bytes["shop_a"]["items"] > 0);
    assert!(done.table_data_bytes["shop_a"]["orders"] > 0);
    let total_from_files: u64 = done.file_bytes_written.values().sum();
    assert_eq!(total_from_files, summary.compressed_bytes);

    let items_chunks = chunk_files_for(dir.path(), &schema_basename, &items_basename);
    let orders_chunks = chunk_files_for(dir.path(), &schema_basename, &orders_basename);
    assert!(!items_chunks.is_empty());
    assert!(orders_chunks.len() > 1, "1000 rows at the default chunk floor should split into several chunks");
}

#[test]
fn json_dialect_each_chunk_is_independently_valid_and_covers_all_rows_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance("shop_b", vec![("orders", int_pk_table(1200))]);
    let mut options = base_options(dir.path());
    options.dialect = Dialect::Json;
    let summary = shell_dumper::run(&mut options, factory(handle)).unwrap();
    assert!(summary.raw_bytes > 0);

    let start: StartManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.json")).unwrap()).unwrap();
    let schema_basename = start.schema_basenames.get("shop_b").unwrap().clone();
    let schema_manifest: SchemaManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}.json", schema_basename))).unwrap(),
    )
    .unwrap();
    let orders_basename = schema_manifest.table_basenames.get("orders").unwrap().clone();
    let chunks = chunk_files_for(dir.path(), &schema_basename, &orders_basename);
    assert!(chunks.len() > 1, "expected multiple chunks to exercise per-chunk postambles");

    let mut seen_ids: Vec<i64> = Vec::new();
    for chunk in chunks.iter().filter(|p| p.extension().and_then(|e| e.to_str()) != Some("idx")) {
        let text = std::fs::read_to_string(chunk).unwrap();
        // Each chunk file is a standalone JSON array -- not a fragment of one
        // shared document -- so every chunk must parse on its own, including
        // every non-last one.
        let rows: Vec<Vec<serde_json::Value>> =
            serde_json::from_str(&text).unwrap_or_else(|err| panic!("{:?} is not a complete JSON array: {}", chunk, err));
        for row in rows {
            seen_ids.push(row[0].as_str().unwrap().parse().unwrap());
        }
    }

    seen_ids.sort_unstable();
    let expected: Vec<i64> = (0..1200).collect();
    assert_eq!(seen_ids, expected, "every row must appear in exactly one chunk");
}

#[test]
fn empty_table_gets_descriptor_with_chunking_false_and_no_data_files() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance("shop_c", vec![("empties", int_pk_table(0))]);
    let mut options = base_options(dir.path());
    shell_dumper::run(&mut options, factory(handle)).unwrap();

    let start: StartManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.json")).unwrap()).unwrap();
    let schema_basename = start.schema_basenames.get("shop_c").unwrap().clone();
    let schema_manifest: SchemaManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}.json", schema_basename))).unwrap(),
    )
    .unwrap();
    let table_basename = schema_manifest.table_basenames.get("empties").unwrap().clone();

    let descriptor: TableManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}@.json", table_basename))).unwrap(),
    )
    .unwrap();
    assert!(!descriptor.chunking);
    assert!(chunk_files_for(dir.path(), &schema_basename, &table_basename).is_empty());
}

#[test]
fn no_dumping_marker_files_remain_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance("shop_d", vec![("orders", int_pk_table(800))]);
    let mut options = base_options(dir.path());
    shell_dumper::run(&mut options, factory(handle)).unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".dumping"))
        .collect();
    assert!(leftovers.is_empty(), "found orphaned .dumping files: {:?}", leftovers);
}

#[test]
fn table_filter_limit_caps_total_rows_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance("shop_e", vec![("orders", int_pk_table(500))]);
    let mut options = base_options(dir.path());
    options.table_filters.insert(
        "shop_e.orders".to_string(),
        TableFilter {
            extra_condition: None,
            limit: Some(37),
        },
    );
    shell_dumper::run(&mut options, factory(handle)).unwrap();

    let start: StartManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.json")).unwrap()).unwrap();
    let schema_basename = start.schema_basenames.get("shop_e").unwrap().clone();
    let schema_manifest: SchemaManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}.json", schema_basename))).unwrap(),
    )
    .unwrap();
    let table_basename = schema_manifest.table_basenames.get("orders").unwrap().clone();

    let mut total_rows = 0usize;
    for chunk in chunk_files_for(dir.path(), &schema_basename, &table_basename) {
        if chunk.extension().and_then(|e| e.to_str()) == Some("idx") {
            continue;
        }
        let text = std::fs::read_to_string(chunk).unwrap();
        total_rows += text.lines().filter(|l| !l.is_empty()).count();
    }
    assert_eq!(total_rows, 37);
}

#[test]
fn table_filter_extra_condition_restricts_rows() {
    let dir = tempfile::tempdir().unwrap();
    let handle = instance("shop_f", vec![("orders", int_pk_table(140))]);
    let mut options = base_options(dir.path());
    options.table_filters.insert(
        "shop_f.orders".to_string(),
        TableFilter {
            extra_condition: Some("`qty` BETWEEN 0 AND 0".to_string()),
            limit: None,
        },
    );
    shell_dumper::run(&mut options, factory(handle)).unwrap();

    let start: StartManifest =
        serde_json::from_slice(&std::fs::read(dir.path().join("@.json")).unwrap()).unwrap();
    let schema_basename = start.schema_basenames.get("shop_f").unwrap().clone();
    let schema_manifest: SchemaManifest = serde_json::from_slice(
        &std::fs::read(dir.path().join(format!("{}.json", schema_basename))).unwrap(),
    )
    .unwrap();
    let table_basename = schema_manifest.table_basenames.get("orders").unwrap().clone();

    let mut total_rows = 0usize;
    for chunk in chunk_files_for(dir.path(), &schema_basename, &table_basename) {
        if chunk.extension().and_then(|e| e.to_str()) == Some("idx") {
            continue;
        }
        let text = std::fs::read_to_string(chunk).unwrap();
        total_rows += text.lines().filter(|l| !l.is_empty()).count();
    }
    // qty = id % 7, so qty == 0 for id in {0, 7, 14, ...} -- 20 of the 140 rows.
    assert_eq!(total_rows, 20);
}
