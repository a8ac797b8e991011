//! Per-file framing, compression and accounting (spec §4.1 "Writer").
//!
//! Grounded in `backup/data_blob.rs` and `backup/data_blob_reader.rs`'s
//! layered, state-dispatched stream wrapping (there: CRC + optional zstd +
//! optional encryption over a `Read`; here: byte counting + optional
//! compression over a `Write`).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{BinaryEncoding, Compression, Dialect, DialectOptions};
use crate::session::{ColumnType, Value};

use super::dialect::encode_field;

/// Every ~1 MiB of data bytes, per spec §4.1.
const INDEX_INTERVAL: u64 = 1024 * 1024;

struct CountingWriter<W> {
    inner: W,
    count: Arc<AtomicU64>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

enum Sink {
    Plain(BufWriter<CountingWriter<File>>),
    Gzip(flate2::write::GzEncoder<BufWriter<CountingWriter<File>>>),
    Zstd(zstd::stream::write::Encoder<BufWriter<CountingWriter<File>>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
            Sink::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
            Sink::Zstd(w) => w.flush(),
        }
    }
}

/// `{bytesWritten, dataBytes}` returned once a Writer is closed (spec §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterResult {
    pub bytes_written: u64,
    pub data_bytes: u64,
    pub rows: u64,
}

pub struct Writer {
    final_path: PathBuf,
    dumping_path: PathBuf,
    sink: Option<Sink>,
    idx_file: Option<File>,
    final_path_had_index: bool,
    bytes_written: Arc<AtomicU64>,
    data_bytes: u64,
    rows: u64,
    last_index_mark: u64,
    dialect: Dialect,
    dialect_opts: DialectOptions,
    binary_encoding: BinaryEncoding,
    column_encodings: Vec<(String, Option<BinaryEncoding>)>,
    closed: bool,
}

impl Writer {
    /// Open `final_path` for writing, actually creating `final_path` with a
    /// trailing `.dumping` extension until `close()` succeeds (spec §6
    /// "In-progress marker").
    pub fn open(
        final_path: PathBuf,
        compression: Compression,
        dialect: Dialect,
        binary_encoding: BinaryEncoding,
        with_index: bool,
    ) -> Result<Self> {
        let mut dumping_path = final_path.clone();
        append_extension(&mut dumping_path, "dumping");

        let file = File::create(&dumping_path)
            .with_context(|| format!("failed to create {:?}", dumping_path))?;
        let bytes_written = Arc::new(AtomicU64::new(0));
        let counting = CountingWriter {
            inner: file,
            count: bytes_written.clone(),
        };
        let buffered = BufWriter::with_capacity(256 * 1024, counting);

        let sink = match compression {
            Compression::None => Sink::Plain(buffered),
            Compression::Gzip => Sink::Gzip(flate2::write::GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            )),
            Compression::Zstd => Sink::Zstd(
                zstd::stream::write::Encoder::new(buffered, 1)
                    .context("failed to start zstd encoder")?,
            ),
        };

        let idx_file = if with_index {
            let mut idx_path = final_path.clone();
            append_extension(&mut idx_path, "idx");
            append_extension(&mut idx_path, "dumping");
            Some(
                File::create(&idx_path)
                    .with_context(|| format!("failed to create {:?}", idx_path))?,
            )
        } else {
            None
        };

        Ok(Writer {
            final_path,
            dumping_path,
            sink: Some(sink),
            final_path_had_index: idx_file.is_some(),
            idx_file,
            bytes_written,
            data_bytes: 0,
            rows: 0,
            last_index_mark: 0,
            dialect,
            dialect_opts: DialectOptions::for_dialect(dialect),
            binary_encoding,
            column_encodings: Vec::new(),
            closed: false,
        })
    }

    /// Records the chosen per-column encoding (for the loader's decode map,
    /// spec §4.9 table descriptor) and writes any dialect-level framing
    /// prefix (e.g. the opening `[` for JSON).
    pub fn write_preamble(&mut self, columns: &[(String, ColumnType)]) -> Result<()> {
        self.column_encodings = columns
            .iter()
            .map(|(name, ty)| {
                let enc = if ty.is_encoding_unsafe() {
                    Some(self.binary_encoding)
                } else {
                    None
                };
                (name.clone(), enc)
            })
            .collect();

        if self.dialect == Dialect::Json {
            self.write_raw(b"[\n")?;
        }
        Ok(())
    }

    pub fn column_encodings(&self) -> &[(String, Option<BinaryEncoding>)] {
        &self.column_encodings
    }

    pub fn write_row(&mut self, row: &[Value], column_types: &[ColumnType]) -> Result<()> {
        let mut line = String::new();
        if self.dialect == Dialect::Json {
            if self.rows > 0 {
                line.push_str(",\n");
            }
            line.push('[');
        }
        for (i, (value, ty)) in row.iter().zip(column_types.iter()).enumerate() {
            if i > 0 {
                line.push_str(&self.dialect_opts.field_terminator);
            }
            line.push_str(&encode_field(
                value,
                *ty,
                self.dialect,
                &self.dialect_opts,
                self.binary_encoding,
            ));
        }
        if self.dialect == Dialect::Json {
            line.push(']');
        } else {
            line.push_str(&self.dialect_opts.line_terminator);
        }

        self.write_raw(line.as_bytes())?;
        self.rows += 1;
        self.maybe_emit_index_entry()?;
        Ok(())
    }

    pub fn write_postamble(&mut self) -> Result<()> {
        if self.dialect == Dialect::Json {
            self.write_raw(b"\n]\n")?;
        }
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.data_bytes += bytes.len() as u64;
        self.sink
            .as_mut()
            .expect("writer used after close")
            .write_all(bytes)?;
        Ok(())
    }

    fn maybe_emit_index_entry(&mut self) -> Result<()> {
        if self.idx_file.is_none() {
            return Ok(());
        }
        if self.data_bytes - self.last_index_mark < INDEX_INTERVAL {
            return Ok(());
        }
        self.last_index_mark = self.data_bytes;
        self.write_index_offset(self.data_bytes)
    }

    fn write_index_offset(&mut self, offset: u64) -> Result<()> {
        if let Some(idx) = self.idx_file.as_mut() {
            idx.write_all(&offset.to_be_bytes())?;
        }
        Ok(())
    }

    /// Idempotent; the second call is a no-op (spec §4.1 "Closing is idempotent").
    pub fn close(&mut self) -> Result<WriterResult> {
        if self.closed {
            return Ok(self.result());
        }

        let had_index = self.idx_file.is_some();

        // Index law: the final entry is always the total data-byte length,
        // even if it falls short of the last ~1 MiB mark.
        if had_index {
            self.write_index_offset(self.data_bytes)?;
        }

        if let Some(mut sink) = self.sink.take() {
            match &mut sink {
                Sink::Plain(w) => w.flush()?,
                Sink::Gzip(_) => {
                    if let Sink::Gzip(w) = sink {
                        w.finish()?;
                    }
                }
                Sink::Zstd(_) => {
                    if let Sink::Zstd(w) = sink {
                        w.finish()?;
                    }
                }
            }
        }
        if let Some(mut idx) = self.idx_file.take() {
            idx.flush()?;
        }

        std::fs::rename(&self.dumping_path, &self.final_path)
            .with_context(|| format!("failed to finalize {:?}", self.final_path))?;

        if had_index {
            let mut idx_final = self.final_path.clone();
            append_extension(&mut idx_final, "idx");
            let mut idx_dumping = idx_final.clone();
            append_extension(&mut idx_dumping, "dumping");
            std::fs::rename(&idx_dumping, &idx_final)
                .with_context(|| format!("failed to finalize {:?}", idx_final))?;
        }

        self.closed = true;
        Ok(self.result())
    }

    /// Path of the `.idx` sidecar, once finalized (`None` before `close()`
    /// or when no index was requested).
    pub fn index_path(&self) -> Option<PathBuf> {
        if self.closed && self.final_path_had_index {
            let mut p = self.final_path.clone();
            append_extension(&mut p, "idx");
            Some(p)
        } else {
            None
        }
    }

    pub fn result(&self) -> WriterResult {
        WriterResult {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            data_bytes: self.data_bytes,
            rows: self.rows,
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

fn append_extension(path: &mut PathBuf, ext: &str) {
    let name = path
        .file_name()
        .map(|n| format!("{}.{}", n.to_string_lossy(), ext))
        .unwrap_or_else(|| ext.to_string());
    path.set_file_name(name);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{BinaryEncoding, Compression, Dialect};

    #[test]
    fn writes_rows_and_renames_from_dumping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t@0.tsv");
        let mut w = Writer::open(path.clone(), Compression::None, Dialect::Tsv, BinaryEncoding::Hex, true).unwrap();
        w.write_preamble(&[("id".into(), ColumnType::Integer)]).unwrap();
        for i in 0..5 {
            w.write_row(&[Value::Int(i)], &[ColumnType::Integer]).unwrap();
        }
        w.write_postamble().unwrap();
        let result = w.close().unwrap();

        assert!(path.exists());
        let dumping_path = dir.path().join("t@0.tsv.dumping");
        assert!(!dumping_path.exists());
        assert_eq!(result.rows, 5);
        assert_eq!(result.data_bytes, result.bytes_written); // uncompressed

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 5);
    }

    #[test]
    fn index_last_entry_equals_total_data_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t@0.tsv");
        let mut w = Writer::open(path.clone(), Compression::None, Dialect::Tsv, BinaryEncoding::Hex, true).unwrap();
        w.write_preamble(&[("id".into(), ColumnType::Integer)]).unwrap();
        for i in 0..1000 {
            w.write_row(&[Value::Int(i)], &[ColumnType::Integer]).unwrap();
        }
        let result = w.close().unwrap();

        let idx_path = path.with_file_name(format!("{}.idx", path.file_name().unwrap().to_string_lossy()));
        let bytes = std::fs::read(&idx_path).unwrap();
        assert_eq!(bytes.len() % 8, 0);
        let last = u64::from_be_bytes(bytes[bytes.len() - 8..].try_into().unwrap());
        assert_eq!(last, result.data_bytes);

        // strictly increasing, all <= total
        let mut prev = 0u64;
        for chunk in bytes.chunks(8) {
            let v = u64::from_be_bytes(chunk.try_into().unwrap());
            assert!(v > prev || prev == 0);
            assert!(v <= result.data_bytes);
            prev = v;
        }
    }

    #[test]
    fn gzip_compresses_smaller_than_uncompressed_for_repetitive_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t@0.tsv");
        let mut w = Writer::open(path.clone(), Compression::Gzip, Dialect::Tsv, BinaryEncoding::Hex, false).unwrap();
        w.write_preamble(&[("id".into(), ColumnType::Integer)]).unwrap();
        for _ in 0..10_000 {
            w.write_row(&[Value::Int(42)], &[ColumnType::Integer]).unwrap();
        }
        let result = w.close().unwrap();
        assert!(result.bytes_written < result.data_bytes);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t@0.tsv");
        let mut w = Writer::open(path, Compression::None, Dialect::Tsv, BinaryEncoding::Hex, false).unwrap();
        w.write_preamble(&[]).unwrap();
        let first = w.close().unwrap();
        let second = w.close().unwrap();
        assert_eq!(first.data_bytes, second.data_bytes);
    }
}
