//! Append-only segment files.
//!
//! One file per mapping per run that changed it, named
//! `<mapping>-<RFC3339 UTC timestamp>.csv`. The first row is the schema
//! header (key names, value names, `delete`); every other row carries key
//! cells, value cells and an empty or `-` trailer. Rows with the `-` trailer
//! are tombstones and their value cells are left empty.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::store::codec::Tuple;
use crate::store::schema::MappingSchema;

pub const DELETE_MARKER: &str = "-";
const SUFFIX: &str = ".csv";

/// One decoded segment row. `value` is `None` for tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRow {
    pub key: Tuple,
    pub value: Option<Tuple>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
}

pub fn file_name(mapping: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{mapping}-{}{SUFFIX}",
        timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Timestamp embedded in `file_name`, if it is a segment of `mapping`.
pub fn parse_file_name(mapping: &str, file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name
        .strip_prefix(mapping)?
        .strip_prefix('-')?
        .strip_suffix(SUFFIX)?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// All segments of `mapping` in `dir`, oldest first.
pub fn list(dir: &Path, mapping: &str) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(timestamp) = parse_file_name(mapping, &name) {
            segments.push(SegmentFile {
                path: entry.path(),
                timestamp,
            });
        }
    }
    segments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.path.cmp(&b.path)));
    Ok(segments)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ImportError {
    ImportError::MappingCorrupt {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

pub fn read(path: &Path, schema: &MappingSchema) -> Result<Vec<SegmentRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| corrupt(path, e.to_string()))?;

    let expected = schema.header();
    let header = reader
        .headers()
        .map_err(|e| corrupt(path, e.to_string()))?
        .clone();
    if !header.iter().eq(expected.iter().copied()) {
        return Err(corrupt(
            path,
            format!(
                "header [{}] does not match schema [{}]",
                header.iter().collect::<Vec<_>>().join(","),
                expected.join(",")
            ),
        ));
    }

    let key_len = schema.key.len();
    let value_len = schema.value.len();
    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| corrupt(path, e.to_string()))?;
        let cells: Vec<&str> = record.iter().collect();
        let line = idx + 2;
        if cells.len() != key_len + value_len + 1 {
            return Err(corrupt(path, format!("line {line}: wrong number of columns")));
        }
        let key = Tuple::decode(&cells[..key_len], schema.key)
            .map_err(|e| corrupt(path, format!("line {line}: {e}")))?;
        let value = if cells[key_len + value_len] == DELETE_MARKER {
            None
        } else {
            let value = Tuple::decode(&cells[key_len..key_len + value_len], schema.value)
                .map_err(|e| corrupt(path, format!("line {line}: {e}")))?;
            Some(value)
        };
        rows.push(SegmentRow { key, value });
    }
    Ok(rows)
}

/// Write one new segment holding `inserted` rows followed by `tombstones`.
///
/// The file is staged under a temporary name and renamed into place, so a
/// crash never leaves a partial segment behind, and an existing segment is
/// never overwritten.
pub fn write<'a>(
    dir: &Path,
    schema: &MappingSchema,
    inserted: impl IntoIterator<Item = (&'a Tuple, &'a Tuple)>,
    tombstones: impl IntoIterator<Item = &'a Tuple>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let mapping = schema.name.as_str();
    let staging = dir.join(format!(".{mapping}.{}.staging", Uuid::new_v4()));

    let staged = write_rows(&staging, schema, inserted, tombstones);
    if let Err(err) = staged {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }

    let mut timestamp = Utc::now();
    let mut target = dir.join(file_name(mapping, timestamp));
    while target.exists() {
        timestamp += Duration::microseconds(1);
        target = dir.join(file_name(mapping, timestamp));
    }

    if let Err(err) = fs::rename(&staging, &target) {
        let _ = fs::remove_file(&staging);
        return Err(err.into());
    }
    Ok(target)
}

fn write_rows<'a>(
    path: &Path,
    schema: &MappingSchema,
    inserted: impl IntoIterator<Item = (&'a Tuple, &'a Tuple)>,
    tombstones: impl IntoIterator<Item = &'a Tuple>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(schema.header())?;

    for (key, value) in inserted {
        let mut row = key.encode();
        row.extend(value.encode());
        row.push(String::new());
        writer.write_record(&row)?;
    }

    let blanks = vec![String::new(); schema.value.len()];
    for key in tombstones {
        let mut row = key.encode();
        row.extend(blanks.iter().cloned());
        row.push(DELETE_MARKER.to_string());
        writer.write_record(&row)?;
    }

    let mut file = writer
        .into_inner()
        .map_err(|e| ImportError::Io(e.into_error()))?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}
