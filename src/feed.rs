//! CSV input rows for the importers.
//!
//! A feed checks up front that every declared column is present. Columns
//! that were not declared are dropped, and reading one is an error.

use std::fs::File;
use std::path::Path;

use indexmap::IndexMap;

use crate::error::{ImportError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// 1-based line number in the source file (the header is line 1).
    pub line: usize,
    fields: IndexMap<String, String>,
}

impl Row {
    pub fn new(line: usize, fields: IndexMap<String, String>) -> Self {
        Self { line, fields }
    }

    pub fn get(&self, column: &str) -> Result<&str> {
        self.fields.get(column).map(String::as_str).ok_or_else(|| {
            ImportError::InvalidCsv(format!("referencing undeclared column '{column}'"))
        })
    }

    pub fn int(&self, column: &str) -> Result<i64> {
        let raw = self.get(column)?;
        raw.trim().parse().map_err(|_| {
            ImportError::InvalidCsv(format!(
                "line {}: column '{column}' is not an integer: '{raw}'",
                self.line
            ))
        })
    }
}

/// Read every row of `path`, keeping only `columns`.
pub fn read(path: &Path, columns: &[&str]) -> Result<Vec<Row>> {
    let file = File::open(path)
        .map_err(|e| ImportError::InvalidCsv(format!("cannot open '{}': {e}", path.display())))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(file);

    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if header.is_empty() {
        return Err(ImportError::InvalidCsv(format!(
            "no header in '{}'",
            path.display()
        )));
    }
    let missing = missing_columns(&header, columns);
    if !missing.is_empty() {
        return Err(ImportError::InvalidCsv(format!(
            "column(s) {} expected in '{}'",
            missing.join(", "),
            path.display()
        )));
    }

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let fields = header
            .iter()
            .zip(record.iter())
            .filter(|(name, _)| columns.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();
        rows.push(Row::new(idx + 2, fields));
    }
    Ok(rows)
}

pub fn missing_columns<'a>(header: &[String], columns: &[&'a str]) -> Vec<&'a str> {
    columns
        .iter()
        .copied()
        .filter(|c| !header.iter().any(|h| h == c))
        .collect()
}

/// Write `rows` under `header` as a new CSV file.
pub fn write(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn rows_keep_declared_columns_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orgs.csv");
        fs::write(
            &path,
            "organization_id,organization,extra\n5,east,x\n6,\"west, inc\",y\n",
        )
        .unwrap();

        let rows = read(&path, &["organization_id", "organization"]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].int("organization_id").unwrap(), 5);
        assert_eq!(rows[1].get("organization").unwrap(), "west, inc");
        assert_eq!(rows[1].line, 3);
        assert_eq!(rows[0].get("extra").unwrap_err().code(), "invalid_csv");
    }

    #[test]
    fn missing_columns_are_reported_together() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.csv");
        fs::write(&path, "user_id\n1\n").unwrap();
        let err = read(&path, &["user_id", "username", "email"]).unwrap_err();
        assert!(err.to_string().contains("username, email"), "{err}");
    }

    #[test]
    fn bad_integer_names_line_and_column() {
        let row = Row::new(
            4,
            IndexMap::from([("org_id".to_string(), "abc".to_string())]),
        );
        let err = row.int("org_id").unwrap_err();
        assert!(err.to_string().contains("line 4"), "{err}");
    }

    #[test]
    fn write_produces_header_then_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("passwords.csv");
        write(
            &path,
            &["mail", "login", "password"],
            &[vec!["a@b.c".into(), "jd".into(), "jd_abcdefgh".into()]],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "mail,login,password\na@b.c,jd,jd_abcdefgh\n"
        );
    }
}
