use std::fs;
use std::path::{Path, PathBuf};

use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};

pub use crate::error::TableError;

/// An in-memory table about to be persisted (or just read back).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub delimiter: u8,
    pub quote_all: bool,
}

impl Table {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
            delimiter: b',',
            quote_all: false,
        }
    }

    pub fn delimited(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn quote_all(mut self) -> Self {
        self.quote_all = true;
        self
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }
}

/// Where finished tables go. Tables are written whole, once per run.
pub trait TableSink: Send + Sync {
    fn write(&self, name: &str, table: &Table) -> Result<PathBuf, TableError>;

    fn read(&self, name: &str, delimiter: u8) -> Result<Table, TableError>;
}

/// Writes CSV files into a directory.
pub struct CsvDir {
    dir: PathBuf,
}

impl CsvDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.dir.join(p)
        }
    }
}

impl TableSink for CsvDir {
    fn write(&self, name: &str, table: &Table) -> Result<PathBuf, TableError> {
        let path = self.path(name);
        let display = path.display().to_string();
        let csv_err = |source| TableError::Csv {
            path: display.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| TableError::Io {
                path: display.clone(),
                source,
            })?;
        }

        let style = if table.quote_all {
            QuoteStyle::Always
        } else {
            QuoteStyle::Necessary
        };
        let mut writer = WriterBuilder::new()
            .delimiter(table.delimiter)
            .quote_style(style)
            .from_path(&path)
            .map_err(csv_err)?;

        writer.write_record(&table.header).map_err(csv_err)?;
        for row in &table.rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| TableError::Io {
            path: display.clone(),
            source,
        })?;
        Ok(path)
    }

    fn read(&self, name: &str, delimiter: u8) -> Result<Table, TableError> {
        let path = self.path(name);
        let display = path.display().to_string();
        let csv_err = |source| TableError::Csv {
            path: display.clone(),
            source,
        };

        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_path(&path)
            .map_err(csv_err)?;

        let header = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(String::from)
            .collect();
        let mut table = Table::new(header).delimited(delimiter);
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            table.rows.push(record.iter().map(String::from).collect());
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_all_table_quotes_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDir::new(dir.path());
        let mut table = Table::new(vec!["Prompts".into()]).quote_all();
        table.rows.push(vec!["1_Cat --v 6.1".into()]);

        let path = sink.write("out.csv", &table).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text, "\"Prompts\"\n\"1_Cat --v 6.1\"\n");
    }

    #[test]
    fn semicolon_table_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDir::new(dir.path());
        let mut table = Table::new(vec!["File name".into(), "Keywords".into()]).delimited(b';');
        table.rows.push(vec!["X-V1-1.jpg".into(), "a,b;c".into()]);

        sink.write("nested/md.csv", &table).unwrap();
        let back = sink.read("nested/md.csv", b';').unwrap();

        assert_eq!(back, table);
        assert_eq!(back.column("Keywords"), Some(1));
    }

    #[test]
    fn missing_file_is_a_csv_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvDir::new(dir.path());
        assert!(matches!(
            sink.read("nope.csv", b','),
            Err(TableError::Csv { .. })
        ));
    }
}
