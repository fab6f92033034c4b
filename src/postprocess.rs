use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::PostSettings;
use crate::observer::Observer;
use crate::pipeline::metadata::MetadataRow;
use crate::tables::{Table, TableError, TableSink};

static VERSIONED_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)V\d+(-\d+)$").unwrap());

pub const METADATA_HEADER: [&str; 5] = ["File name", "Title", "Keywords", "Prompt", "Model"];
pub const KEYWORDS_COLUMN: &str = "Keywords";
pub const METADATA_DELIMITER: u8 = b';';

/// `<prefix>V<n>-<serial>.<ext>` with the version segment replaced by `version`.
/// Names that don't follow the pattern come back unchanged.
pub fn derive_filename_for_version(file_name: &str, version: &str) -> String {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    let Some(caps) = VERSIONED_NAME_RE.captures(stem) else {
        return file_name.to_string();
    };

    let mut out = format!("{}{}{}", &caps[1], version, &caps[2]);
    if let Some(ext) = ext {
        out.push('.');
        out.push_str(ext);
    }
    out
}

pub fn metadata_table_name(file_prefix: &str, version: &str) -> String {
    format!("{}-md-{}.csv", file_prefix, version)
}

pub fn reduced_table_name(file_prefix: &str, version: &str) -> String {
    format!("{}-md-{}-reduced.csv", file_prefix, version)
}

/// `;`-delimited metadata table for one version tag.
pub fn metadata_table(rows: &[MetadataRow], version: &str) -> Table {
    let header = METADATA_HEADER.iter().map(|h| h.to_string()).collect();
    let mut table = Table::new(header).delimited(METADATA_DELIMITER);
    for row in rows {
        table.rows.push(vec![
            derive_filename_for_version(&row.file_name, version),
            row.record.title.clone(),
            row.record.keywords_field(),
            row.record.prompt.clone(),
            row.record.model.clone(),
        ]);
    }
    table
}

/// Copy of `table` with every keyword list cut to `max_keywords`.
/// Row order, header and the other fields are untouched.
pub fn cap_keywords(
    table: &Table,
    max_keywords: usize,
    source_name: &str,
    observer: &dyn Observer,
) -> Result<Table, TableError> {
    let column = table
        .column(KEYWORDS_COLUMN)
        .ok_or_else(|| TableError::MissingColumn {
            path: source_name.to_string(),
            column: KEYWORDS_COLUMN.to_string(),
        })?;

    let mut capped = table.clone();
    for (i, row) in capped.rows.iter_mut().enumerate() {
        let Some(field) = row.get_mut(column) else {
            continue;
        };
        let mut keywords: Vec<&str> = field.split(',').collect();
        if keywords.len() > max_keywords {
            observer.log_line(&format!(
                "Encountered more than {} keywords on line {} in {}. Removing excess keywords.",
                max_keywords,
                i + 1,
                source_name
            ));
            keywords.truncate(max_keywords);
        }
        *field = keywords.join(",");
    }
    Ok(capped)
}

/// Read a persisted metadata table and write its keyword-capped sibling.
pub fn reduce_table(
    sink: &dyn TableSink,
    input: &str,
    output: &str,
    max_keywords: usize,
    observer: &dyn Observer,
) -> Result<PathBuf, TableError> {
    let table = sink.read(input, METADATA_DELIMITER)?;
    let reduced = cap_keywords(&table, max_keywords, input, observer)?;
    let path = sink.write(output, &reduced)?;
    observer.log_line(&format!(
        "Keyword reduction completed. Reduced file saved as: {}",
        path.display()
    ));
    Ok(path)
}

/// Write one metadata table plus its reduced sibling per version tag.
pub fn write_versioned_tables(
    sink: &dyn TableSink,
    file_prefix: &str,
    rows: &[MetadataRow],
    opts: &PostSettings,
    observer: &dyn Observer,
) -> Result<Vec<PathBuf>, TableError> {
    let mut written = Vec::new();
    for version in &opts.versions {
        let name = metadata_table_name(file_prefix, version);
        written.push(sink.write(&name, &metadata_table(rows, version))?);

        let reduced = reduced_table_name(file_prefix, version);
        written.push(reduce_table(sink, &name, &reduced, opts.max_keywords, observer)?);
        observer.log_line(&format!(
            "Generated reduced metadata file for {}: {}",
            version, reduced
        ));
    }
    Ok(written)
}
