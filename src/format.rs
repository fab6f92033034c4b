use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::FormatSettings;
use crate::observer::{fraction, Observer};
use crate::tables::{Table, TableError, TableSink};

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--v (\d+(?:\.\d+)?)").unwrap());

pub const PROMPTS_HEADER: &str = "Prompts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPrompt {
    pub serial: u64,
    pub text: String,
    pub source_file_name: String,
}

impl FormattedPrompt {
    /// `"<serial>_<text>"`, the form written to the prompts table and sent for metadata.
    pub fn numbered(&self) -> String {
        format!("{}_{}", self.serial, self.text)
    }
}

#[derive(Debug, Default)]
pub struct Formatted {
    pub prompts: Vec<FormattedPrompt>,
    pub file_names: Vec<String>,
    pub duplicates: usize,
}

/// Trim whitespace and one layer of surrounding double quotes.
pub fn normalize(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unquoted = trimmed.strip_prefix('"').unwrap_or(trimmed);
    let unquoted = unquoted.strip_suffix('"').unwrap_or(unquoted);
    unquoted.trim()
}

/// Rewrite every `--v N` / `--v N.N` tag to `--v <target>`.
/// Returns the rewritten text and the first original version if anything changed.
pub fn rewrite_version(text: &str, target: &str) -> (String, Option<String>) {
    let original = VERSION_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let replacement = format!("--v {}", target);
    let rewritten = VERSION_RE.replace_all(text, replacement.as_str()).into_owned();
    if rewritten == text {
        (rewritten, None)
    } else {
        (rewritten, original)
    }
}

pub fn file_name_for(prefix: &str, serial: u64, extension: &str) -> String {
    format!("{}V1-{}.{}", prefix, serial, extension)
}

/// Deduplicate (case-insensitively, first occurrence wins), rewrite version
/// tags and number the survivors from `start_serial`.
pub fn format_prompts(
    items: &[String],
    start_serial: u64,
    file_prefix: &str,
    opts: &FormatSettings,
    observer: &dyn Observer,
) -> Formatted {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Formatted::default();
    let mut serial = start_serial;

    for (i, raw) in items.iter().enumerate() {
        let prompt = normalize(raw);
        if !prompt.is_empty() {
            if seen.insert(prompt.to_lowercase()) {
                let (text, previous) = rewrite_version(prompt, &opts.target_version);
                if let Some(previous) = previous {
                    observer.log_line(&format!(
                        "Prompt {} changed: '--v {}' to '--v {}'",
                        serial, previous, opts.target_version
                    ));
                }

                let source_file_name = file_name_for(file_prefix, serial, &opts.file_extension);
                out.file_names.push(source_file_name.clone());
                out.prompts.push(FormattedPrompt {
                    serial,
                    text,
                    source_file_name,
                });
                serial += 1;
            } else {
                observer.log_line(&format!("Duplicate prompt removed: {}", prompt));
                out.duplicates += 1;
            }
        }
        observer.progress(fraction(i + 1, items.len()));
    }

    observer.log_line(&format!("Total unique prompts: {}", seen.len()));
    out
}

/// Single-column `Prompts` table, one numbered prompt per row, every field quoted.
pub fn prompts_table(prompts: &[FormattedPrompt]) -> Table {
    let mut table = Table::new(vec![PROMPTS_HEADER.to_string()]).quote_all();
    for p in prompts {
        table.rows.push(vec![p.numbered()]);
    }
    table
}

pub fn persist(
    sink: &dyn TableSink,
    name: &str,
    prompts: &[FormattedPrompt],
) -> Result<(), TableError> {
    sink.write(name, &prompts_table(prompts))?;
    Ok(())
}
