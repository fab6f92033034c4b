use tokio_util::sync::CancellationToken;

use super::{run_batches, BatchOptions, BatchProtocol, BatchReport, Pacing};
use crate::config::GenerationSettings;
use crate::format::{normalize, FormattedPrompt};
use crate::llm::{GenerationService, KeyPool};
use crate::observer::Observer;

const INSTRUCTIONS: &str = r#"Generate metadata for the pictures according to the following prompts, in the format:
"Title;Keywords;Prompt;Model"
* For 'Title', generate a description containing only 4 words. Do not use any artist or personality name, do not use "in the style of"; keep it short, plain and under 100 characters.
* For 'Keywords', generate 30 keywords (not less than 30), each consisting of only one word. Prefer easy words people use every day. Every metadata line must contain at least 30 keywords.
* For 'Prompt', rewrite the prompt to be concise, clear and about 10 words long, without any artist, personality or style names.
* For 'Model', use Midjourney 6.
Ensure that each component is clearly separated by a semicolon.
Answer with exactly one line per prompt, in this format:
"Title;Keywords;Prompt;Model"
"Title;Keywords;Prompt;Model"
Example line:
"A beautiful landscape with a river and mountains in the background;landscape, river, mountains, beautiful, background, water, sky, clouds, trees, green, blue;A beautiful landscape with a river and mountains;Midjourney 6"
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub title: String,
    pub keywords: Vec<String>,
    pub prompt: String,
    pub model: String,
}

impl MetadataRecord {
    /// Parse one `Title;Keywords;Prompt;Model` line. Anything but exactly four
    /// fields is rejected.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = normalize(line);
        let fields: Vec<&str> = line.split(';').collect();
        let [title, keywords, prompt, model] = fields.as_slice() else {
            return None;
        };
        Some(Self {
            title: title.to_string(),
            keywords: keywords.split(',').map(|k| k.trim().to_string()).collect(),
            prompt: prompt.to_string(),
            model: model.to_string(),
        })
    }

    /// Keywords joined with bare commas.
    pub fn keywords_field(&self) -> String {
        self.keywords.join(",")
    }
}

/// A record paired with the file name of the prompt it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    pub file_name: String,
    pub record: MetadataRecord,
}

/// Well-formed records in a response; malformed lines are dropped silently.
pub fn parse_metadata(response: &str) -> Vec<MetadataRecord> {
    response
        .trim()
        .lines()
        .filter_map(MetadataRecord::parse_line)
        .collect()
}

/// Strict protocol: a response must yield exactly one record per prompt.
pub struct Metadata;

impl BatchProtocol for Metadata {
    type Item = FormattedPrompt;
    type Candidate = MetadataRecord;
    type Output = MetadataRow;

    fn label(&self) -> &'static str {
        "metadata"
    }

    fn build_request(&self, batch: &[FormattedPrompt]) -> String {
        let prompts = batch
            .iter()
            .map(FormattedPrompt::numbered)
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "{}\nI will give you {} prompts at once, make sure to give me {} metadata lines. Here are the prompts:\n{}\n",
            INSTRUCTIONS,
            batch.len(),
            batch.len(),
            prompts
        )
    }

    fn parse_response(&self, response: &str) -> Vec<MetadataRecord> {
        parse_metadata(response)
    }

    fn validate(&self, batch: &[FormattedPrompt], candidates: &[MetadataRecord]) -> bool {
        candidates.len() == batch.len()
    }

    fn accept(&self, batch: &[FormattedPrompt], candidates: Vec<MetadataRecord>) -> Vec<MetadataRow> {
        batch
            .iter()
            .zip(candidates)
            .map(|(p, record)| MetadataRow {
                file_name: p.source_file_name.clone(),
                record,
            })
            .collect()
    }

    fn fallback(&self, _batch: &[FormattedPrompt]) -> Option<Vec<MetadataRow>> {
        None
    }

    fn echo_responses(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct MetadataReport {
    pub batches: BatchReport<MetadataRow>,
    /// File names of prompts whose batch was skipped; they get no metadata row.
    pub skipped_files: Vec<String>,
}

pub async fn generate_metadata(
    prompts: &[FormattedPrompt],
    pool: &KeyPool,
    service: &dyn GenerationService,
    settings: &GenerationSettings,
    pacing: Pacing,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> MetadataReport {
    let opts = BatchOptions {
        batch_size: settings.metadata_batch_size,
        max_attempts: settings.metadata_max_retries,
        temperature: settings.metadata_temperature,
        pacing,
    };
    let batches = run_batches(&Metadata, prompts, pool, service, &opts, observer, cancel).await;

    let skipped_files: Vec<String> = batches
        .skipped_ranges
        .iter()
        .flat_map(|r| prompts[r.clone()].iter().map(|p| p.source_file_name.clone()))
        .collect();
    if !skipped_files.is_empty() {
        observer.log_line(&format!(
            "No metadata for {} prompts: {}",
            skipped_files.len(),
            skipped_files.join(", ")
        ));
    }

    MetadataReport {
        batches,
        skipped_files,
    }
}
