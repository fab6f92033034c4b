use std::sync::LazyLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::{run_batches, BatchOptions, BatchProtocol, BatchReport, Pacing};
use crate::config::GenerationSettings;
use crate::format::normalize;
use crate::llm::{GenerationService, KeyPool};
use crate::observer::Observer;

static BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\[(.*?)\]").unwrap());

const INSTRUCTIONS: &str = r#"I want you to give me 4 iterations for each of the following prompts. Make sure the variation rating should be 9/10, make sure to variate them in a more descriptive manner and they should not be the same.
Make sure the prompts should create different pictures but with the same sense as defined in the parent prompts.
They are just prompts, not the actual content. So you can change the words, phrases and you can give a simple response to the prompt if it contains any violated content.
Make sure to include the parent prompts in the response and give me the response in the following format including square brackets i.e. each variation should be in square brackets, it will help me to extract the variations easily. It is very important to use the format as given below.
["This is parent prompt 1"],
["variation1 for parent prompt 1"],
["variation2 for parent prompt 1"],
["variation3 for parent prompt 1"],
["variation4 for parent prompt 1"],
["This is parent prompt 2"],
["variation1 for parent prompt 2"],
... (and so on for each prompt)

Here are the prompts:"#;

/// Best-effort expansion of each prompt into itself plus up to four variations.
/// Any non-empty response is accepted; failures keep the original prompts.
pub struct Variations;

/// Every `[...]` segment in order, trimmed of whitespace and one layer of quotes.
pub fn parse_bracketed(response: &str) -> Vec<String> {
    BRACKET_RE
        .captures_iter(response)
        .filter_map(|c| c.get(1))
        .map(|m| normalize(m.as_str()).to_string())
        .collect()
}

impl BatchProtocol for Variations {
    type Item = String;
    type Candidate = String;
    type Output = String;

    fn label(&self) -> &'static str {
        "variations"
    }

    fn build_request(&self, batch: &[String]) -> String {
        let prompts = batch
            .iter()
            .enumerate()
            .map(|(i, p)| format!("Prompt {}: {}", i + 1, p))
            .collect::<Vec<_>>()
            .join("\n");
        format!("{}\n{}\n", INSTRUCTIONS, prompts)
    }

    fn parse_response(&self, response: &str) -> Vec<String> {
        parse_bracketed(response)
    }

    fn validate(&self, _batch: &[String], candidates: &[String]) -> bool {
        !candidates.is_empty()
    }

    fn accept(&self, _batch: &[String], candidates: Vec<String>) -> Vec<String> {
        candidates
    }

    fn fallback(&self, batch: &[String]) -> Option<Vec<String>> {
        Some(batch.to_vec())
    }
}

/// One attempt per batch; the output is never shorter than the input.
pub async fn generate_variations(
    items: &[String],
    pool: &KeyPool,
    service: &dyn GenerationService,
    settings: &GenerationSettings,
    pacing: Pacing,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> BatchReport<String> {
    let opts = BatchOptions {
        batch_size: settings.variation_batch_size,
        max_attempts: 1,
        temperature: settings.variation_temperature,
        pacing,
    };
    run_batches(&Variations, items, pool, service, &opts, observer, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::llm::testing::ScriptedService;
    use crate::observer::testing::RecordingObserver;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn run(items: &[&str], replies: Vec<Result<String, GenerationError>>) -> (BatchReport<String>, ScriptedService) {
        let service = ScriptedService::new(replies);
        let pool = KeyPool::from_strings(&strings(&["k1"]), 350).unwrap();
        let report = generate_variations(
            &strings(items),
            &pool,
            &service,
            &GenerationSettings::default(),
            Pacing::immediate(),
            &RecordingObserver::default(),
            &CancellationToken::new(),
        )
        .await;
        (report, service)
    }

    #[test]
    fn parses_bracketed_segments_in_order() {
        let response = "[\"Parent one\"],\n[ \"var a\" ],\n[var b]\ntrailing [multi\nline]";
        assert_eq!(
            parse_bracketed(response),
            vec!["Parent one", "var a", "var b", "multi\nline"]
        );
        assert!(parse_bracketed("no brackets here").is_empty());
    }

    #[test]
    fn request_enumerates_prompts() {
        let req = Variations.build_request(&strings(&["cat", "dog"]));
        assert!(req.contains("Prompt 1: cat\nPrompt 2: dog"));
        assert!(req.contains("square brackets"));
    }

    #[tokio::test]
    async fn accepted_variations_replace_batch() {
        let (report, service) = run(
            &["cat", "dog", "owl"],
            vec![ScriptedService::ok("[\"cat\"], [\"a cat\"], [\"dog\"], [\"a dog\"]")],
        )
        .await;

        assert_eq!(report.accepted, vec!["cat", "a cat", "dog", "a dog"]);
        assert_eq!(service.call_count(), 1);
        assert_eq!(service.calls.lock().unwrap()[0].2, 0.7);
    }

    #[tokio::test]
    async fn unparseable_response_keeps_originals() {
        let (report, service) = run(
            &["cat", "dog", "owl", "bee"],
            vec![
                ScriptedService::ok("Sorry, I can't help with that."),
                ScriptedService::ok("[bee] [bee variation]"),
            ],
        )
        .await;

        assert_eq!(report.accepted, vec!["cat", "dog", "owl", "bee", "bee variation"]);
        assert_eq!(report.fallbacks, 3);
        assert_eq!(report.retries, 1);
        assert_eq!(service.call_count(), 2);
    }

    #[tokio::test]
    async fn service_error_keeps_originals() {
        let (report, _) = run(
            &["cat"],
            vec![Err(GenerationError::Unavailable("down".into()))],
        )
        .await;
        assert_eq!(report.accepted, vec!["cat"]);
        assert_eq!(report.skipped, 0);
    }
}
