//! Batched calls to the generation service.
//!
//! Items are cut into contiguous batches. Each batch becomes one request, and
//! its response is parsed and validated before anything is accepted. A batch
//! that keeps failing is either skipped or replaced by the protocol's fallback
//! output. Credentials rotate on a fixed processed-item cadence, independent
//! of failures.

pub mod metadata;
pub mod variations;

use std::ops::Range;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GenerationSettings;
use crate::llm::{GenerationService, KeyPool};
use crate::observer::{fraction, Observer};

/// One request/response shape run through [`run_batches`].
pub trait BatchProtocol {
    type Item;
    type Candidate;
    type Output;

    /// Short label used in log lines ("variations", "metadata").
    fn label(&self) -> &'static str;

    fn build_request(&self, batch: &[Self::Item]) -> String;

    fn parse_response(&self, response: &str) -> Vec<Self::Candidate>;

    fn validate(&self, batch: &[Self::Item], candidates: &[Self::Candidate]) -> bool;

    /// Turn validated candidates into output rows.
    fn accept(&self, batch: &[Self::Item], candidates: Vec<Self::Candidate>) -> Vec<Self::Output>;

    /// Output used once a batch has run out of attempts. `None` skips the batch.
    fn fallback(&self, batch: &[Self::Item]) -> Option<Vec<Self::Output>>;

    /// Whether raw responses are echoed to the observer.
    fn echo_responses(&self) -> bool {
        false
    }
}

/// Sleep durations between retries and between batches. Zero in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub retry_backoff: Duration,
    pub inter_batch: Duration,
}

impl Pacing {
    pub fn immediate() -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            inter_batch: Duration::ZERO,
        }
    }

    pub fn from_settings(g: &GenerationSettings) -> Self {
        Self {
            retry_backoff: g.retry_backoff(),
            inter_batch: g.inter_batch(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub temperature: f32,
    pub pacing: Pacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    /// Failed, another attempt follows.
    Retry,
    /// Failed on the last allowed attempt.
    Exhausted,
    /// Failed after the run was cancelled; the batch is abandoned uncounted.
    Cancelled,
}

/// Transient record of one attempt; only its counts reach the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchAttempt {
    pub batch_index: usize,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

enum BatchState<C> {
    Pending,
    Attempting { attempt: u32 },
    Retry { attempt: u32 },
    Accepted(Vec<C>),
    Skipped,
    Cancelled,
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub accepted: Vec<T>,
    pub total: usize,
    /// Input items whose batch was accepted or replaced by the fallback.
    pub processed: usize,
    /// Input items dropped because their batch was skipped.
    pub skipped: usize,
    /// Input items replaced by the fallback.
    pub fallbacks: usize,
    /// Failed attempts, including the final one of an exhausted batch.
    pub retries: usize,
    pub skipped_ranges: Vec<Range<usize>>,
    pub attempts: Vec<BatchAttempt>,
    pub cancelled: bool,
}

impl<T> BatchReport<T> {
    fn new(total: usize) -> Self {
        Self {
            accepted: Vec::new(),
            total,
            processed: 0,
            skipped: 0,
            fallbacks: 0,
            retries: 0,
            skipped_ranges: Vec::new(),
            attempts: Vec::new(),
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.processed - self.fallbacks
    }
}

enum Reply<C> {
    Valid(Vec<C>),
    Invalid,
}

/// Run `items` through `protocol` one batch at a time. Calls are strictly
/// sequential; the active credential is `pool.cursor_for(processed)`.
pub async fn run_batches<P: BatchProtocol>(
    protocol: &P,
    items: &[P::Item],
    pool: &KeyPool,
    service: &dyn GenerationService,
    opts: &BatchOptions,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> BatchReport<P::Output> {
    let total = items.len();
    let batch_size = opts.batch_size.max(1);
    let max_attempts = opts.max_attempts.max(1);
    let batch_count = total.div_ceil(batch_size);
    let mut report = BatchReport::new(total);
    let mut active_key = 0;

    'batches: for (batch_index, batch) in items.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            observer.log_line(&format!("{} generation cancelled", protocol.label()));
            report.cancelled = true;
            break;
        }

        let start = batch_index * batch_size;
        let range = start..start + batch.len();

        let cursor = pool.cursor_for(report.processed);
        if cursor != active_key {
            active_key = cursor;
            observer.log_line(&format!("Switching to API key {}", cursor + 1));
        }
        let credential = pool.get(cursor);
        let request = protocol.build_request(batch);

        let mut state = BatchState::Pending;
        loop {
            state = match state {
                BatchState::Pending => BatchState::Attempting { attempt: 1 },

                BatchState::Attempting { attempt } => {
                    observer.log_line(&format!(
                        "Processing {} batch {}/{} for items {}-{} (attempt {}/{})",
                        protocol.label(),
                        batch_index + 1,
                        batch_count,
                        range.start + 1,
                        range.end,
                        attempt,
                        max_attempts
                    ));

                    let reply = match service.generate(&request, credential, opts.temperature).await {
                        Err(e) => {
                            warn!(retryable = e.is_retryable(), error = %e, "generation call failed");
                            observer.log_line(&format!("Error processing batch: {}", e));
                            Reply::Invalid
                        }
                        Ok(text) => {
                            if protocol.echo_responses() {
                                observer.log_line(&text);
                            }
                            let candidates = protocol.parse_response(&text);
                            if protocol.validate(batch, &candidates) {
                                Reply::Valid(candidates)
                            } else {
                                observer.log_line(&format!(
                                    "Received {} responses instead of {}",
                                    candidates.len(),
                                    batch.len()
                                ));
                                Reply::Invalid
                            }
                        }
                    };

                    let outcome = match &reply {
                        Reply::Valid(_) => AttemptOutcome::Accepted,
                        Reply::Invalid if cancel.is_cancelled() => AttemptOutcome::Cancelled,
                        Reply::Invalid if attempt < max_attempts => AttemptOutcome::Retry,
                        Reply::Invalid => AttemptOutcome::Exhausted,
                    };
                    report.attempts.push(BatchAttempt {
                        batch_index,
                        attempt,
                        outcome,
                    });

                    match (reply, outcome) {
                        (Reply::Valid(candidates), _) => BatchState::Accepted(candidates),
                        (Reply::Invalid, AttemptOutcome::Cancelled) => BatchState::Cancelled,
                        (Reply::Invalid, AttemptOutcome::Retry) => {
                            report.retries += 1;
                            observer.log_line("Retrying...");
                            BatchState::Retry { attempt }
                        }
                        (Reply::Invalid, _) => {
                            report.retries += 1;
                            BatchState::Skipped
                        }
                    }
                }

                BatchState::Retry { attempt } => {
                    tokio::select! {
                        _ = tokio::time::sleep(opts.pacing.retry_backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                    if cancel.is_cancelled() {
                        BatchState::Cancelled
                    } else {
                        BatchState::Attempting {
                            attempt: attempt + 1,
                        }
                    }
                }

                BatchState::Cancelled => {
                    observer.log_line(&format!(
                        "{} generation cancelled during batch {}/{}",
                        protocol.label(),
                        batch_index + 1,
                        batch_count
                    ));
                    report.cancelled = true;
                    break 'batches;
                }

                BatchState::Accepted(candidates) => {
                    let outputs = protocol.accept(batch, candidates);
                    observer.log_line(&format!(
                        "{} results for {} items accepted",
                        outputs.len(),
                        batch.len()
                    ));
                    report.accepted.extend(outputs);
                    report.processed += batch.len();
                    break;
                }

                BatchState::Skipped => {
                    match protocol.fallback(batch) {
                        Some(originals) => {
                            observer.log_line(&format!(
                                "Failed to generate {} for items {}-{}; keeping originals",
                                protocol.label(),
                                range.start + 1,
                                range.end
                            ));
                            report.accepted.extend(originals);
                            report.processed += batch.len();
                            report.fallbacks += batch.len();
                        }
                        None => {
                            observer.log_line("Max retries reached. Skipping batch.");
                            report.skipped += batch.len();
                            report.skipped_ranges.push(range.clone());
                        }
                    }
                    break;
                }
            };
        }

        debug!(batch = batch_index, processed = report.processed, "batch finished");
        observer.log_line(&format!(
            "Processed {} items out of {}.",
            report.processed, total
        ));
        observer.progress(fraction(range.end, total));

        if range.end < total {
            observer.log_line("Moving to next batch...");
            tokio::select! {
                _ = tokio::time::sleep(opts.pacing.inter_batch) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    observer.log_line(&format!("{} generation summary:", protocol.label()));
    observer.log_line(&format!("Total items: {}", report.total));
    observer.log_line(&format!("Successfully processed: {}", report.succeeded()));
    observer.log_line(&format!("Skipped: {}", report.skipped));
    observer.log_line(&format!("Total retry attempts: {}", report.retries));

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::llm::testing::{CancellingService, ScriptedService};
    use crate::observer::testing::RecordingObserver;

    /// Echo protocol: a response is a comma-separated list of outputs.
    struct Echo {
        strict: bool,
    }

    impl BatchProtocol for Echo {
        type Item = u32;
        type Candidate = String;
        type Output = String;

        fn label(&self) -> &'static str {
            "echo"
        }

        fn build_request(&self, batch: &[u32]) -> String {
            batch.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")
        }

        fn parse_response(&self, response: &str) -> Vec<String> {
            response
                .split(',')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        }

        fn validate(&self, batch: &[u32], candidates: &[String]) -> bool {
            candidates.len() == batch.len()
        }

        fn accept(&self, _batch: &[u32], candidates: Vec<String>) -> Vec<String> {
            candidates
        }

        fn fallback(&self, batch: &[u32]) -> Option<Vec<String>> {
            if self.strict {
                None
            } else {
                Some(batch.iter().map(|n| format!("orig{}", n)).collect())
            }
        }
    }

    fn opts(batch_size: usize, max_attempts: u32) -> BatchOptions {
        BatchOptions {
            batch_size,
            max_attempts,
            temperature: 0.4,
            pacing: Pacing::immediate(),
        }
    }

    fn pool(interval: usize) -> KeyPool {
        KeyPool::from_strings(&["k1".into(), "k2".into(), "k3".into()], interval).unwrap()
    }

    #[tokio::test]
    async fn partitions_into_contiguous_batches() {
        let service = ScriptedService::new(vec![
            ScriptedService::ok("a,b"),
            ScriptedService::ok("c,d"),
            ScriptedService::ok("e"),
        ]);
        let obs = RecordingObserver::default();

        let report = run_batches(
            &Echo { strict: true },
            &[1, 2, 3, 4, 5],
            &pool(350),
            &service,
            &opts(2, 3),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(service.prompts(), vec!["1,2", "3,4", "5"]);
        assert_eq!(report.accepted, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(report.processed, 5);
        assert_eq!(report.retries, 0);
        assert_eq!(obs.last_progress(), Some(1.0));
        assert!(obs.contains("Total retry attempts: 0"));
    }

    #[tokio::test]
    async fn retries_on_error_then_accepts() {
        let service = ScriptedService::new(vec![
            Err(GenerationError::RateLimited("quota".into())),
            ScriptedService::ok("x,y"),
        ]);
        let obs = RecordingObserver::default();

        let report = run_batches(
            &Echo { strict: true },
            &[1, 2],
            &pool(350),
            &service,
            &opts(2, 3),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.accepted, vec!["x", "y"]);
        assert_eq!(report.retries, 1);
        assert_eq!(
            report.attempts.iter().map(|a| a.outcome).collect::<Vec<_>>(),
            vec![AttemptOutcome::Retry, AttemptOutcome::Accepted]
        );
        assert!(obs.contains("Error processing batch: rate limited: quota"));
    }

    #[tokio::test]
    async fn strict_protocol_skips_exhausted_batch() {
        let service = ScriptedService::new(vec![
            ScriptedService::ok("a"),
            Err(GenerationError::Server("boom".into())),
            ScriptedService::ok("a"),
            ScriptedService::ok("p,q"),
        ]);
        let obs = RecordingObserver::default();

        let report = run_batches(
            &Echo { strict: true },
            &[1, 2, 3, 4],
            &pool(350),
            &service,
            &opts(2, 3),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.accepted, vec!["p", "q"]);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.skipped_ranges, vec![0..2]);
        assert_eq!(report.retries, 3);
        assert_eq!(report.processed, 2);
        assert!(obs.contains("Max retries reached. Skipping batch."));
        assert!(obs.contains("Skipped: 2"));
    }

    #[tokio::test]
    async fn lenient_protocol_falls_back_to_originals() {
        let service = ScriptedService::new(vec![Err(GenerationError::EmptyResponse)]);
        let obs = RecordingObserver::default();

        let report = run_batches(
            &Echo { strict: false },
            &[7, 8],
            &pool(350),
            &service,
            &opts(2, 1),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(report.accepted, vec!["orig7", "orig8"]);
        assert_eq!(report.fallbacks, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.succeeded(), 0);
        assert_eq!(service.call_count(), 1);
    }

    #[tokio::test]
    async fn rotates_keys_on_processed_cadence() {
        let replies = (0..6).map(|_| ScriptedService::ok("r,r")).collect();
        let service = ScriptedService::new(replies);
        let obs = RecordingObserver::default();

        run_batches(
            &Echo { strict: true },
            &[0; 12],
            &pool(4),
            &service,
            &opts(2, 1),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        // processed before each batch: 0,2,4,6,8,10 -> cursor 0,0,1,1,2,2
        assert_eq!(service.keys_used(), vec!["k1", "k1", "k2", "k2", "k3", "k3"]);
        assert!(obs.contains("Switching to API key 2"));
        assert!(obs.contains("Switching to API key 3"));
    }

    #[tokio::test]
    async fn skipped_batches_do_not_advance_rotation() {
        let service = ScriptedService::new(vec![
            ScriptedService::ok("only-one"),
            ScriptedService::ok("a,b"),
        ]);
        let obs = RecordingObserver::default();

        run_batches(
            &Echo { strict: true },
            &[1, 2, 3, 4],
            &pool(2),
            &service,
            &opts(2, 1),
            &obs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(service.keys_used(), vec!["k1", "k1"]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let service = ScriptedService::new(vec![ScriptedService::ok("a")]);
        let obs = RecordingObserver::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = run_batches(
            &Echo { strict: true },
            &[1, 2, 3],
            &pool(350),
            &service,
            &opts(1, 3),
            &obs,
            &cancel,
        )
        .await;

        assert!(report.cancelled);
        assert_eq!(service.call_count(), 0);
        assert!(report.accepted.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_attempt_is_not_counted_as_skip() {
        for strict in [true, false] {
            let cancel = CancellationToken::new();
            let service = CancellingService::new(&cancel, 0);
            let obs = RecordingObserver::default();

            let report = run_batches(
                &Echo { strict },
                &[1, 2, 3, 4, 5],
                &pool(350),
                &service,
                &opts(5, 3),
                &obs,
                &cancel,
            )
            .await;

            assert!(report.cancelled);
            assert_eq!(service.calls(), 1);
            assert_eq!(report.skipped, 0);
            assert!(report.skipped_ranges.is_empty());
            assert_eq!(report.fallbacks, 0);
            assert_eq!(report.retries, 0);
            assert!(report.accepted.is_empty());
            assert_eq!(report.attempts[0].outcome, AttemptOutcome::Cancelled);
            assert!(!obs.contains("Max retries reached"));
            assert!(obs.contains("echo generation cancelled during batch 1/1"));
        }
    }

    #[tokio::test]
    async fn cancellation_keeps_batches_already_accepted() {
        let cancel = CancellationToken::new();
        let service = CancellingService::new(&cancel, 1);
        let obs = RecordingObserver::default();

        let report = run_batches(
            &Echo { strict: true },
            &[1, 2, 3, 4, 5, 6],
            &pool(350),
            &service,
            &opts(2, 3),
            &obs,
            &cancel,
        )
        .await;

        assert!(report.cancelled);
        assert_eq!(service.calls(), 2);
        assert_eq!(report.accepted, vec!["a", "b"]);
        assert_eq!(report.processed, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.retries, 0);
        assert!(obs.contains("Skipped: 0"));
    }
}
