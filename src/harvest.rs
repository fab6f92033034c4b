use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HarvestSettings;
use crate::error::FetchError;
use crate::fetcher::PageFetcher;
use crate::observer::{fraction, Observer};

/// Links discovered so far, deduplicated, in discovery order.
#[derive(Debug, Default)]
pub struct LinkSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl LinkSet {
    /// Returns true if the link was new.
    pub fn insert(&mut self, link: String) -> bool {
        if link.is_empty() || self.seen.contains(&link) {
            return false;
        }
        self.seen.insert(link.clone());
        self.ordered.push(link);
        true
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

/// Scroll `target_url` until `min_links` prompt cards are known or the attempt
/// budget runs out. The minimum is a soft target: whatever accumulated is returned.
pub async fn harvest(
    fetcher: &dyn PageFetcher,
    target_url: &str,
    opts: &HarvestSettings,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Result<Vec<String>, FetchError> {
    match fetcher.load(target_url).await {
        Ok(()) => {}
        Err(FetchError::Timeout(e)) => {
            observer.log_line(&format!("Loading {} timed out ({}); continuing", target_url, e));
        }
        Err(e) => return Err(e),
    }

    observer.log_line("Scrolling and extracting links...");
    let mut links = LinkSet::default();

    for attempt in 1..=opts.max_attempts {
        if cancel.is_cancelled() {
            observer.log_line("Harvest cancelled");
            break;
        }

        if let Err(e) = scroll_once(fetcher, opts, &mut links).await {
            observer.log_line(&format!("Scroll attempt {} failed: {}", attempt, e));
        }

        observer.log_line(&format!(
            "Scrolled and found {} unique links so far. Attempt {}/{}",
            links.len(),
            attempt,
            opts.max_attempts
        ));
        observer.progress(fraction(attempt, opts.max_attempts));

        if links.len() >= opts.min_links {
            observer.log_line(&format!(
                "Reached the minimum of {} links. Stopping scrolling.",
                opts.min_links
            ));
            break;
        }
    }

    Ok(links.into_vec())
}

async fn scroll_once(
    fetcher: &dyn PageFetcher,
    opts: &HarvestSettings,
    links: &mut LinkSet,
) -> Result<(), FetchError> {
    fetcher.scroll_to_bottom().await?;
    tokio::time::sleep(opts.scroll_pause()).await;

    let found = fetcher.find_all(&opts.card_selector, "href").await?;
    let mut fresh = 0;
    for href in found {
        if links.insert(href) {
            fresh += 1;
        }
    }
    debug!(fresh, total = links.len(), "scroll pass");
    Ok(())
}
