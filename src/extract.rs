use tokio_util::sync::CancellationToken;

use crate::config::ExtractSettings;
use crate::error::FetchError;
use crate::fetcher::PageFetcher;
use crate::observer::{fraction, Observer};

/// Paragraph texts from one link. Never fails: every problem is logged and
/// yields zero items. The short page-load timeout applies to this link only
/// and the default is restored on every exit path.
pub async fn extract(
    fetcher: &dyn PageFetcher,
    link: &str,
    opts: &ExtractSettings,
    observer: &dyn Observer,
) -> Vec<String> {
    if let Err(e) = fetcher.set_page_load_timeout(opts.page_load_timeout()).await {
        observer.log_line(&format!("Could not shorten page-load timeout for {}: {}", link, e));
    }

    let items = match extract_paragraphs(fetcher, link, opts, observer).await {
        Ok(items) => items,
        Err(e) => {
            observer.log_line(&format!("Error extracting content from {}: {}", link, e));
            Vec::new()
        }
    };

    if let Err(e) = fetcher
        .set_page_load_timeout(opts.default_page_load_timeout())
        .await
    {
        observer.log_line(&format!("Could not restore page-load timeout after {}: {}", link, e));
    }

    items
}

async fn extract_paragraphs(
    fetcher: &dyn PageFetcher,
    link: &str,
    opts: &ExtractSettings,
    observer: &dyn Observer,
) -> Result<Vec<String>, FetchError> {
    match fetcher.load(link).await {
        Ok(()) => {}
        // The page may still be partially rendered; try anyway.
        Err(FetchError::Timeout(_)) => observer.log_line(&format!(
            "Page load timed out after {} seconds for {}",
            opts.page_load_timeout_secs, link
        )),
        Err(e) => return Err(e),
    }

    tokio::time::sleep(opts.settle()).await;

    match fetcher.wait_for(&opts.container_id, opts.container_wait()).await {
        Ok(()) => {}
        Err(FetchError::NotFound(_)) | Err(FetchError::Timeout(_)) => {
            observer.log_line(&format!(
                "Could not find {} on {} within {} second(s)",
                opts.container_id, link, opts.container_wait_secs
            ));
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    }

    fetcher.find_text(&opts.container_id, &opts.paragraph_tag).await
}

/// Extract every link in order, concatenating the paragraphs.
pub async fn extract_all(
    fetcher: &dyn PageFetcher,
    links: &[String],
    opts: &ExtractSettings,
    observer: &dyn Observer,
    cancel: &CancellationToken,
) -> Vec<String> {
    let mut content = Vec::new();
    for (index, link) in links.iter().enumerate() {
        if cancel.is_cancelled() {
            observer.log_line(&format!(
                "Extraction cancelled after {}/{} links",
                index,
                links.len()
            ));
            break;
        }

        observer.log_line(&format!("Processing: {}", link));
        content.extend(extract(fetcher, link, opts, observer).await);

        observer.log_line(&format!(
            "Progress: {}/{} links completed",
            index + 1,
            links.len()
        ));
        observer.log_line(&format!(
            "Total paragraphs extracted so far: {}",
            content.len()
        ));
        observer.progress(fraction(index + 1, links.len()));
    }
    content
}
