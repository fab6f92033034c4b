pub mod webdriver;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;

pub use webdriver::WebDriverFetcher;

/// Browser capability used by the harvester and extractor.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Navigate to `url`, bounded by the current page-load timeout.
    async fn load(&self, url: &str) -> Result<(), FetchError>;

    async fn scroll_to_bottom(&self) -> Result<(), FetchError>;

    /// Value of `attribute` on every element matching the CSS `selector`.
    async fn find_all(&self, selector: &str, attribute: &str) -> Result<Vec<String>, FetchError>;

    /// Wait up to `timeout` for an element with id `container_id`.
    /// Resolves to `FetchError::NotFound` if it never shows up.
    async fn wait_for(&self, container_id: &str, timeout: Duration) -> Result<(), FetchError>;

    /// Text of every `tag` element inside `container_id`, in document order.
    async fn find_text(&self, container_id: &str, tag: &str) -> Result<Vec<String>, FetchError>;

    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), FetchError>;

    /// Release the browser session. Safe to call more than once.
    async fn close(&self) -> Result<(), FetchError>;
}

#[cfg(test)]
pub mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::PageFetcher;
    use crate::error::FetchError;

    /// What a scripted page does when it is loaded.
    #[derive(Clone)]
    pub enum PageScript {
        /// Loads fine and exposes these paragraphs.
        Paragraphs(Vec<String>),
        /// Load times out, but the container still renders these paragraphs.
        SlowLoad(Vec<String>),
        /// Loads fine, container never appears.
        NoContainer,
        /// Loads fine, reading the container fails.
        Broken,
    }

    /// In-memory fetcher driven by per-URL scripts and per-scroll link batches.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        pub pages: HashMap<String, PageScript>,
        pub scrolls: Mutex<VecDeque<Vec<String>>>,
        pub current: Mutex<Option<String>>,
        pub timeouts: Mutex<Vec<Duration>>,
        pub scroll_calls: Mutex<usize>,
        pub closed: Mutex<bool>,
    }

    impl ScriptedFetcher {
        pub fn with_page(mut self, url: &str, script: PageScript) -> Self {
            self.pages.insert(url.to_string(), script);
            self
        }

        pub fn with_scrolls(self, batches: Vec<Vec<&str>>) -> Self {
            *self.scrolls.lock().unwrap() = batches
                .into_iter()
                .map(|b| b.into_iter().map(String::from).collect())
                .collect();
            self
        }

        pub fn timeouts(&self) -> Vec<Duration> {
            self.timeouts.lock().unwrap().clone()
        }

        fn script(&self) -> Option<PageScript> {
            let current = self.current.lock().unwrap().clone()?;
            self.pages.get(&current).cloned()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn load(&self, url: &str) -> Result<(), FetchError> {
            *self.current.lock().unwrap() = Some(url.to_string());
            match self.pages.get(url) {
                Some(PageScript::SlowLoad(_)) => Err(FetchError::Timeout(url.to_string())),
                _ => Ok(()),
            }
        }

        async fn scroll_to_bottom(&self) -> Result<(), FetchError> {
            *self.scroll_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn find_all(&self, _selector: &str, _attr: &str) -> Result<Vec<String>, FetchError> {
            // Each scroll reveals the next batch; once exhausted nothing new appears.
            Ok(self.scrolls.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn wait_for(&self, id: &str, _timeout: Duration) -> Result<(), FetchError> {
            match self.script() {
                Some(PageScript::NoContainer) | None => Err(FetchError::NotFound(id.to_string())),
                _ => Ok(()),
            }
        }

        async fn find_text(&self, _id: &str, _tag: &str) -> Result<Vec<String>, FetchError> {
            match self.script() {
                Some(PageScript::Paragraphs(p)) | Some(PageScript::SlowLoad(p)) => Ok(p),
                Some(PageScript::Broken) => Err(FetchError::Protocol {
                    code: "stale element reference".into(),
                    message: "container detached".into(),
                }),
                _ => Ok(Vec::new()),
            }
        }

        async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), FetchError> {
            self.timeouts.lock().unwrap().push(timeout);
            Ok(())
        }

        async fn close(&self) -> Result<(), FetchError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }
}
