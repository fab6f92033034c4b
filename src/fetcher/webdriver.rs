use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use super::PageFetcher;
use crate::error::FetchError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight);";
const FIND_ALL_SCRIPT: &str = "return Array.from(document.querySelectorAll(arguments[0]))\
     .map(e => e[arguments[1]] ?? e.getAttribute(arguments[1]))\
     .filter(v => v !== null && v !== undefined);";
const EXISTS_SCRIPT: &str = "return document.getElementById(arguments[0]) !== null;";
const TEXT_SCRIPT: &str = "const el = document.getElementById(arguments[0]);\
     if (!el) { return null; }\
     return Array.from(el.getElementsByTagName(arguments[1])).map(e => e.innerText);";

/// Minimal W3C WebDriver client (chromedriver, geckodriver, selenium grid).
pub struct WebDriverFetcher {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
    closed: AtomicBool,
}

impl WebDriverFetcher {
    /// Open a new browser session on the WebDriver endpoint at `base_url`.
    pub async fn connect(base_url: &str, args: &[String]) -> Result<Self, FetchError> {
        let http = reqwest::Client::new();
        let base_url = base_url.trim_end_matches('/').to_string();

        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });

        let value = send(&http, Method::POST, &format!("{}/session", base_url), Some(capabilities)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Protocol {
                code: "session not created".into(),
                message: value.to_string(),
            })?
            .to_string();

        debug!(session = %session_id, "WebDriver session opened");
        Ok(Self {
            http,
            base_url,
            session_id,
            closed: AtomicBool::new(false),
        })
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, FetchError> {
        let url = format!("{}/session/{}{}", self.base_url, self.session_id, path);
        send(&self.http, method, &url, body).await
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value, FetchError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }
}

#[async_trait]
impl PageFetcher for WebDriverFetcher {
    async fn load(&self, url: &str) -> Result<(), FetchError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn scroll_to_bottom(&self) -> Result<(), FetchError> {
        self.execute(SCROLL_SCRIPT, json!([])).await.map(|_| ())
    }

    async fn find_all(&self, selector: &str, attribute: &str) -> Result<Vec<String>, FetchError> {
        let value = self.execute(FIND_ALL_SCRIPT, json!([selector, attribute])).await?;
        Ok(string_list(&value))
    }

    async fn wait_for(&self, container_id: &str, timeout: Duration) -> Result<(), FetchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self.execute(EXISTS_SCRIPT, json!([container_id])).await?;
            if found.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FetchError::NotFound(container_id.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn find_text(&self, container_id: &str, tag: &str) -> Result<Vec<String>, FetchError> {
        let value = self.execute(TEXT_SCRIPT, json!([container_id, tag])).await?;
        if value.is_null() {
            return Err(FetchError::NotFound(container_id.to_string()));
        }
        Ok(string_list(&value))
    }

    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<(), FetchError> {
        self.command(
            Method::POST,
            "/timeouts",
            Some(json!({ "pageLoad": timeout.as_millis() as u64 })),
        )
        .await
        .map(|_| ())
    }

    async fn close(&self) -> Result<(), FetchError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }
}

async fn send(
    http: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, FetchError> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let text = response.text().await?;
    let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
    decode(status, parsed)
}

/// Unwrap a WebDriver response envelope `{"value": ...}`, mapping error payloads.
fn decode(status: u16, body: Value) -> Result<Value, FetchError> {
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if let Some(code) = value.get("error").and_then(Value::as_str) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(match code {
            "timeout" | "script timeout" => FetchError::Timeout(message),
            "no such element" => FetchError::NotFound(message),
            _ => FetchError::Protocol {
                code: code.to_string(),
                message,
            },
        });
    }

    if !(200..300).contains(&status) {
        return Err(FetchError::Protocol {
            code: format!("http {}", status),
            message: body.to_string(),
        });
    }

    Ok(value)
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
