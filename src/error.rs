use thiserror::Error;

/// Failures surfaced by a page fetcher. `Timeout` is kept apart from the
/// rest so callers can log it and carry on with a partially rendered page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("element not found: {0}")]
    NotFound(String),

    #[error("webdriver error ({code}): {message}")]
    Protocol { code: String, message: String },

    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Failures surfaced by the text generation service.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("response contained no text")]
    EmptyResponse,
}

impl GenerationError {
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            429 => GenerationError::RateLimited(message),
            500 => GenerationError::Server(message),
            503 => GenerationError::Unavailable(message),
            _ => GenerationError::Api { status, message },
        }
    }

    /// Quota and availability failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited(_)
                | GenerationError::Server(_)
                | GenerationError::Unavailable(_)
                | GenerationError::Network(_)
        )
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Network(err.to_string())
    }
}

/// Configuration rejected before a run starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("at least one API key is required")]
    NoCredentials,

    #[error("API key {0} is blank")]
    BlankCredential(usize),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} is not a usable number of seconds")]
    InvalidDuration(&'static str),
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error on {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("table {path} has no column {column}")]
    MissingColumn { path: String, column: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert!(matches!(
            GenerationError::from_status(429, "slow down".into()),
            GenerationError::RateLimited(_)
        ));
        assert!(matches!(
            GenerationError::from_status(503, String::new()),
            GenerationError::Unavailable(_)
        ));
        let other = GenerationError::from_status(400, "bad key".into());
        assert!(!other.is_retryable());
        assert_eq!(other.to_string(), "API error (status 400): bad key");
    }

    #[test]
    fn retryable_variants() {
        assert!(GenerationError::Server("x".into()).is_retryable());
        assert!(GenerationError::Network("reset".into()).is_retryable());
        assert!(!GenerationError::EmptyResponse.is_retryable());
    }
}
