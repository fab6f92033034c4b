pub mod gemini;

use std::fmt;

use async_trait::async_trait;

use crate::error::{ConfigError, GenerationError};

pub use gemini::GeminiClient;

/// Keys this short get a fixed mask instead of a visible tail.
const MIN_LEN_FOR_TAIL: usize = 12;

/// An API key. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.chars().count() < MIN_LEN_FOR_TAIL {
            return f.write_str("Credential(****)");
        }
        let tail: String = self
            .0
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        write!(f, "Credential(…{})", tail)
    }
}

/// Ordered, non-empty list of credentials. Which one is active is derived from
/// the processed-item count, so the pool itself holds no cursor state.
#[derive(Debug, Clone)]
pub struct KeyPool {
    keys: Vec<Credential>,
    rotation_interval: usize,
}

impl KeyPool {
    pub fn new(keys: Vec<Credential>, rotation_interval: usize) -> Result<Self, ConfigError> {
        if keys.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        if rotation_interval == 0 {
            return Err(ConfigError::Zero("key_rotation_interval"));
        }
        Ok(Self {
            keys,
            rotation_interval,
        })
    }

    pub fn from_strings(keys: &[String], rotation_interval: usize) -> Result<Self, ConfigError> {
        Self::new(
            keys.iter().map(|k| Credential::new(k.trim())).collect(),
            rotation_interval,
        )
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Cursor after `processed` items: one step per full rotation interval.
    pub fn cursor_for(&self, processed: usize) -> usize {
        (processed / self.rotation_interval) % self.keys.len()
    }

    pub fn get(&self, cursor: usize) -> &Credential {
        &self.keys[cursor % self.keys.len()]
    }
}

/// Text generation capability. The credential is passed on every call.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        credential: &Credential,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, interval: usize) -> KeyPool {
        let keys = (1..=n).map(|i| format!("key-{}", i)).collect::<Vec<_>>();
        KeyPool::from_strings(&keys, interval).unwrap()
    }

    #[test]
    fn cursor_is_pure_function_of_processed_count() {
        let p = pool(3, 350);
        assert_eq!(p.cursor_for(0), 0);
        assert_eq!(p.cursor_for(349), 0);
        for k in 0..10 {
            assert_eq!(p.cursor_for(k * 350), k % 3);
        }
    }

    #[test]
    fn single_key_never_moves() {
        let p = pool(1, 5);
        assert_eq!(p.cursor_for(1_000), 0);
        assert_eq!(p.get(p.cursor_for(1_000)).expose(), "key-1");
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert_eq!(
            KeyPool::new(Vec::new(), 350).unwrap_err(),
            ConfigError::NoCredentials
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let c = Credential::new("AIzaSECRETabcd");
        assert_eq!(format!("{:?}", c), "Credential(…abcd)");
    }

    #[test]
    fn debug_masks_short_keys_entirely() {
        for secret in ["", "k1", "abcd", "abcdefghijk"] {
            assert_eq!(format!("{:?}", Credential::new(secret)), "Credential(****)");
        }
        assert_eq!(format!("{:?}", Credential::new("abcdefghijkl")), "Credential(…ijkl)");
    }
}
