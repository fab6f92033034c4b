use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, Map};
use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "HARVESTER";
const DEFAULT_CONFIG_FILE: &str = "harvester";

/// Everything a run needs. Loaded from defaults, an optional `harvester.toml`,
/// `HARVESTER_*` environment variables and finally CLI overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub target_url: String,
    pub output_file: String,
    pub file_prefix: String,
    pub start_serial: u64,
    pub out_dir: PathBuf,
    pub api_keys: Vec<String>,
    pub generate_variations: bool,
    pub ledger_path: PathBuf,
    pub browser: BrowserSettings,
    pub harvest: HarvestSettings,
    pub extract: ExtractSettings,
    pub format: FormatSettings,
    pub generation: GenerationSettings,
    pub post: PostSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            output_file: String::new(),
            file_prefix: String::new(),
            start_serial: 1,
            out_dir: PathBuf::from("."),
            api_keys: Vec::new(),
            generate_variations: false,
            ledger_path: PathBuf::from("data/harvester.sqlite"),
            browser: BrowserSettings::default(),
            harvest: HarvestSettings::default(),
            extract: ExtractSettings::default(),
            format: FormatSettings::default(),
            generation: GenerationSettings::default(),
            post: PostSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".into(),
            args: vec![
                "--headless=new".into(),
                "--no-sandbox".into(),
                "--disable-dev-shm-usage".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestSettings {
    pub min_links: usize,
    pub max_attempts: usize,
    pub scroll_pause_secs: f64,
    pub card_selector: String,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            min_links: 1000,
            max_attempts: 4,
            scroll_pause_secs: 15.0,
            card_selector: "a.prompt-card".into(),
        }
    }
}

impl HarvestSettings {
    pub fn scroll_pause(&self) -> Duration {
        secs(self.scroll_pause_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractSettings {
    pub page_load_timeout_secs: f64,
    pub default_page_load_timeout_secs: f64,
    pub settle_secs: f64,
    pub container_wait_secs: f64,
    pub container_id: String,
    pub paragraph_tag: String,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            page_load_timeout_secs: 5.0,
            default_page_load_timeout_secs: 300.0,
            settle_secs: 2.0,
            container_wait_secs: 1.0,
            container_id: "editorEl".into(),
            paragraph_tag: "p".into(),
        }
    }
}

impl ExtractSettings {
    pub fn page_load_timeout(&self) -> Duration {
        secs(self.page_load_timeout_secs)
    }

    pub fn default_page_load_timeout(&self) -> Duration {
        secs(self.default_page_load_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        secs(self.settle_secs)
    }

    pub fn container_wait(&self) -> Duration {
        secs(self.container_wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormatSettings {
    pub target_version: String,
    pub file_extension: String,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            target_version: "6.1".into(),
            file_extension: "jpg".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub model: String,
    /// Overrides the public Gemini endpoint.
    pub api_base_url: Option<String>,
    pub variation_batch_size: usize,
    pub variation_temperature: f32,
    pub metadata_batch_size: usize,
    pub metadata_max_retries: u32,
    pub metadata_temperature: f32,
    pub key_rotation_interval: usize,
    pub retry_backoff_secs: f64,
    pub inter_batch_secs: f64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".into(),
            api_base_url: None,
            variation_batch_size: 3,
            variation_temperature: 0.7,
            metadata_batch_size: 5,
            metadata_max_retries: 3,
            metadata_temperature: 0.4,
            key_rotation_interval: 350,
            retry_backoff_secs: 5.0,
            inter_batch_secs: 5.0,
        }
    }
}

impl GenerationSettings {
    pub fn retry_backoff(&self) -> Duration {
        secs(self.retry_backoff_secs)
    }

    pub fn inter_batch(&self) -> Duration {
        secs(self.inter_batch_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostSettings {
    pub max_keywords: usize,
    pub versions: Vec<String>,
}

impl Default for PostSettings {
    fn default() -> Self {
        Self {
            max_keywords: 48,
            versions: ["V1", "V2", "V3", "V4"].map(String::from).to_vec(),
        }
    }
}

/// Values supplied on the command line; `None` leaves the loaded value alone.
#[derive(Debug, Default)]
pub struct Overrides {
    pub target_url: Option<String>,
    pub output_file: Option<String>,
    pub file_prefix: Option<String>,
    pub start_serial: Option<u64>,
    pub max_attempts: Option<usize>,
    pub api_keys: Vec<String>,
    pub generate_variations: bool,
    pub webdriver_url: Option<String>,
    pub out_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings. `file` replaces the default `harvester.toml` lookup.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_env(file, None)
    }

    /// `env` replaces the process environment when given.
    fn load_with_env(file: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        Config::builder()
            .add_source(file_source)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api_keys")
                    .with_list_parse_key("post.versions")
                    .with_list_parse_key("browser.args")
                    .source(env),
            )
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.target_url {
            self.target_url = v;
        }
        if let Some(v) = o.output_file {
            self.output_file = v;
        }
        if let Some(v) = o.file_prefix {
            self.file_prefix = v;
        }
        if let Some(v) = o.start_serial {
            self.start_serial = v;
        }
        if let Some(v) = o.max_attempts {
            self.harvest.max_attempts = v;
        }
        if !o.api_keys.is_empty() {
            self.api_keys = o.api_keys;
        }
        if o.generate_variations {
            self.generate_variations = true;
        }
        if let Some(v) = o.webdriver_url {
            self.browser.webdriver_url = v;
        }
        if let Some(v) = o.out_dir {
            self.out_dir = v;
        }
    }

    /// Reject incomplete configuration before any stage starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::Missing("target_url"));
        }
        if self.output_file.trim().is_empty() {
            return Err(ConfigError::Missing("output_file"));
        }
        if self.file_prefix.trim().is_empty() {
            return Err(ConfigError::Missing("file_prefix"));
        }
        if self.api_keys.is_empty() {
            return Err(ConfigError::NoCredentials);
        }
        if let Some(i) = self.api_keys.iter().position(|k| k.trim().is_empty()) {
            return Err(ConfigError::BlankCredential(i + 1));
        }
        if self.harvest.max_attempts == 0 {
            return Err(ConfigError::Zero("harvest.max_attempts"));
        }
        let g = &self.generation;
        if g.variation_batch_size == 0 {
            return Err(ConfigError::Zero("generation.variation_batch_size"));
        }
        if g.metadata_batch_size == 0 {
            return Err(ConfigError::Zero("generation.metadata_batch_size"));
        }
        if g.metadata_max_retries == 0 {
            return Err(ConfigError::Zero("generation.metadata_max_retries"));
        }
        if g.key_rotation_interval == 0 {
            return Err(ConfigError::Zero("generation.key_rotation_interval"));
        }

        let delays = [
            ("harvest.scroll_pause_secs", self.harvest.scroll_pause_secs),
            ("extract.page_load_timeout_secs", self.extract.page_load_timeout_secs),
            (
                "extract.default_page_load_timeout_secs",
                self.extract.default_page_load_timeout_secs,
            ),
            ("extract.settle_secs", self.extract.settle_secs),
            ("extract.container_wait_secs", self.extract.container_wait_secs),
            ("generation.retry_backoff_secs", g.retry_backoff_secs),
            ("generation.inter_batch_secs", g.inter_batch_secs),
        ];
        for (name, value) in delays {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::InvalidDuration(name));
            }
        }
        Ok(())
    }
}

/// Values rejected by `validate` fall back to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}
