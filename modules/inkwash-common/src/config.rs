use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "INKWASH_CONFIG";
/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_NAME: &str = "inkwash.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

/// HTTP client settings shared by every channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-operation timeout in seconds.
    pub timeout: f64,
    /// Lower bound of the randomized pre-request delay, seconds.
    pub min_delay: f64,
    /// Upper bound of the randomized pre-request delay, seconds.
    pub max_delay: f64,
    /// Attempt ceiling for 429 retries on the direct transport.
    pub max_attempts: u32,
    /// Backoff multiplier used when the server sends no Retry-After hint.
    pub backoff_factor: f64,
    /// "auto", "direct", or "browser".
    pub transport: String,
    /// Overlay the persisted header snapshot onto the fallback header set.
    pub use_captured_headers: bool,
    /// Body substrings that mark an anti-bot challenge page.
    pub challenge_markers: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: 30.0,
            min_delay: 0.0,
            max_delay: 0.0,
            max_attempts: 3,
            backoff_factor: 1.5,
            transport: "auto".to_string(),
            use_captured_headers: true,
            challenge_markers: Vec::new(),
        }
    }
}

/// Filesystem layout. Relative entries are resolved against the directory
/// containing the config file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub cookie_jar: Option<PathBuf>,
    pub header_jar: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub model: String,
    pub base_url: String,
    pub timeout: f64,
    pub max_retries: u32,
    pub backoff_seconds: f64,
    pub temperature: f64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout: 30.0,
            max_retries: 3,
            backoff_seconds: 2.0,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeChatConfig {
    pub base_url: String,
    pub timeout: f64,
}

impl Default for WeChatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.weixin.qq.com".to_string(),
            timeout: 30.0,
        }
    }
}

/// Per-channel settings: where to fetch from and which prompts drive the
/// AI stages. Prompts receive the source text appended after the template.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub source_url: String,
    pub translate_prompt: Option<String>,
    pub format_prompt: Option<String>,
    pub title_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    http: HttpConfig,
    paths: PathsConfig,
    pipeline: PipelineConfig,
    gemini: GeminiConfig,
    wechat: WeChatConfig,
    channel: BTreeMap<String, ChannelConfig>,
}

/// Resolved filesystem layout. All paths are absolute or relative to the
/// process working directory, never to the config file.
#[derive(Debug, Clone)]
pub struct PathSettings {
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub cookie_jar: PathBuf,
    pub header_jar: PathBuf,
}

impl PathSettings {
    fn resolve(raw: &PathsConfig, root: &Path) -> Self {
        let to_abs = |p: &PathBuf| -> PathBuf {
            if p.is_absolute() {
                p.clone()
            } else {
                root.join(p)
            }
        };
        let data_dir = raw
            .data_dir
            .as_ref()
            .map(&to_abs)
            .unwrap_or_else(|| root.join("data"));
        let state_dir = raw
            .state_dir
            .as_ref()
            .map(&to_abs)
            .unwrap_or_else(|| data_dir.join("state"));
        let cookie_jar = raw
            .cookie_jar
            .as_ref()
            .map(&to_abs)
            .unwrap_or_else(|| state_dir.join("cookies.txt"));
        let header_jar = raw
            .header_jar
            .as_ref()
            .map(&to_abs)
            .unwrap_or_else(|| state_dir.join("headers.json"));
        Self {
            data_dir,
            state_dir,
            cookie_jar,
            header_jar,
        }
    }

    pub fn channel_root(&self, channel: &str) -> PathBuf {
        self.data_dir.join(channel)
    }

    pub fn raw_for(&self, channel: &str) -> PathBuf {
        self.channel_root(channel).join("raw")
    }

    pub fn translated_for(&self, channel: &str) -> PathBuf {
        self.channel_root(channel).join("translated")
    }

    pub fn formatted_for(&self, channel: &str) -> PathBuf {
        self.channel_root(channel).join("formatted")
    }

    pub fn titles_for(&self, channel: &str) -> PathBuf {
        self.channel_root(channel).join("titles")
    }

    pub fn pipeline_state_dir(&self) -> PathBuf {
        self.state_dir.join("pipeline")
    }
}

/// Application configuration, constructed once at process start and passed
/// by reference into the fetch client and the pipeline runner.
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub paths: PathSettings,
    pub pipeline: PipelineConfig,
    pub gemini: GeminiConfig,
    pub wechat: WeChatConfig,
    pub channels: BTreeMap<String, ChannelConfig>,
    /// Directory containing the config file; header templates live here.
    pub config_dir: PathBuf,
}

impl Config {
    /// Load configuration from `explicit`, `$INKWASH_CONFIG`, or
    /// `./inkwash.toml`, in that order of precedence.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match env::var(CONFIG_ENV_VAR) {
                Ok(value) => PathBuf::from(value),
                Err(_) => PathBuf::from(DEFAULT_CONFIG_NAME),
            },
        };
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            http: raw.http,
            paths: PathSettings::resolve(&raw.paths, &config_dir),
            pipeline: raw.pipeline,
            gemini: raw.gemini,
            wechat: raw.wechat,
            channels: raw.channel,
            config_dir,
        })
    }

    pub fn channel(&self, name: &str) -> Result<&ChannelConfig, ConfigError> {
        self.channels
            .get(name)
            .ok_or_else(|| ConfigError::UnknownChannel(name.to_string()))
    }

    /// Resolve the channel to operate on: explicit flag, else the configured
    /// default, else the first registered channel.
    pub fn resolve_channel(&self, override_name: Option<&str>) -> Result<String, ConfigError> {
        if let Some(name) = override_name {
            return Ok(name.to_string());
        }
        if let Some(name) = &self.pipeline.default_channel {
            return Ok(name.clone());
        }
        self.channels
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| ConfigError::UnknownChannel("<none configured>".to_string()))
    }

    /// Log the effective configuration without leaking anything secret.
    pub fn log_summary(&self) {
        info!(
            transport = self.http.transport.as_str(),
            timeout = self.http.timeout,
            max_attempts = self.http.max_attempts,
            channels = self.channels.len(),
            data_dir = %self.paths.data_dir.display(),
            "Configuration loaded"
        );
    }
}
