use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::error::{CoreResult, RelayError};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Single origin allowed for cross-origin requests. `None` allows any.
    #[serde(default)]
    pub allowed_origin: Option<String>,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            port: default_port(),
            allowed_origin: None,
        }
    }
}

fn default_port() -> u16 {
    3001
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatCfg {
    #[serde(default = "default_chat_base")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_chat_key_env")]
    pub api_key_env: String,
    /// Wall-clock budget for one whole exchange, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for ChatCfg {
    fn default() -> Self {
        Self {
            base_url: default_chat_base(),
            model: default_chat_model(),
            api_key_env: default_chat_key_env(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

impl ChatCfg {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_chat_base() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}
fn default_chat_model() -> String {
    "glm-3-turbo".to_string()
}
fn default_chat_key_env() -> String {
    "ZHIPU_API_KEY".to_string()
}
fn default_deadline_secs() -> u64 {
    30
}

/// Who drives the image task to completion.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// `submit` blocks while the relay polls upstream until a terminal state.
    #[default]
    Server,
    /// `submit` returns a task id; the client polls the result endpoint.
    Client,
}

impl std::str::FromStr for PollMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(RelayError::Config(format!("unknown poll mode '{other}'"))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImageCfg {
    #[serde(default = "default_image_base")]
    pub base_url: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_size")]
    pub size: String,
    #[serde(default = "default_image_count")]
    pub n: u32,
    #[serde(default = "default_image_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// `None` polls until upstream reports a terminal state, however long that takes.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: Option<u32>,
    #[serde(default)]
    pub poll_mode: PollMode,
}

impl Default for ImageCfg {
    fn default() -> Self {
        Self {
            base_url: default_image_base(),
            model: default_image_model(),
            size: default_image_size(),
            n: default_image_count(),
            api_key_env: default_image_key_env(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_mode: PollMode::default(),
        }
    }
}

impl ImageCfg {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_image_base() -> String {
    "https://dashscope.aliyuncs.com/api/v1".to_string()
}
fn default_image_model() -> String {
    "wanx2.1-t2i-turbo".to_string()
}
fn default_image_size() -> String {
    "512*512".to_string()
}
fn default_image_count() -> u32 {
    1
}
fn default_image_key_env() -> String {
    "GENERATE_IMG_API_KEY".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_max_poll_attempts() -> Option<u32> {
    Some(90)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OcrCfg {
    #[serde(default = "default_ocr_base")]
    pub base_url: String,
    #[serde(default = "default_ocr_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_ocr_secret_env")]
    pub secret_key_env: String,
}

impl Default for OcrCfg {
    fn default() -> Self {
        Self {
            base_url: default_ocr_base(),
            api_key_env: default_ocr_key_env(),
            secret_key_env: default_ocr_secret_env(),
        }
    }
}

fn default_ocr_base() -> String {
    "https://aip.baidubce.com".to_string()
}
fn default_ocr_key_env() -> String {
    "BAIDU_OCR_API_KEY".to_string()
}
fn default_ocr_secret_env() -> String {
    "BAIDU_OCR_SECRET_KEY".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub chat: ChatCfg,
    #[serde(default)]
    pub image: ImageCfg,
    #[serde(default)]
    pub ocr: OcrCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(RelayError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?
            }
            Some("toml") => toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| RelayError::Other(e.into()))
                .or_else(|_| toml::from_str::<Self>(s).map_err(|e| RelayError::Other(e.into())))?,
        };
        Ok(cfg)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> CoreResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup. Unset or empty keys are ignored.
    pub fn apply_vars<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| RelayError::Config(format!("PORT '{port}': {e}")))?;
        }
        if let Some(origin) = get("ALLOWED_ORIGIN") {
            self.server.allowed_origin = Some(origin);
        }
        if let Some(model) = get("CHAT_MODEL") {
            self.chat.model = model;
        }
        if let Some(base) = get("CHAT_BASE_URL") {
            self.chat.base_url = base;
        }
        if let Some(base) = get("IMAGE_BASE_URL") {
            self.image.base_url = base;
        }
        if let Some(base) = get("OCR_BASE_URL") {
            self.ocr.base_url = base;
        }
        if let Some(mode) = get("IMAGE_POLL_MODE") {
            self.image.poll_mode = mode.parse()?;
        }
        if let Some(max) = get("IMAGE_MAX_POLL_ATTEMPTS") {
            let n: u32 = max
                .trim()
                .parse()
                .map_err(|e| RelayError::Config(format!("IMAGE_MAX_POLL_ATTEMPTS '{max}': {e}")))?;
            self.image.max_poll_attempts = (n > 0).then_some(n);
        }
        Ok(())
    }
}

/// Upstream credentials, resolved once at startup and never mutated.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub chat: Option<SecretString>,
    pub image: Option<SecretString>,
    pub ocr_key: Option<SecretString>,
    pub ocr_secret: Option<SecretString>,
}

impl Credentials {
    pub fn from_env(cfg: &Config) -> Self {
        Self::from_lookup(cfg, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(cfg: &Config, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = |env: &str| {
            lookup(env)
                .filter(|v| !v.is_empty())
                .map(|v| SecretString::new(v.into()))
        };
        Self {
            chat: secret(&cfg.chat.api_key_env),
            image: secret(&cfg.image.api_key_env),
            ocr_key: secret(&cfg.ocr.api_key_env),
            ocr_secret: secret(&cfg.ocr.secret_key_env),
        }
    }
}
