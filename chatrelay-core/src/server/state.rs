use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, Credentials};
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::ocr::OcrClient;
use crate::provider::{ChatStreamProvider, UnconfiguredProvider};
use crate::task::{DashScopeApi, ImageTaskBridge};
use crate::upstream::UpstreamStreamClient;

use super::TRACING_TARGET;

/// Everything handlers and sessions share. Built once at startup; read-only.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<dyn ChatStreamProvider>,
    pub deadline: Duration,
    pub images: Arc<ImageTaskBridge>,
    pub ocr: Arc<OcrClient>,
}

impl AppState {
    /// Wire the upstream clients from configuration. Missing credentials
    /// are reported here and surface as `MissingCredential` on use.
    pub fn from_config(cfg: &Config, creds: Credentials) -> CoreResult<Self> {
        if cfg.chat.deadline_secs == 0 {
            return Err(RelayError::Config("chat.deadline_secs must be positive".to_string()));
        }
        let http = HttpClient::new(&cfg.http)?;

        let chat: Arc<dyn ChatStreamProvider> = match creds.chat {
            Some(key) => Arc::new(UpstreamStreamClient::from_config(http.clone(), key, &cfg.chat)),
            None => {
                tracing::warn!(target: TRACING_TARGET, env = %cfg.chat.api_key_env, "chat credential not set; exchanges will fail");
                Arc::new(UnconfiguredProvider::new(cfg.chat.api_key_env.clone()))
            }
        };
        if creds.image.is_none() {
            tracing::warn!(target: TRACING_TARGET, env = %cfg.image.api_key_env, "image credential not set");
        }
        if creds.ocr_key.is_none() || creds.ocr_secret.is_none() {
            tracing::warn!(target: TRACING_TARGET, "ocr credentials not set");
        }

        let image_api = DashScopeApi::from_config(http.clone(), creds.image, &cfg.image);
        let images = ImageTaskBridge::new(Arc::new(image_api), &cfg.image);
        let ocr = OcrClient::from_config(http, creds.ocr_key, creds.ocr_secret, &cfg.ocr);

        Ok(Self {
            chat,
            deadline: cfg.chat.deadline(),
            images: Arc::new(images),
            ocr: Arc::new(ocr),
        })
    }
}
