//! Synchronous text-extraction bridge (Baidu OCR).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::config::OcrCfg;
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;

const TRACING_TARGET: &str = "chatrelay_core::ocr";

/// Label used in errors and logs for this upstream.
pub const UPSTREAM_OCR: &str = "ocr";

#[derive(Deserialize)]
struct TokenResp {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrClient {
    http: HttpClient,
    base: String,
    api_key: Option<SecretString>,
    secret_key: Option<SecretString>,
    api_key_env: String,
    secret_key_env: String,
}

impl OcrClient {
    pub fn from_config(
        http: HttpClient,
        api_key: Option<SecretString>,
        secret_key: Option<SecretString>,
        cfg: &OcrCfg,
    ) -> Self {
        Self {
            http,
            base: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            secret_key,
            api_key_env: cfg.api_key_env.clone(),
            secret_key_env: cfg.secret_key_env.clone(),
        }
    }

    /// Extract text from `image` (bare base64 or a `data:` URL).
    ///
    /// Returns the provider's JSON with an extra top-level `text` field:
    /// recognised lines joined by `\n`, or `null` when nothing was found.
    pub async fn recognize(&self, image: &str) -> CoreResult<Value> {
        let payload = normalize_image(image)?;
        let token = self.access_token().await?;

        let url = format!("{}/rest/2.0/ocr/v1/accurate_basic", self.base);
        let raw: Value = self
            .http
            .post_form(
                UPSTREAM_OCR,
                &url,
                &[("access_token", token.expose_secret())],
                &[
                    ("image", payload.as_str()),
                    ("detect_direction", "false"),
                    ("paragraph", "false"),
                    ("probability", "false"),
                    ("multidirectional_recognize", "false"),
                ],
            )
            .await?;

        // Provider-level failures still come back as 200.
        if let Some(code) = raw.get("error_code") {
            let msg = raw.get("error_msg").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(RelayError::Ocr(format!("provider error {code}: {msg}")));
        }

        let out = with_text(raw);
        tracing::debug!(
            target: TRACING_TARGET,
            found = !out["text"].is_null(),
            "text extraction finished"
        );
        Ok(out)
    }

    async fn access_token(&self) -> CoreResult<SecretString> {
        let ak = self.api_key.as_ref().ok_or_else(|| RelayError::MissingCredential {
            env: self.api_key_env.clone(),
        })?;
        let sk = self.secret_key.as_ref().ok_or_else(|| RelayError::MissingCredential {
            env: self.secret_key_env.clone(),
        })?;

        let url = format!("{}/oauth/2.0/token", self.base);
        let resp: TokenResp = self
            .http
            .post_form(
                UPSTREAM_OCR,
                &url,
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", ak.expose_secret()),
                    ("client_secret", sk.expose_secret()),
                ],
                &[],
            )
            .await?;
        resp.access_token
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::new(t.into()))
            .ok_or_else(|| RelayError::Ocr("token response carried no access_token".to_string()))
    }
}

/// Strip an optional `data:<type>;base64,` prefix and check the rest decodes.
pub fn normalize_image(input: &str) -> CoreResult<String> {
    let input = input.trim();
    let payload = if input.starts_with("data:") {
        let (_, data) = input
            .split_once(',')
            .ok_or_else(|| RelayError::MessageFormat("data URL has no payload".to_string()))?;
        data
    } else {
        input
    };
    if payload.is_empty() {
        return Err(RelayError::MessageFormat("image must not be empty".to_string()));
    }
    STANDARD
        .decode(payload)
        .map_err(|e| RelayError::MessageFormat(format!("image is not valid base64: {e}")))?;
    Ok(payload.to_string())
}

/// `words_result[*].words` joined by newlines; `None` when there is no text.
pub fn extract_text(raw: &Value) -> Option<String> {
    let lines: Vec<&str> = raw
        .get("words_result")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|w| w.get("words").and_then(Value::as_str))
                .filter(|w| !w.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn with_text(mut raw: Value) -> Value {
    let text = extract_text(&raw);
    if let Value::Object(map) = &mut raw {
        map.insert("text".to_string(), text.map(Value::String).unwrap_or(Value::Null));
    }
    raw
}
