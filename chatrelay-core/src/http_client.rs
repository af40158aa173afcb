use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::{Client, Response};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Raw response body chunks, transport errors already mapped.
pub type ByteStream = futures::stream::BoxStream<'static, CoreResult<Bytes>>;

/// Bytes of a fetched resource plus its declared content type.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
///
/// Every helper takes an `upstream` label that ends up in errors and logs.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    /// Total time budget of the request/response helpers. Streams are bounded
    /// by their consumer instead.
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chatrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        upstream: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = send(upstream, req).await?;
        decode_json(upstream, resp).await
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        upstream: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> CoreResult<R> {
        let mut req = self
            .inner
            .get(url)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = send(upstream, req).await?;
        decode_json(upstream, resp).await
    }

    /// POST a form-encoded body with query parameters and decode a JSON answer.
    pub async fn post_form<R: DeserializeOwned>(
        &self,
        upstream: &str,
        url: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> CoreResult<R> {
        let req = self
            .inner
            .post(url)
            .query(query)
            .form(form)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent);
        let resp = send(upstream, req).await?;
        decode_json(upstream, resp).await
    }

    /// POST JSON and hand back the response body as a raw chunk stream.
    ///
    /// Fails before any chunk is produced if the status is not a success or
    /// the upstream declares an empty body.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        upstream: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<ByteStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        let resp = send(upstream, req).await?;
        if resp.content_length() == Some(0) {
            return Err(RelayError::EmptyBody {
                upstream: upstream.to_string(),
            });
        }

        let label = upstream.to_string();
        let stream = resp.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| RelayError::Connection {
                upstream: label.clone(),
                reason: e.to_string(),
            })
        });
        Ok(stream.boxed())
    }

    /// GET a resource as raw bytes, keeping its `Content-Type`.
    pub async fn get_bytes(&self, upstream: &str, url: &str) -> CoreResult<FetchedResource> {
        let req = self
            .inner
            .get(url)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent);
        let resp = send(upstream, req).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = resp.bytes().await.map_err(|e| RelayError::Connection {
            upstream: upstream.to_string(),
            reason: e.to_string(),
        })?;
        Ok(FetchedResource {
            bytes,
            content_type,
        })
    }
}

/// Send and reject non-success statuses.
async fn send(upstream: &str, req: reqwest::RequestBuilder) -> CoreResult<Response> {
    let resp = req.send().await.map_err(|e| RelayError::Connection {
        upstream: upstream.to_string(),
        reason: e.to_string(),
    })?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        tracing::debug!(
            target: "chatrelay_core::http_client",
            upstream,
            status = status.as_u16(),
            "upstream rejected request"
        );
        return Err(RelayError::HttpStatus {
            upstream: upstream.to_string(),
            status,
            body: truncate(&text, 300),
        });
    }
    Ok(resp)
}

async fn decode_json<R: DeserializeOwned>(upstream: &str, resp: Response) -> CoreResult<R> {
    resp.json::<R>().await.map_err(|e| {
        RelayError::Other(anyhow::anyhow!("{upstream}: json decode error: {e}"))
    })
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut t = s[..cut].to_string();
    t.push_str("...");
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    #[tokio::test]
    async fn post_json_success() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat").header("authorization", "Bearer k");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;

        #[derive(serde::Deserialize)]
        struct Resp {
            ok: bool,
        }

        let client = HttpClient::new_default().unwrap();
        let resp: Resp = client
            .post_json("test", &server.url("/chat"), &json!({"msg":"hi"}), &[("Authorization", "Bearer k")])
            .await
            .unwrap();
        assert!(resp.ok);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn status_error_carries_code_and_truncated_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat");
                then.status(400).body("x".repeat(1000));
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_json::<_, serde_json::Value>("test", &server.url("/chat"), &json!({}), &[])
            .await
            .unwrap_err();
        match err {
            RelayError::HttpStatus { status, body, .. } => {
                assert_eq!(status.as_u16(), 400);
                assert!(body.ends_with("..."));
                assert!(body.len() <= 303);
            }
            other => panic!("expected HttpStatus, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_json_maps_to_other() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/task");
                then.status(200).body("not-json");
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let err = client
            .get_json::<serde_json::Value>("test", &server.url("/task"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Other(_)));
    }

    #[tokio::test]
    async fn network_error_maps_to_connection() {
        let client = HttpClient::new_default().unwrap();
        // port 9 (discard) is typically closed
        let err = client
            .get_json::<serde_json::Value>("test", "http://127.0.0.1:9/x", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }));
    }

    #[tokio::test]
    async fn post_stream_yields_body_chunks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/stream").header("accept", "text/event-stream");
                then.status(200).body("data: a\n\ndata: b\n");
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let mut stream = client
            .post_stream("test", &server.url("/stream"), &json!({}), &[])
            .await
            .unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"data: a\n\ndata: b\n");
    }

    #[tokio::test]
    async fn post_stream_rejects_empty_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/stream");
                then.status(200);
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_stream("test", &server.url("/stream"), &json!({}), &[])
            .await
            .err()
            .expect("empty body must fail");
        assert!(matches!(err, RelayError::EmptyBody { .. }));
    }

    #[tokio::test]
    async fn get_bytes_keeps_content_type() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/img.png");
                then.status(200).header("content-type", "image/png").body([1u8, 2, 3]);
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let res = client.get_bytes("test", &server.url("/img.png")).await.unwrap();
        assert_eq!(res.bytes.as_ref(), &[1u8, 2, 3]);
        assert_eq!(res.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn post_form_sends_query_and_fields() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/ocr")
                    .query_param("access_token", "t")
                    .x_www_form_urlencoded_tuple("image", "aGk=");
                then.status(200).json_body(json!({"words_result": []}));
            })
            .await;
        let client = HttpClient::new_default().unwrap();
        let v: serde_json::Value = client
            .post_form("test", &server.url("/ocr"), &[("access_token", "t")], &[("image", "aGk=")])
            .await
            .unwrap();
        assert_eq!(v["words_result"], json!([]));
        m.assert_async().await;
    }

    #[tokio::test]
    async fn request_timeout_bounds_helpers_but_not_streams() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({"ok": true}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/slow-stream");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .body("data: [DONE]\n");
            })
            .await;
        let client = HttpClient::new(&HttpCfg {
            request_timeout_ms: 100,
            ..HttpCfg::default()
        })
        .unwrap();

        let err = client
            .get_json::<serde_json::Value>("test", &server.url("/slow"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Connection { .. }), "{err:?}");

        let mut stream = client
            .post_stream("test", &server.url("/slow-stream"), &json!({}), &[])
            .await
            .unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"data: [DONE]\n");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let t = truncate(&s, 5);
        assert!(t.ends_with("..."));
        assert_eq!(truncate("short", 300), "short");
    }
}
