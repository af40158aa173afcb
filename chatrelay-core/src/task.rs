//! Submit/poll bridge for the asynchronous image-synthesis upstream.
//!
//! `ImageTaskApi` is the seam to the upstream (one HTTP implementation,
//! `DashScopeApi`); `ImageTaskBridge` owns the polling state machine and the
//! conversion of result references into inline `data:` URLs.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::future::try_join_all;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{ImageCfg, PollMode};
use crate::error::{CoreResult, RelayError};
use crate::http_client::{FetchedResource, HttpClient};
use crate::telemetry::{self, TaskLog};

const TRACING_TARGET: &str = "chatrelay_core::task";

/// Label used in errors and logs for this upstream.
pub const UPSTREAM_IMAGE: &str = "image";

/// Failed task ids remembered so later polls keep answering `FAILED`.
const TOMBSTONE_CAPACITY: usize = 1024;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// `TaskLog::error_kind` values that are not a `RelayError::kind()`.
const FAILURE_UPSTREAM: &str = "upstream_failed";
const FAILURE_POLL_BUDGET: &str = "poll_budget";
const FAILURE_BURIED: &str = "already_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Map an upstream status string. Anything unrecognised is still in flight.
    pub fn from_upstream(raw: Option<&str>) -> Self {
        match raw {
            Some("SUCCEEDED") => Self::Succeeded,
            Some("FAILED") => Self::Failed,
            Some("RUNNING") => Self::Running,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// What one status query reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub refs: Vec<String>,
}

impl TaskProgress {
    pub fn new(status: TaskStatus) -> Self {
        Self { status, refs: Vec::new() }
    }

    pub fn succeeded(refs: Vec<String>) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            refs,
        }
    }
}

/// One image job as tracked by the bridge. Only poll responses mutate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub result_refs: Vec<String>,
    /// Why the bridge gave up on the task, once it has.
    pub failure: Option<&'static str>,
}

impl GenerationTask {
    pub fn submitted(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            result_refs: Vec::new(),
            failure: None,
        }
    }

    /// Fold in one poll response. A success without references is not
    /// finished yet from the caller's point of view.
    pub fn observe(&mut self, progress: TaskProgress) {
        self.status = match progress.status {
            TaskStatus::Succeeded if progress.refs.is_empty() => TaskStatus::Running,
            other => other,
        };
        self.result_refs = progress.refs;
    }
}

/// What callers of the bridge see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(
        rename = "base64Images",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub base64_images: Option<Vec<String>>,
}

impl TaskSnapshot {
    pub fn in_flight(status: TaskStatus) -> Self {
        Self {
            status,
            images: None,
            base64_images: None,
        }
    }

    pub fn failed() -> Self {
        Self::in_flight(TaskStatus::Failed)
    }

    pub fn succeeded(images: Vec<String>, inline: Vec<String>) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            images: Some(images),
            base64_images: Some(inline),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Answer to a generation request: the finished snapshot when the relay
/// polls, or the task id when the client is expected to poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Accepted {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    Completed(TaskSnapshot),
}

/// `data:<type>;base64,<payload>` for a fetched resource.
pub fn inline_data_url(res: &FetchedResource) -> String {
    let content_type = res
        .content_type
        .as_deref()
        .filter(|ct| !ct.trim().is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    format!("data:{content_type};base64,{}", STANDARD.encode(&res.bytes))
}

#[async_trait]
pub trait ImageTaskApi: Send + Sync {
    /// Start a job and return its task id.
    async fn submit(&self, prompt: &str) -> CoreResult<String>;

    async fn status(&self, task_id: &str) -> CoreResult<TaskProgress>;

    /// Download one result reference.
    async fn fetch(&self, reference: &str) -> CoreResult<FetchedResource>;
}

// ---- DashScope wire structs (minimal) ----
#[derive(Serialize)]
struct SynthesisReq<'a> {
    model: &'a str,
    input: SynthesisInput<'a>,
    parameters: SynthesisParams<'a>,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    prompt: &'a str,
}

#[derive(Serialize)]
struct SynthesisParams<'a> {
    size: &'a str,
    n: u32,
}

#[derive(Deserialize, Default)]
struct TaskEnvelope {
    #[serde(default)]
    output: Option<TaskOutput>,
}

#[derive(Deserialize, Default)]
struct TaskOutput {
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    task_status: Option<String>,
    #[serde(default)]
    results: Option<Vec<ResultWire>>,
}

#[derive(Deserialize)]
struct ResultWire {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DashScopeApi {
    http: HttpClient,
    base: String,
    model: String,
    size: String,
    n: u32,
    api_key: Option<SecretString>,
    api_key_env: String,
}

impl DashScopeApi {
    pub fn from_config(http: HttpClient, api_key: Option<SecretString>, cfg: &ImageCfg) -> Self {
        Self {
            http,
            base: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            size: cfg.size.clone(),
            n: cfg.n,
            api_key,
            api_key_env: cfg.api_key_env.clone(),
        }
    }

    fn bearer(&self) -> CoreResult<String> {
        let key = self.api_key.as_ref().ok_or_else(|| RelayError::MissingCredential {
            env: self.api_key_env.clone(),
        })?;
        Ok(format!("Bearer {}", key.expose_secret()))
    }

    /// `{base}/tasks/{task_id}` with the id encoded as exactly one path segment.
    fn task_url(&self, task_id: &str) -> CoreResult<Url> {
        if matches!(task_id, "" | "." | "..") {
            return Err(RelayError::MessageFormat(format!("invalid task id '{task_id}'")));
        }
        let mut url = Url::parse(&format!("{}/tasks", self.base))
            .map_err(|e| RelayError::Config(format!("image base_url '{}': {e}", self.base)))?;
        url.path_segments_mut()
            .map_err(|_| RelayError::Config(format!("image base_url '{}' cannot take a path", self.base)))?
            .push(task_id);
        Ok(url)
    }
}

#[async_trait]
impl ImageTaskApi for DashScopeApi {
    async fn submit(&self, prompt: &str) -> CoreResult<String> {
        let auth = self.bearer()?;
        let url = format!("{}/services/aigc/text2image/image-synthesis", self.base);
        let req = SynthesisReq {
            model: &self.model,
            input: SynthesisInput { prompt },
            parameters: SynthesisParams {
                size: &self.size,
                n: self.n,
            },
        };
        let raw: serde_json::Value = self
            .http
            .post_json(
                UPSTREAM_IMAGE,
                &url,
                &req,
                &[("Authorization", auth.as_str()), ("X-DashScope-Async", "enable")],
            )
            .await?;

        let envelope: TaskEnvelope = serde_json::from_value(raw.clone()).unwrap_or_default();
        match envelope.output.and_then(|o| o.task_id).filter(|id| !id.is_empty()) {
            Some(id) => Ok(id),
            None => Err(RelayError::Submit {
                message: "no task_id in submit response".to_string(),
                detail: Some(raw),
            }),
        }
    }

    async fn status(&self, task_id: &str) -> CoreResult<TaskProgress> {
        let url = self.task_url(task_id)?;
        let auth = self.bearer()?;
        let envelope: TaskEnvelope = self
            .http
            .get_json(UPSTREAM_IMAGE, url.as_str(), &[("Authorization", auth.as_str())])
            .await?;
        let output = envelope.output.unwrap_or_default();
        let refs = output
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.url)
            .collect();
        Ok(TaskProgress {
            status: TaskStatus::from_upstream(output.task_status.as_deref()),
            refs,
        })
    }

    async fn fetch(&self, reference: &str) -> CoreResult<FetchedResource> {
        self.http.get_bytes(UPSTREAM_IMAGE, reference).await
    }
}

/// Bounded set of task ids that already ended in `FAILED`.
#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

pub struct ImageTaskBridge {
    api: Arc<dyn ImageTaskApi>,
    interval: Duration,
    max_attempts: Option<u32>,
    mode: PollMode,
    failed: Mutex<Tombstones>,
}

impl ImageTaskBridge {
    pub fn new(api: Arc<dyn ImageTaskApi>, cfg: &ImageCfg) -> Self {
        Self {
            api,
            interval: cfg.poll_interval(),
            // 0 reads as "no limit", same as leaving it out.
            max_attempts: cfg.max_poll_attempts.filter(|n| *n > 0),
            mode: cfg.poll_mode,
            failed: Mutex::new(Tombstones::default()),
        }
    }

    pub fn poll_mode(&self) -> PollMode {
        self.mode
    }

    /// Submit a prompt and return the upstream task id.
    pub async fn submit(&self, prompt: &str) -> CoreResult<String> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(RelayError::MessageFormat("prompt must not be empty".to_string()));
        }
        let task_id = self.api.submit(prompt).await?;
        tracing::info!(target: TRACING_TARGET, task_id = %task_id, "image task submitted");
        Ok(task_id)
    }

    /// Submit, then either poll to completion or hand the id back, per poll mode.
    pub async fn generate(&self, prompt: &str) -> CoreResult<SubmitResponse> {
        let task_id = self.submit(prompt).await?;
        Ok(match self.mode {
            PollMode::Server => SubmitResponse::Completed(self.await_completion(&task_id).await),
            PollMode::Client => SubmitResponse::Accepted { task_id },
        })
    }

    /// One status query. Never fails: transport errors read as `FAILED`.
    pub async fn poll(&self, task_id: &str) -> TaskSnapshot {
        let started = Instant::now();
        let mut task = GenerationTask::submitted(task_id);
        let snapshot = self.poll_once(&mut task).await;
        if snapshot.is_terminal() {
            self.record(&task, &snapshot, 1, started);
        }
        snapshot
    }

    /// Poll at the configured cadence until the task is terminal or the
    /// attempt budget runs out. Intermediate snapshots are never returned.
    pub async fn await_completion(&self, task_id: &str) -> TaskSnapshot {
        let started = Instant::now();
        let mut task = GenerationTask::submitted(task_id);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let snapshot = self.poll_once(&mut task).await;
            if snapshot.is_terminal() {
                self.record(&task, &snapshot, attempts, started);
                return snapshot;
            }
            if self.max_attempts.is_some_and(|max| attempts >= max) {
                tracing::warn!(
                    target: TRACING_TARGET,
                    task_id = %task_id,
                    poll_attempts = attempts,
                    last_status = task.status.as_str(),
                    "giving up on image task"
                );
                let snapshot = self.fail(&mut task, FAILURE_POLL_BUDGET);
                self.record(&task, &snapshot, attempts, started);
                return snapshot;
            }
            tracing::debug!(target: TRACING_TARGET, task_id = %task_id, status = task.status.as_str(), "task not finished");
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn poll_once(&self, task: &mut GenerationTask) -> TaskSnapshot {
        if self.is_buried(&task.task_id) {
            task.status = TaskStatus::Failed;
            task.failure = Some(FAILURE_BURIED);
            return TaskSnapshot::failed();
        }

        let progress = match self.api.status(&task.task_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: TRACING_TARGET, task_id = %task.task_id, error = %e, "task status query failed");
                return self.fail(task, e.kind());
            }
        };
        task.observe(progress);

        match task.status {
            TaskStatus::Failed => self.fail(task, FAILURE_UPSTREAM),
            TaskStatus::Succeeded => match self.materialize(&task.result_refs).await {
                Ok(inline) => TaskSnapshot::succeeded(task.result_refs.clone(), inline),
                Err(e) => {
                    tracing::warn!(target: TRACING_TARGET, task_id = %task.task_id, error = %e, "fetching task results failed");
                    self.fail(task, e.kind())
                }
            },
            status => TaskSnapshot::in_flight(status),
        }
    }

    /// Fetch every reference concurrently; one failure fails them all.
    async fn materialize(&self, refs: &[String]) -> CoreResult<Vec<String>> {
        let fetched = try_join_all(refs.iter().map(|r| self.api.fetch(r))).await?;
        Ok(fetched.iter().map(inline_data_url).collect())
    }

    fn fail(&self, task: &mut GenerationTask, kind: &'static str) -> TaskSnapshot {
        task.status = TaskStatus::Failed;
        task.failure = Some(kind);
        self.bury(&task.task_id);
        TaskSnapshot::failed()
    }

    fn bury(&self, task_id: &str) {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id);
    }

    fn is_buried(&self, task_id: &str) -> bool {
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task_id)
    }

    fn record(&self, task: &GenerationTask, snapshot: &TaskSnapshot, attempts: u32, started: Instant) {
        let images = snapshot.images.as_ref().map_or(0, |v| v.len());
        let mut log = TaskLog::new(task.task_id.as_str())
            .status(snapshot.status.as_str())
            .poll_attempts(attempts)
            .images(images)
            .latency_ms(started.elapsed().as_millis() as u64);
        if let Some(kind) = task.failure {
            log = log.error_kind(kind);
        }
        telemetry::emit_task(log);
    }
}
