#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use model_transfer::{
    OrchestratorConfig, TransferOrchestrator,
    common::client::{
        error::ApiError,
        models::transfer::{CancelResponse, ProgressResponse, RemoteStatus, StartResponse},
    },
    downloader::{
        backend::TransferBackend,
        models::{Provider, SessionId},
        provider::TransferRequest,
    },
};

/// 启动请求的预设响应
#[derive(Debug, Clone)]
pub enum StartScript {
    Accept,
    Reject(String),
    Restricted(String),
    NetworkError,
}

#[derive(Debug, Clone)]
pub enum ProgressStep {
    Report(ProgressResponse),
    NetworkError,
}

impl ProgressStep {
    pub fn downloading(downloaded: u64, total: u64) -> Self {
        Self::Report(ProgressResponse::downloading(downloaded, Some(total)))
    }

    pub fn status(status: RemoteStatus) -> Self {
        Self::Report(ProgressResponse::with_status(status, ""))
    }

    fn is_terminal(&self) -> bool {
        match self {
            ProgressStep::Report(report) => !matches!(
                report.status,
                RemoteStatus::Downloading | RemoteStatus::Unknown
            ),
            ProgressStep::NetworkError => false,
        }
    }
}

/// 某个条目的后端行为，进度序列的最后一项会一直重复
#[derive(Debug, Clone)]
pub struct Script {
    pub start: StartScript,
    pub progress: Vec<ProgressStep>,
    // 请求里带了这个字段才接受，否则返回 access_restricted
    pub requires_credential: Option<&'static str>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            start: StartScript::Accept,
            progress: vec![
                ProgressStep::downloading(50, 100),
                ProgressStep::status(RemoteStatus::Completed),
            ],
            requires_credential: None,
        }
    }
}

impl Script {
    pub fn completes_after(steps: Vec<ProgressStep>) -> Self {
        let mut progress = steps;
        progress.push(ProgressStep::status(RemoteStatus::Completed));
        Self {
            progress,
            ..Default::default()
        }
    }

    pub fn endless_downloading() -> Self {
        Self {
            progress: vec![ProgressStep::downloading(10, 100)],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Ack,
    Refuse,
    Hang,
    NetworkError,
}

/// 内存里的假后端，按请求中的 url (或 file_id / filename) 查找预设行为
pub struct FakeBackend {
    scripts: Mutex<HashMap<String, Script>>,
    sessions: Mutex<HashMap<SessionId, (String, usize)>>,
    requests: Mutex<Vec<(SessionId, TransferRequest)>>,
    start_times: Mutex<Vec<Instant>>,
    cancel_mode: Mutex<CancelMode>,
    progress_delay: Mutex<Duration>,
    pub start_calls: AtomicUsize,
    pub progress_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    inflight_polls: AtomicUsize,
    max_inflight_polls: AtomicUsize,
    active_sessions: AtomicUsize,
    max_active_sessions: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            start_times: Mutex::new(Vec::new()),
            cancel_mode: Mutex::new(CancelMode::Ack),
            progress_delay: Mutex::new(Duration::ZERO),
            start_calls: AtomicUsize::new(0),
            progress_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            inflight_polls: AtomicUsize::new(0),
            max_inflight_polls: AtomicUsize::new(0),
            active_sessions: AtomicUsize::new(0),
            max_active_sessions: AtomicUsize::new(0),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, key: &str, script: Script) {
        self.scripts.lock().unwrap().insert(key.to_string(), script);
    }

    pub fn set_cancel_mode(&self, mode: CancelMode) {
        *self.cancel_mode.lock().unwrap() = mode;
    }

    pub fn set_progress_delay(&self, delay: Duration) {
        *self.progress_delay.lock().unwrap() = delay;
    }

    pub fn requests(&self) -> Vec<(SessionId, TransferRequest)> {
        self.requests.lock().unwrap().clone()
    }

    /// 相邻两次启动请求之间的间隔
    pub fn start_gaps(&self) -> Vec<Duration> {
        let times = self.start_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn max_inflight_polls(&self) -> usize {
        self.max_inflight_polls.load(Ordering::SeqCst)
    }

    pub fn max_active_sessions(&self) -> usize {
        self.max_active_sessions.load(Ordering::SeqCst)
    }

    fn key_of(request: &TransferRequest) -> String {
        ["url", "file_id", "filename"]
            .iter()
            .find_map(|key| request.field(key))
            .unwrap_or_default()
            .to_string()
    }

    fn script_for(&self, key: &str) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn session_finished(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl TransferBackend for FakeBackend {
    async fn start(
        &self,
        session_id: &SessionId,
        request: &TransferRequest,
    ) -> Result<StartResponse, ApiError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.start_times.lock().unwrap().push(Instant::now());
        self.requests
            .lock()
            .unwrap()
            .push((session_id.clone(), request.clone()));

        let key = Self::key_of(request);
        let script = self.script_for(&key);

        if let Some(field) = script.requires_credential {
            if request.field(field).is_none() {
                return Ok(StartResponse::access_restricted("需要登录后才能下载"));
            }
        }

        match script.start {
            StartScript::Accept => {
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(session_id.clone(), (key, 0));
                let active = self.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active_sessions.fetch_max(active, Ordering::SeqCst);
                Ok(StartResponse::accepted())
            }
            StartScript::Reject(message) => Ok(StartResponse::rejected(message)),
            StartScript::Restricted(message) => Ok(StartResponse::access_restricted(message)),
            StartScript::NetworkError => Err(ApiError::Unknown("connection refused".to_string())),
        }
    }

    async fn progress(
        &self,
        _progress_endpoint: &str,
        session_id: &SessionId,
    ) -> Result<ProgressResponse, ApiError> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        let inflight = self.inflight_polls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight_polls.fetch_max(inflight, Ordering::SeqCst);

        let delay = *self.progress_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let step = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(session_id) {
                Some((key, index)) => {
                    let script = self.script_for(key);
                    let step = script
                        .progress
                        .get(*index)
                        .or(script.progress.last())
                        .cloned();
                    *index += 1;
                    step
                }
                None => None,
            }
        };

        self.inflight_polls.fetch_sub(1, Ordering::SeqCst);

        match step {
            Some(ProgressStep::Report(report)) => {
                if ProgressStep::Report(report.clone()).is_terminal() {
                    self.session_finished();
                }
                Ok(report)
            }
            Some(ProgressStep::NetworkError) => Err(ApiError::RetryLater),
            None => Ok(ProgressResponse::with_status(
                RemoteStatus::Error,
                "unknown session",
            )),
        }
    }

    async fn cancel(
        &self,
        _cancel_endpoint: &str,
        _session_id: &SessionId,
        _provider: Provider,
    ) -> Result<CancelResponse, ApiError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.session_finished();

        let mode = *self.cancel_mode.lock().unwrap();
        match mode {
            CancelMode::Ack => Ok(CancelResponse {
                success: true,
                error: None,
            }),
            CancelMode::Refuse => Ok(CancelResponse {
                success: false,
                error: Some("already finished".to_string()),
            }),
            CancelMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CancelResponse::default())
            }
            CancelMode::NetworkError => Err(ApiError::RetryLater),
        }
    }
}

/// 测试用配置：短轮询间隔、短启动间隔
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 10,
        stagger_ms: 5,
        cancel_timeout_secs: 1,
        ..Default::default()
    }
}

pub fn orchestrator(backend: &Arc<FakeBackend>) -> Arc<TransferOrchestrator> {
    orchestrator_with(backend, test_config())
}

pub fn orchestrator_with(
    backend: &Arc<FakeBackend>,
    config: OrchestratorConfig,
) -> Arc<TransferOrchestrator> {
    let backend: Arc<dyn TransferBackend> = backend.clone();
    Arc::new(TransferOrchestrator::new(config, backend))
}
