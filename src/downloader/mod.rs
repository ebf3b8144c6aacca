use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;

use self::{
    backend::TransferBackend,
    cancel::{CancelAck, CancellationController},
    error::TransferError,
    models::{
        BatchId, FormFields, OrchestratorEvent, SessionId, SessionState, StatusRecord,
        TransferSpec,
    },
    poller::{PollControl, Poller},
    provider::ProviderAdapter,
    registry::SessionRegistry,
    retry::{Outcome, RetryPolicy, StartOutcome},
};

pub mod backend;
pub mod batch;
pub mod cancel;
pub mod error;
pub mod models;
pub mod poller;
pub mod progress;
pub mod provider;
pub mod registry;
pub mod retry;

const EVENT_CAPACITY: usize = 256;

/// 调用方持有的会话句柄
pub struct SessionHandle {
    pub session_id: SessionId,
    pub retry_count: u32,
    status: watch::Receiver<StatusRecord>,
    finished: bool,
}

impl SessionHandle {
    fn new(session_id: SessionId, retry_count: u32, status: watch::Receiver<StatusRecord>) -> Self {
        Self {
            session_id,
            retry_count,
            status,
            finished: false,
        }
    }

    /// 当前（或最后一次）状态
    pub fn status(&self) -> StatusRecord {
        self.status.borrow().clone()
    }

    /// 等待下一次状态变化，进入终止状态后返回 None
    pub async fn next_status(&mut self) -> Option<StatusRecord> {
        if self.finished {
            return None;
        }
        if self.status.changed().await.is_err() {
            self.finished = true;
            return None;
        }
        let record = self.status.borrow_and_update().clone();
        if record.state.is_terminal() {
            self.finished = true;
        }
        Some(record)
    }

    /// 等待会话结束，返回最终状态
    pub async fn wait(&mut self) -> StatusRecord {
        while self.next_status().await.is_some() {}
        self.status()
    }
}

/// 把各个组件串起来，界面上的每个操作都从这里进入
pub struct TransferOrchestrator {
    config: OrchestratorConfig,
    adapter: ProviderAdapter,
    policy: RetryPolicy,
    backend: Arc<dyn TransferBackend>,
    registry: Arc<SessionRegistry>,
    poller: Arc<Poller>,
    cancellation: CancellationController,
    batches: DashMap<BatchId, CancellationToken>, // 仍在启动条目的批量任务
}

impl TransferOrchestrator {
    pub fn new(config: OrchestratorConfig, backend: Arc<dyn TransferBackend>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(SessionRegistry::new(events));
        let poller = Arc::new(Poller::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            config.poll_failure_retries,
        ));
        let cancellation = CancellationController::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            Arc::clone(&poller),
            config.endpoints.cancel.clone(),
            config.cancel_timeout(),
        );

        Self {
            adapter: ProviderAdapter::new(config.endpoints.clone()),
            policy: RetryPolicy::from_config(&config),
            config,
            backend,
            registry,
            poller,
            cancellation,
            batches: DashMap::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// 展示层订阅状态记录和批量事件
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.registry.events().subscribe()
    }

    pub async fn start(&self, spec: &TransferSpec) -> Result<SessionHandle, TransferError> {
        self.start_session(spec, 0, &mut |_: &StatusRecord| {}).await
    }

    /// 用户补充凭据后重试，总是创建新会话，不受自动重试次数限制
    pub async fn retry_with_credentials(
        &self,
        spec: &TransferSpec,
        previous_retry_count: u32,
        credentials: &FormFields,
    ) -> Result<SessionHandle, TransferError> {
        info!("使用新凭据重试: {}", spec.display_label());
        let spec = spec.with_credentials(credentials);
        self.start_session(&spec, previous_retry_count + 1, &mut |_: &StatusRecord| {})
            .await
    }

    pub fn cancel(&self, session_id: &SessionId) -> BoxFuture<'static, CancelAck> {
        self.cancellation.cancel(session_id)
    }

    /// 先让所有批量任务停止启动新条目，再取消已注册的会话
    pub fn cancel_all(&self) -> Vec<BoxFuture<'static, CancelAck>> {
        for entry in self.batches.iter() {
            debug!("停止批量任务 {}", entry.key());
            entry.value().cancel();
        }
        self.registry
            .list()
            .into_iter()
            .map(|session| self.cancel(&session.id))
            .collect()
    }

    pub(crate) fn track_batch(&self, id: BatchId, token: CancellationToken) {
        self.batches.insert(id, token);
    }

    pub(crate) fn untrack_batch(&self, id: &BatchId) {
        self.batches.remove(id);
    }

    /// 启动并跟踪到结束；遇到 access_restricted 时按策略用配置里的凭据自动重试
    pub async fn execute(
        &self,
        spec: &TransferSpec,
        on_status: &mut (dyn FnMut(&StatusRecord) + Send),
    ) -> Result<StatusRecord, TransferError> {
        let mut spec = spec.clone();
        let mut retry_count = 0;
        loop {
            let mut handle = self.start_session(&spec, retry_count, on_status).await?;
            while let Some(record) = handle.next_status().await {
                on_status(&record);
            }
            let last = handle.status();

            if last.state == SessionState::AccessRestricted {
                if let Some(next) = self.auto_credential_retry(&spec, retry_count) {
                    spec = next;
                    retry_count += 1;
                    continue;
                }
            }
            return Ok(last);
        }
    }

    fn auto_credential_retry(&self, spec: &TransferSpec, retry_count: u32) -> Option<TransferSpec> {
        if !self.policy.allows_auto_credential_retry(retry_count) {
            return None;
        }
        let credentials = self.config.stored_credentials(spec.provider)?;
        info!("{} 需要凭据，使用配置中的凭据自动重试", spec.display_label());
        Some(spec.with_credentials(&credentials))
    }

    async fn start_session(
        &self,
        spec: &TransferSpec,
        retry_count: u32,
        on_status: &mut (dyn FnMut(&StatusRecord) + Send),
    ) -> Result<SessionHandle, TransferError> {
        // 校验失败时不注册会话，也不发任何请求
        let request = self
            .adapter
            .build(spec.provider, &spec.fields, &spec.path)
            .map_err(TransferError::Validation)?;

        let (session_id, status) = self.registry.register(
            spec.provider,
            spec.display_label(),
            request.destination_path.clone(),
            retry_count,
        );
        let handle = SessionHandle::new(session_id.clone(), retry_count, status);
        on_status(&handle.status());

        // 注册之后、发送之前就被取消的会话不再发起请求
        if !self.registry.contains(&session_id) {
            debug!("会话 {} 在发送前已被取消", session_id);
            return Ok(handle);
        }

        info!("启动传输 {} ({}) -> {}", session_id, spec.provider, request.destination_path);

        let response = match self.backend.start(&session_id, &request).await {
            Ok(response) => response,
            Err(e) => {
                error!("会话 {} 启动请求失败: {}", session_id, e);
                self.registry.update(&session_id, |s| {
                    s.apply_outcome(Outcome::Failed(format!("启动失败: {}", e)))
                });
                self.registry.remove(&session_id);
                return Err(TransferError::Request { session_id, source: e });
            }
        };

        match self.policy.classify_start(&response) {
            StartOutcome::Rejected(message) => {
                warn!("后端拒绝会话 {}: {}", session_id, message);
                self.registry.remove(&session_id);
                Err(TransferError::RequestRejected(message))
            }
            StartOutcome::AccessRestricted(message) => {
                warn!("会话 {} 需要访问凭据: {}", session_id, message);
                self.registry.update(&session_id, |s| {
                    s.apply_outcome(Outcome::AccessRestricted(message))
                });
                self.registry.remove(&session_id);
                Ok(handle)
            }
            StartOutcome::Accepted => {
                // 等待响应期间可能已被取消
                if !self.registry.contains(&session_id) {
                    debug!("会话 {} 在启动过程中被取消", session_id);
                    return Ok(handle);
                }
                self.start_polling(&session_id, &request.progress_endpoint);
                Ok(handle)
            }
        }
    }

    fn start_polling(&self, session_id: &SessionId, progress_endpoint: &str) {
        let registry = Arc::clone(&self.registry);
        let policy = self.policy;
        let tick_session = session_id.clone();

        self.poller.start(
            session_id,
            progress_endpoint,
            self.config.poll_interval(),
            move |tick| {
                let Some(session) = registry.get(&tick_session) else {
                    return PollControl::Stop;
                };
                let outcome = policy.classify(&tick, &session.progress);
                let terminal = outcome.is_terminal();
                registry.update(&tick_session, |s| s.apply_outcome(outcome));

                if terminal {
                    registry.remove(&tick_session);
                    PollControl::Stop
                } else {
                    PollControl::Continue
                }
            },
        );
    }
}
