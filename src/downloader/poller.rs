use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    backend::TransferBackend, models::SessionId, registry::SessionRegistry, retry::PollTick,
};

// 时间间隔为零时 tokio 的 interval 会 panic
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone)]
pub struct PollHandle {
    session_id: SessionId,
    generation: u64,
    token: CancellationToken,
}

impl PollHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl PartialEq for PollHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id && self.generation == other.generation
    }
}

/// 每个会话最多一个轮询任务；请求在循环体内 await，慢响应会推迟下一次轮询而不是叠加
pub struct Poller {
    backend: Arc<dyn TransferBackend>,
    registry: Arc<SessionRegistry>,
    active: Arc<DashMap<SessionId, PollHandle>>, // session_id -> 当前轮询
    generation: AtomicU64,
    failure_retries: u32,
}

impl Poller {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        registry: Arc<SessionRegistry>,
        failure_retries: u32,
    ) -> Self {
        Self {
            backend,
            registry,
            active: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            failure_retries,
        }
    }

    pub fn start<F>(
        &self,
        session_id: &SessionId,
        progress_endpoint: &str,
        interval: Duration,
        on_tick: F,
    ) -> PollHandle
    where
        F: FnMut(PollTick) -> PollControl + Send + 'static,
    {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let handle = match self.active.entry(session_id.clone()) {
            Entry::Occupied(entry) if !entry.get().is_stopped() => {
                warn!("会话 {} 已有轮询任务，忽略重复启动", session_id);
                return entry.get().clone();
            }
            entry => {
                let handle = PollHandle {
                    session_id: session_id.clone(),
                    generation: self.generation.fetch_add(1, Ordering::Relaxed),
                    token: CancellationToken::new(),
                };
                let _ = entry.insert(handle.clone());
                handle
            }
        };

        debug!("开始轮询会话 {}，间隔 {:?}", session_id, interval);

        let backend = Arc::clone(&self.backend);
        let registry = Arc::clone(&self.registry);
        let active = Arc::clone(&self.active);
        let task_handle = handle.clone();
        let endpoint = progress_endpoint.to_string();
        let failure_retries = self.failure_retries;

        tokio::spawn(async move {
            Self::run(
                backend,
                registry,
                &task_handle,
                endpoint,
                interval,
                failure_retries,
                on_tick,
            )
            .await;

            active.remove_if(&task_handle.session_id, |_, current| {
                current.generation == task_handle.generation
            });
            task_handle.token.cancel();
            debug!("会话 {} 的轮询已结束", task_handle.session_id);
        });

        handle
    }

    pub fn stop(&self, handle: &PollHandle) {
        handle.token.cancel();
        self.active.remove_if(&handle.session_id, |_, current| {
            current.generation == handle.generation
        });
    }

    pub fn stop_session(&self, session_id: &SessionId) {
        if let Some((_, handle)) = self.active.remove(session_id) {
            handle.token.cancel();
        }
    }

    pub fn is_polling(&self, session_id: &SessionId) -> bool {
        self.active
            .get(session_id)
            .map(|handle| !handle.is_stopped())
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|h| !h.is_stopped()).count()
    }

    async fn run<F>(
        backend: Arc<dyn TransferBackend>,
        registry: Arc<SessionRegistry>,
        handle: &PollHandle,
        endpoint: String,
        interval: Duration,
        failure_retries: u32,
        mut on_tick: F,
    ) where
        F: FnMut(PollTick) -> PollControl + Send + 'static,
    {
        let session_id = &handle.session_id;
        let token = &handle.token;

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过它，保证首次查询在一个间隔之后
        ticker.tick().await;

        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !registry.contains(session_id) {
                debug!("会话 {} 已注销，停止轮询", session_id);
                return;
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = backend.progress(&endpoint, session_id) => result,
            };

            let tick = match result {
                Ok(report) => {
                    consecutive_failures = 0;
                    PollTick::Report(report)
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= failure_retries {
                        warn!(
                            "会话 {} 第 {} 次轮询失败，稍后重试: {}",
                            session_id, consecutive_failures, e
                        );
                        continue;
                    }
                    warn!("会话 {} 轮询失败，判定传输失败: {}", session_id, e);
                    PollTick::Lost(e.to_string())
                }
            };

            // 请求期间会话可能已被取消或注销，此时丢弃结果
            if token.is_cancelled() || !registry.contains(session_id) {
                return;
            }

            let terminal = tick.is_terminal();
            if on_tick(tick) == PollControl::Stop || terminal {
                return;
            }
        }
    }
}
