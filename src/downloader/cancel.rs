use std::{sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use tracing::{info, warn};

use super::{
    backend::TransferBackend, models::SessionId, poller::Poller, registry::SessionRegistry,
    retry::Outcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAck {
    /// 后端确认取消
    Acknowledged,
    /// 后端返回失败，本地仍然视为已取消
    Refused(String),
    /// 请求失败或超时，本地仍然视为已取消
    Unreachable(String),
    /// 会话不存在或已结束，什么也没做
    NotActive,
}

pub struct CancellationController {
    backend: Arc<dyn TransferBackend>,
    registry: Arc<SessionRegistry>,
    poller: Arc<Poller>,
    cancel_endpoint: String,
    timeout: Duration,
}

impl CancellationController {
    pub fn new(
        backend: Arc<dyn TransferBackend>,
        registry: Arc<SessionRegistry>,
        poller: Arc<Poller>,
        cancel_endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registry,
            poller,
            cancel_endpoint: cancel_endpoint.into(),
            timeout,
        }
    }

    /// 本地状态在返回 future 之前就已经切换为已取消，
    /// 返回的 future 只负责通知后端，不需要等待它
    pub fn cancel(&self, session_id: &SessionId) -> BoxFuture<'static, CancelAck> {
        let mut provider = None;
        let record = self.registry.update(session_id, |session| {
            provider = Some(session.provider);
            session.apply_outcome(Outcome::Cancelled)
        });

        let (Some(_), Some(provider)) = (record, provider) else {
            return futures::future::ready(CancelAck::NotActive).boxed();
        };

        self.poller.stop_session(session_id);
        self.registry.remove(session_id);
        info!("会话 {} 已在本地取消", session_id);

        let backend = Arc::clone(&self.backend);
        let endpoint = self.cancel_endpoint.clone();
        let timeout = self.timeout;
        let session_id = session_id.clone();

        async move {
            match tokio::time::timeout(timeout, backend.cancel(&endpoint, &session_id, provider))
                .await
            {
                Ok(Ok(response)) if response.success => CancelAck::Acknowledged,
                Ok(Ok(response)) => {
                    let reason = response.error.unwrap_or_default();
                    warn!("后端拒绝取消会话 {}: {}", session_id, reason);
                    CancelAck::Refused(reason)
                }
                Ok(Err(e)) => {
                    warn!("发送取消请求失败 {}: {}", session_id, e);
                    CancelAck::Unreachable(e.to_string())
                }
                Err(_) => {
                    warn!("取消请求超时 {}", session_id);
                    CancelAck::Unreachable(format!("{:?} 内未收到确认", timeout))
                }
            }
        }
        .boxed()
    }
}
