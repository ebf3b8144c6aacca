use async_trait::async_trait;

use crate::common::client::{
    error::ApiError,
    models::transfer::{CancelResponse, ProgressResponse, StartResponse},
};

use super::{
    models::{Provider, SessionId},
    provider::TransferRequest,
};

/// 后端接口边界，真实实现见 `BackendClient`
#[async_trait]
pub trait TransferBackend: Send + Sync {
    // POST <来源接口> { session_id, path, ... }
    async fn start(
        &self,
        session_id: &SessionId,
        request: &TransferRequest,
    ) -> Result<StartResponse, ApiError>;

    // GET <进度接口>/<session_id>
    async fn progress(
        &self,
        progress_endpoint: &str,
        session_id: &SessionId,
    ) -> Result<ProgressResponse, ApiError>;

    // POST <取消接口> { session_id, download_type }
    async fn cancel(
        &self,
        cancel_endpoint: &str,
        session_id: &SessionId,
        provider: Provider,
    ) -> Result<CancelResponse, ApiError>;
}
