use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Client, ClientBuilder, Response,
    header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT},
    multipart::{Form, Part},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, error};
use url::Url;

use crate::common::client::{
    error::ApiError,
    models::transfer::{CancelResponse, ProgressResponse, StartResponse},
};
use crate::downloader::{
    backend::TransferBackend,
    models::{FormFields, Provider, SessionId},
    provider::{RequestBody, TransferRequest},
};

/// 连接文件管理后端的 HTTP 客户端
#[derive(Debug, Clone)]
pub struct BackendClient {
    inner: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ApiError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }

        let inner = ClientBuilder::new()
            .timeout(timeout)
            .default_headers(Self::get_default_headers())
            .build()?;

        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("mtdl/", env!("CARGO_PKG_VERSION"))),
        );
        headers
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // 接口路径拼到后端地址上
    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn progress_url(&self, progress_endpoint: &str, session_id: &SessionId) -> String {
        format!(
            "{}/{}",
            self.url_for(progress_endpoint).trim_end_matches('/'),
            urlencoding::encode(session_id.as_str())
        )
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url_for(path);
        debug!("GET {}", url);
        let resp = self.inner.get(&url).send().await?;
        Self::handle_response(resp).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url_for(path);
        debug!("POST {}", url);
        let resp = self.inner.post(&url).json(body).send().await?;
        Self::handle_response(resp).await
    }

    pub async fn post_multipart<T: DeserializeOwned>(
        &self,
        path: &str,
        form: Form,
    ) -> Result<T, ApiError> {
        let url = self.url_for(path);
        debug!("POST (multipart) {}", url);
        let resp = self.inner.post(&url).multipart(form).send().await?;
        Self::handle_response(resp).await
    }

    // 本地文件以流的方式上传，不整块读入内存
    async fn upload_form(
        session_id: &SessionId,
        destination_path: &str,
        fields: &FormFields,
        file: &Path,
    ) -> Result<Form, ApiError> {
        let handle = tokio::fs::File::open(file).await?;
        let length = handle.metadata().await?.len();
        let file_name = fields
            .get("filename")
            .cloned()
            .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        let mut form = Form::new()
            .text("session_id", session_id.to_string())
            .text("path", destination_path.to_string());
        for (key, value) in fields {
            if key == "path" {
                continue;
            }
            form = form.text(key.clone(), value.clone());
        }

        let part =
            Part::stream_with_length(reqwest::Body::from(handle), length).file_name(file_name);
        Ok(form.part("file", part))
    }

    async fn handle_response<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let status = resp.status();
        if status.is_server_error() {
            error!("后端返回 {}: {}", status, resp.url());
            return Err(ApiError::RetryLater);
        }

        let url = resp.url().to_string();
        let text = resp.text().await?;

        // 后端在 4xx 时也会带 { success: false, error } 的正文，先按目标结构解析
        match serde_json::from_str::<T>(&text) {
            Ok(data) => Ok(data),
            Err(_) if !status.is_success() => Err(ApiError::Status(status.as_u16(), text)),
            Err(e) => {
                error!("失败的请求的URL: {}", url);
                error!("JSON 结构匹配失败: {}", e);
                error!("期望的结构 可能是: {}", std::any::type_name::<T>());
                Err(ApiError::InvalidResponse(format!(
                    "结构匹配失败: {}. 响应: {}",
                    e, text
                )))
            }
        }
    }
}

#[async_trait]
impl TransferBackend for BackendClient {
    async fn start(
        &self,
        session_id: &SessionId,
        request: &TransferRequest,
    ) -> Result<StartResponse, ApiError> {
        match &request.body {
            RequestBody::Json(_) => {
                let payload = request.json_payload(session_id).ok_or_else(|| {
                    ApiError::Unknown(format!("{} 的请求体不是 JSON", request.provider))
                })?;
                self.post_json(&request.endpoint, &payload).await
            }
            RequestBody::Multipart { fields, file } => {
                let form =
                    Self::upload_form(session_id, &request.destination_path, fields, file).await?;
                self.post_multipart(&request.endpoint, form).await
            }
        }
    }

    async fn progress(
        &self,
        progress_endpoint: &str,
        session_id: &SessionId,
    ) -> Result<ProgressResponse, ApiError> {
        let url = self.progress_url(progress_endpoint, session_id);
        self.get(&url).await
    }

    async fn cancel(
        &self,
        cancel_endpoint: &str,
        session_id: &SessionId,
        provider: Provider,
    ) -> Result<CancelResponse, ApiError> {
        let body = json!({
            "session_id": session_id.as_str(),
            "download_type": provider.as_str(),
        });
        self.post_json(cancel_endpoint, &body).await
    }
}
