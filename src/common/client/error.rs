use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),

    #[error("后端返回状态码 {0}: {1}")]
    Status(u16, String),

    #[error("服务暂时不可用，请稍后重试")]
    RetryLater,

    #[error("无效的后端地址: {0}")]
    InvalidBaseUrl(String),

    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}
