use serde::{Deserialize, Serialize};

/// 启动传输的响应
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StartResponse {
    pub success: bool,

    #[serde(default)]
    pub error: Option<String>,

    // 目前只有 "access_restricted" 一种取值
    #[serde(default)]
    pub error_type: Option<String>,
}

impl StartResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: None,
        }
    }

    pub fn access_restricted(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: Some(ACCESS_RESTRICTED.to_string()),
        }
    }

    pub fn is_access_restricted(&self) -> bool {
        self.error_type.as_deref() == Some(ACCESS_RESTRICTED)
    }
}

pub const ACCESS_RESTRICTED: &str = "access_restricted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Downloading,
    Completed,
    Error,
    Cancelled,
    AccessRestricted,
    // 后端新增的状态一律按下载中处理
    #[serde(other)]
    Unknown,
}

/// 进度查询的响应
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgressResponse {
    pub status: RemoteStatus,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub percentage: Option<f64>,

    #[serde(default)]
    pub downloaded: Option<u64>,

    #[serde(default)]
    pub total: Option<u64>,
}

impl ProgressResponse {
    pub fn downloading(downloaded: u64, total: Option<u64>) -> Self {
        Self {
            status: RemoteStatus::Downloading,
            message: String::new(),
            percentage: None,
            downloaded: Some(downloaded),
            total,
        }
    }

    pub fn with_status(status: RemoteStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            percentage: None,
            downloaded: None,
            total: None,
        }
    }
}

/// 取消请求的响应
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CancelResponse {
    pub success: bool,

    #[serde(default)]
    pub error: Option<String>,
}
