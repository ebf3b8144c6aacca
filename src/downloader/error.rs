use std::fmt;

use thiserror::Error;

use crate::common::client::error::ApiError;

use super::models::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    Missing,
    InvalidUrl,
    RootDestination,
    EmptyExtension,
}

/// 单个表单字段的校验错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub reason: ValidationReason,
}

impl ValidationError {
    pub fn new(field: &str, reason: ValidationReason) -> Self {
        Self {
            field: field.to_string(),
            reason,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            ValidationReason::Missing => "不能为空",
            ValidationReason::InvalidUrl => "不是有效的链接",
            ValidationReason::RootDestination => "不能是根目录",
            ValidationReason::EmptyExtension => "扩展名不能为空",
        };
        write!(f, "{} {}", self.field, reason)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("表单校验失败: {}", join_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("后端拒绝了传输请求: {0}")]
    RequestRejected(String),

    #[error("会话 {session_id} 启动请求失败: {source}")]
    Request {
        session_id: SessionId,
        #[source]
        source: ApiError,
    },
}

impl TransferError {
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            TransferError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn join_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
