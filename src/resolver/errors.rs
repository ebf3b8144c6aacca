use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("读取文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("工作流不是有效的 JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("工作流格式不正确: {0}")]
    InvalidWorkflow(String),
}
