use serde::{Deserialize, Serialize};

/// 工作流里声明的一个模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowModelRef {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
}

impl WorkflowModelRef {
    /// 落盘目录：models/<directory>
    pub fn destination(&self) -> String {
        match self.directory.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => {
                format!("models/{}", dir.trim_matches('/'))
            }
            _ => "models".to_string(),
        }
    }

    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MissingModels {
    pub missing: Vec<WorkflowModelRef>,
    // 缺少下载地址，只能提示用户手动处理
    pub unresolved: Vec<WorkflowModelRef>,
}

impl MissingModels {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unresolved.is_empty()
    }
}
