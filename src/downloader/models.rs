use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::retry::Outcome;

/// 表单字段，键为字段名
pub type FormFields = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "direct-link")]
    DirectLink,
    #[serde(rename = "google-drive")]
    GoogleDrive,
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[serde(rename = "civitai")]
    Civitai,
    #[serde(rename = "generic-upload")]
    GenericUpload,
    #[serde(rename = "global-model")]
    GlobalModel,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::DirectLink,
        Provider::GoogleDrive,
        Provider::HuggingFace,
        Provider::Civitai,
        Provider::GenericUpload,
        Provider::GlobalModel,
    ];

    // 同时作为取消请求中的 download_type
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::DirectLink => "direct-link",
            Provider::GoogleDrive => "google-drive",
            Provider::HuggingFace => "huggingface",
            Provider::Civitai => "civitai",
            Provider::GenericUpload => "generic-upload",
            Provider::GlobalModel => "global-model",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            Provider::DirectLink => "dl",
            Provider::GoogleDrive => "gd",
            Provider::HuggingFace => "hf",
            Provider::Civitai => "civ",
            Provider::GenericUpload => "up",
            Provider::GlobalModel => "gm",
        }
    }

    /// 需要凭据时使用的字段名
    pub fn credential_field(&self) -> Option<&'static str> {
        match self {
            Provider::HuggingFace => Some("token"),
            Provider::Civitai => Some("api_key"),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Provider::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .or(match normalized.as_str() {
                "url" | "direct" => Some(Provider::DirectLink),
                "gdrive" => Some(Provider::GoogleDrive),
                "hf" => Some(Provider::HuggingFace),
                "upload" => Some(Provider::GenericUpload),
                _ => None,
            })
            .ok_or_else(|| format!("未知的传输来源: {}", s))
    }
}

// --------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    const SUFFIX_ALPHABET: &'static [u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    // 时间戳 + 随机后缀，碰撞概率可以忽略
    pub(crate) fn generate(provider: Provider) -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..9)
            .map(|_| {
                let idx = rng.random_range(0..Self::SUFFIX_ALPHABET.len());
                Self::SUFFIX_ALPHABET[idx] as char
            })
            .collect();
        Self(format!(
            "{}_{}_{}",
            provider.id_prefix(),
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// --------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
    AccessRestricted, // 会话终止，但批量任务中该项仍可凭据重试
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Pending | SessionState::Downloading)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Pending => "等待中",
            SessionState::Downloading => "下载中",
            SessionState::Completed => "已完成",
            SessionState::Failed => "失败",
            SessionState::Cancelled => "已取消",
            SessionState::AccessRestricted => "需要凭据",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percentage: f64,
    pub message: String,
}

impl Progress {
    // 下载中时字节数与百分比都不允许回退
    fn merge_monotonic(&mut self, next: Progress) {
        self.downloaded_bytes = self.downloaded_bytes.max(next.downloaded_bytes);
        self.total_bytes = next.total_bytes.or(self.total_bytes);
        self.percentage = self.percentage.max(next.percentage);
        if !next.message.is_empty() {
            self.message = next.message;
        }
    }
}

/// 一次由服务端执行的传输
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub provider: Provider,
    pub label: String,
    pub destination_path: String,
    pub state: SessionState,
    pub progress: Progress,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        provider: Provider,
        label: String,
        destination_path: String,
        retry_count: u32,
    ) -> Self {
        Self {
            id,
            provider,
            label,
            destination_path,
            state: SessionState::Pending,
            progress: Progress {
                message: "等待后端开始传输".to_string(),
                ..Default::default()
            },
            retry_count,
            created_at: Utc::now(),
        }
    }

    /// 应用一次分类后的结果，终止状态之后的结果一律丢弃
    pub fn apply_outcome(&mut self, outcome: Outcome) -> Option<StatusRecord> {
        if self.state.is_terminal() {
            return None;
        }

        match outcome {
            Outcome::Continue(progress) => {
                self.state = SessionState::Downloading;
                self.progress.merge_monotonic(progress);
            }
            Outcome::Completed(progress) => {
                self.state = SessionState::Completed;
                self.progress.merge_monotonic(progress);
                self.progress.percentage = 100.0;
                if let Some(total) = self.progress.total_bytes {
                    self.progress.downloaded_bytes = self.progress.downloaded_bytes.max(total);
                }
            }
            Outcome::Failed(message) => {
                self.state = SessionState::Failed;
                self.progress.message = message;
            }
            Outcome::Cancelled => {
                self.state = SessionState::Cancelled;
                self.progress.message = "传输已取消".to_string();
            }
            Outcome::AccessRestricted(message) => {
                self.state = SessionState::AccessRestricted;
                self.progress.message = message;
            }
        }

        Some(self.status_record())
    }

    pub fn status_record(&self) -> StatusRecord {
        StatusRecord {
            session_id: self.id.clone(),
            state: self.state,
            message: self.progress.message.clone(),
            percentage: self.progress.percentage,
        }
    }
}

// --------------------------------------------------------------------

/// 每次轮询和终止事件时发给展示层的状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRecord {
    pub session_id: SessionId,
    pub state: SessionState,
    pub message: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEvent {
    pub batch_id: BatchId,
    pub completed_count: usize,
    pub failed_count: usize,
    pub overall_progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Status(StatusRecord),
    Batch(BatchEvent),
}

/// 一次用户操作描述的传输意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSpec {
    pub provider: Provider,
    #[serde(alias = "destination", alias = "destination_path")]
    pub path: String,
    #[serde(default)]
    pub fields: FormFields,
    #[serde(default)]
    pub label: Option<String>,
}

impl TransferSpec {
    pub fn new(provider: Provider, path: impl Into<String>) -> Self {
        Self {
            provider,
            path: path.into(),
            fields: FormFields::new(),
            label: None,
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    // 展示用名称：优先 label，其次文件名，最后来源
    pub fn display_label(&self) -> String {
        if let Some(label) = &self.label {
            return label.clone();
        }
        ["filename", "url", "source"]
            .iter()
            .find_map(|key| self.fields.get(*key).filter(|v| !v.trim().is_empty()))
            .cloned()
            .unwrap_or_else(|| self.provider.to_string())
    }

    /// 合并凭据字段，返回新的描述（重试总是新会话）
    pub fn with_credentials(&self, credentials: &FormFields) -> Self {
        let mut next = self.clone();
        for (key, value) in credentials {
            next.fields.insert(key.clone(), value.clone());
        }
        next
    }
}
