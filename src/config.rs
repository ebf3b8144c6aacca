use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::downloader::models::{FormFields, Provider};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    pub start: String,
    pub progress: String,
}

impl ProviderEndpoints {
    fn under(start: &str) -> Self {
        Self {
            start: start.to_string(),
            progress: format!("{}/progress", start),
        }
    }
}

/// 各来源的后端接口路径
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointTable {
    pub direct_link: ProviderEndpoints,
    pub google_drive: ProviderEndpoints,
    pub huggingface: ProviderEndpoints,
    pub civitai: ProviderEndpoints,
    pub generic_upload: ProviderEndpoints,
    pub global_model: ProviderEndpoints,
    pub cancel: String,
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self {
            direct_link: ProviderEndpoints::under("/filemanager/download/url"),
            google_drive: ProviderEndpoints::under("/filemanager/download/gdrive"),
            huggingface: ProviderEndpoints::under("/filemanager/download/huggingface"),
            civitai: ProviderEndpoints::under("/filemanager/download/civitai"),
            generic_upload: ProviderEndpoints::under("/filemanager/upload"),
            global_model: ProviderEndpoints::under("/filemanager/models/download"),
            cancel: "/filemanager/download/cancel".to_string(),
        }
    }
}

impl EndpointTable {
    pub fn for_provider(&self, provider: Provider) -> &ProviderEndpoints {
        match provider {
            Provider::DirectLink => &self.direct_link,
            Provider::GoogleDrive => &self.google_drive,
            Provider::HuggingFace => &self.huggingface,
            Provider::Civitai => &self.civitai,
            Provider::GenericUpload => &self.generic_upload,
            Provider::GlobalModel => &self.global_model,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub base_url: String,
    pub endpoints: EndpointTable,
    pub poll_interval_ms: u64,
    pub stagger_ms: u64,
    pub max_in_flight: usize,
    pub request_timeout_secs: u64,
    pub cancel_timeout_secs: u64,
    // 自动凭据重试次数，默认不自动重试
    pub max_auto_credential_retries: u32,
    // 连续轮询失败多少次才判定会话失败，默认 0 即一次失败就终止
    pub poll_failure_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub civitai_api_key: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8188".to_string(),
            endpoints: EndpointTable::default(),
            poll_interval_ms: 1000,
            stagger_ms: 500,
            max_in_flight: 1,
            request_timeout_secs: 30,
            cancel_timeout_secs: 5,
            max_auto_credential_retries: 0,
            poll_failure_retries: 0,
            hf_token: None,
            civitai_api_key: None,
        }
    }
}

impl OrchestratorConfig {
    /// 从 JSON 文件加载，缺省字段使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("加载配置文件: {}", path.display());
        let data = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        debug!("配置内容: {:?}", config);
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    /// 配置中保存的凭据，用于自动凭据重试
    pub fn stored_credentials(&self, provider: Provider) -> Option<FormFields> {
        let value = match provider {
            Provider::HuggingFace => self.hf_token.as_ref(),
            Provider::Civitai => self.civitai_api_key.as_ref(),
            _ => None,
        }?;
        let field = provider.credential_field()?;
        let mut fields = FormFields::new();
        fields.insert(field.to_string(), value.clone());
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{ "base_url": "http://nas:9000", "stagger_ms": 0 }"#).unwrap();
        assert_eq!(config.base_url, "http://nas:9000");
        assert_eq!(config.stagger_ms, 0);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(
            config.endpoints.for_provider(Provider::Civitai).progress,
            "/filemanager/download/civitai/progress"
        );
    }

    #[test]
    fn test_stored_credentials() {
        let config = OrchestratorConfig {
            civitai_api_key: Some("abc".to_string()),
            ..Default::default()
        };
        let creds = config.stored_credentials(Provider::Civitai).unwrap();
        assert_eq!(creds.get("api_key").map(String::as_str), Some("abc"));
        assert!(config.stored_credentials(Provider::HuggingFace).is_none());
        assert!(config.stored_credentials(Provider::DirectLink).is_none());
    }
}
