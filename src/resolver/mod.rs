use std::{collections::HashSet, path::Path};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::downloader::models::{Provider, TransferSpec};

pub mod detector;
pub mod errors;
pub mod models;

use detector::detect_provider;
pub use errors::ResolveError;
pub use models::{MissingModels, WorkflowModelRef};

/// 对比工作流声明的模型和已安装的文件，找出需要下载的部分
#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    installed: HashSet<String>,
}

impl ModelResolver {
    pub fn new<I, S>(installed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            installed: installed
                .into_iter()
                .map(|name| file_name(name.as_ref()).to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }

    /// 已安装列表：JSON 字符串数组，或者每行一个文件名
    pub async fn from_listing(path: &Path) -> Result<Self, ResolveError> {
        let text = tokio::fs::read_to_string(path).await?;
        let names: Vec<String> = match serde_json::from_str::<Vec<String>>(&text) {
            Ok(names) => names,
            Err(_) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect(),
        };
        debug!("已安装模型 {} 个", names.len());
        Ok(Self::new(names))
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains(file_name(name))
    }

    /// 读取工作流声明的模型，按名称去重，先出现的为准
    pub fn declared_models(workflow: &Value) -> Result<Vec<WorkflowModelRef>, ResolveError> {
        if !workflow.is_object() {
            return Err(ResolveError::InvalidWorkflow("顶层必须是对象".to_string()));
        }

        let mut declared = Vec::new();
        collect_models(workflow.get("models"), &mut declared);
        if let Some(nodes) = workflow.get("nodes").and_then(Value::as_array) {
            for node in nodes {
                collect_models(
                    node.get("properties").and_then(|p| p.get("models")),
                    &mut declared,
                );
            }
        }

        let mut seen = HashSet::new();
        declared.retain(|model| seen.insert(model.name.clone()));
        Ok(declared)
    }

    pub fn find_missing(&self, workflow: &Value) -> Result<MissingModels, ResolveError> {
        let mut result = MissingModels::default();
        for model in Self::declared_models(workflow)? {
            if self.is_installed(&model.name) {
                continue;
            }
            if model.has_url() {
                result.missing.push(model);
            } else {
                warn!("模型 {} 没有下载地址，需要手动安装", model.name);
                result.unresolved.push(model);
            }
        }
        info!(
            "缺少 {} 个模型，其中 {} 个无法自动下载",
            result.missing.len() + result.unresolved.len(),
            result.unresolved.len()
        );
        Ok(result)
    }

    pub async fn load_workflow(path: &Path) -> Result<Value, ResolveError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// 把一个缺失模型转换成批量条目
pub fn to_transfer_spec(model: &WorkflowModelRef) -> Option<TransferSpec> {
    let url = model.url.as_deref()?.trim();
    if url.is_empty() {
        return None;
    }

    let provider = detect_provider(url);
    let spec = TransferSpec::new(provider, model.destination())
        .field("url", url)
        .with_label(model.name.clone());

    let spec = match provider {
        Provider::GoogleDrive => {
            // Google Drive 的文件名和扩展名分开传
            match model.name.rsplit_once('.') {
                Some((stem, ext)) => spec.field("filename", stem).field("extension", ext),
                None => spec.field("filename", model.name.clone()),
            }
        }
        Provider::GlobalModel => {
            let spec = spec.field("filename", model.name.clone());
            match model.directory.as_deref().map(str::trim) {
                Some(dir) if !dir.is_empty() => spec.field("model_type", dir),
                _ => spec,
            }
        }
        _ => spec.field("filename", model.name.clone()),
    };
    Some(spec)
}

pub fn to_transfer_specs(missing: &MissingModels) -> Vec<TransferSpec> {
    missing.missing.iter().filter_map(to_transfer_spec).collect()
}

fn collect_models(value: Option<&Value>, out: &mut Vec<WorkflowModelRef>) {
    let Some(entries) = value.and_then(Value::as_array) else {
        return;
    };
    for entry in entries {
        match serde_json::from_value::<WorkflowModelRef>(entry.clone()) {
            Ok(model) if !model.name.trim().is_empty() => out.push(model),
            Ok(_) => debug!("跳过没有名称的模型条目"),
            Err(e) => debug!("跳过无法识别的模型条目: {}", e),
        }
    }
}

// 只比较文件名，忽略目录
fn file_name(name: &str) -> &str {
    let name = name.trim();
    name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow() -> Value {
        json!({
            "models": [
                { "name": "sdxl.safetensors", "url": "https://huggingface.co/a/b/resolve/main/sdxl.safetensors", "directory": "checkpoints" },
                { "name": "vae.pt", "url": "https://example.com/vae.pt", "directory": "vae" }
            ],
            "nodes": [
                { "id": 1, "properties": { "models": [
                    { "name": "sdxl.safetensors", "url": "https://mirror.example.com/other", "directory": "other" },
                    { "name": "lora.safetensors", "url": "https://civitai.com/api/download/models/1", "directory": "loras" }
                ] } },
                { "id": 2, "properties": {} },
                { "id": 3, "properties": { "models": [
                    { "name": "upscale.pth", "directory": "upscale_models" },
                    { "url": "https://example.com/nameless" }
                ] } }
            ]
        })
    }

    #[test]
    fn test_dedupe_first_occurrence_wins() {
        let declared = ModelResolver::declared_models(&workflow()).unwrap();
        let names: Vec<&str> = declared.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            ["sdxl.safetensors", "vae.pt", "lora.safetensors", "upscale.pth"]
        );
        assert_eq!(declared[0].directory.as_deref(), Some("checkpoints"));
    }

    #[test]
    fn test_find_missing_filters_installed() {
        let resolver = ModelResolver::new(["checkpoints/sdxl.safetensors", "vae.pt"]);
        let missing = resolver.find_missing(&workflow()).unwrap();
        assert_eq!(missing.missing.len(), 1);
        assert_eq!(missing.missing[0].name, "lora.safetensors");
        assert_eq!(missing.unresolved.len(), 1);
        assert_eq!(missing.unresolved[0].name, "upscale.pth");
    }

    #[test]
    fn test_spec_per_provider() {
        let hf = to_transfer_spec(&WorkflowModelRef {
            name: "sdxl.safetensors".to_string(),
            url: Some("https://huggingface.co/a/b/resolve/main/sdxl.safetensors".to_string()),
            directory: Some("checkpoints".to_string()),
        })
        .unwrap();
        assert_eq!(hf.provider, Provider::HuggingFace);
        assert_eq!(hf.path, "models/checkpoints");

        let gd = to_transfer_spec(&WorkflowModelRef {
            name: "model.v2.safetensors".to_string(),
            url: Some("https://drive.google.com/file/d/abc/view".to_string()),
            directory: None,
        })
        .unwrap();
        assert_eq!(gd.provider, Provider::GoogleDrive);
        assert_eq!(gd.path, "models");
        assert_eq!(gd.fields.get("filename").map(String::as_str), Some("model.v2"));
        assert_eq!(gd.fields.get("extension").map(String::as_str), Some("safetensors"));

        let gm = to_transfer_spec(&WorkflowModelRef {
            name: "vae.pt".to_string(),
            url: Some("https://example.com/vae.pt".to_string()),
            directory: Some("vae".to_string()),
        })
        .unwrap();
        assert_eq!(gm.provider, Provider::GlobalModel);
        assert_eq!(gm.fields.get("model_type").map(String::as_str), Some("vae"));
    }

    #[test]
    fn test_rejects_non_object_workflow() {
        assert!(matches!(
            ModelResolver::declared_models(&json!([1, 2])),
            Err(ResolveError::InvalidWorkflow(_))
        ));
    }
}
