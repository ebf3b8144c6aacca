use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::config::EndpointTable;

use super::{
    error::{ValidationError, ValidationReason},
    models::{FormFields, Provider, SessionId},
};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Map<String, Value>),
    // 本地文件以 multipart 方式上传
    Multipart { fields: FormFields, file: PathBuf },
}

/// 构建好的启动请求，session_id 在发送前才填入
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub provider: Provider,
    pub endpoint: String,
    pub progress_endpoint: String,
    pub destination_path: String,
    pub body: RequestBody,
}

impl TransferRequest {
    pub fn field(&self, key: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Json(map) => map.get(key).and_then(Value::as_str),
            RequestBody::Multipart { fields, .. } => fields.get(key).map(String::as_str),
        }
    }

    /// JSON 请求体：{ session_id, path, ...字段 }
    pub fn json_payload(&self, session_id: &SessionId) -> Option<Value> {
        match &self.body {
            RequestBody::Json(map) => {
                let mut payload = map.clone();
                payload.insert("session_id".to_string(), Value::from(session_id.as_str()));
                payload.insert("path".to_string(), Value::from(self.destination_path.as_str()));
                Some(Value::Object(payload))
            }
            RequestBody::Multipart { .. } => None,
        }
    }
}

/// 把传输意图映射为请求，纯函数，不做任何网络或文件操作
#[derive(Debug, Clone, Default)]
pub struct ProviderAdapter {
    endpoints: EndpointTable,
}

impl ProviderAdapter {
    pub fn new(endpoints: EndpointTable) -> Self {
        Self { endpoints }
    }

    pub fn build(
        &self,
        provider: Provider,
        fields: &FormFields,
        destination_path: &str,
    ) -> Result<TransferRequest, Vec<ValidationError>> {
        let mut errors = Vec::new();

        if is_root_destination(destination_path) {
            errors.push(ValidationError::new("path", ValidationReason::RootDestination));
        }

        let body = match provider {
            Provider::DirectLink => {
                let mut body = Map::new();
                if let Some(url) = require_url(fields, "url", &mut errors) {
                    body.insert("url".into(), url.into());
                }
                copy_optional(fields, &["filename"], &mut body);
                RequestBody::Json(body)
            }
            Provider::GoogleDrive => {
                let mut body = Map::new();
                if let Some(raw) = require(fields, "url", &mut errors) {
                    match google_drive_file_id(raw) {
                        Some(id) => {
                            body.insert("file_id".into(), id.into());
                        }
                        None => {
                            errors.push(ValidationError::new("url", ValidationReason::InvalidUrl))
                        }
                    }
                }
                if let Some(filename) = require(fields, "filename", &mut errors) {
                    body.insert("filename".into(), filename.into());
                }
                if let Some(extension) = require(fields, "extension", &mut errors) {
                    let extension = normalize_extension(extension);
                    if extension.is_empty() {
                        errors.push(ValidationError::new(
                            "extension",
                            ValidationReason::EmptyExtension,
                        ));
                    } else {
                        body.insert("extension".into(), extension.into());
                    }
                }
                RequestBody::Json(body)
            }
            Provider::HuggingFace | Provider::Civitai => {
                let mut body = Map::new();
                if let Some(url) = require_url(fields, "url", &mut errors) {
                    body.insert("url".into(), url.into());
                }
                copy_optional(fields, &["filename"], &mut body);
                if let Some(credential) = provider.credential_field() {
                    copy_optional(fields, &[credential], &mut body);
                }
                RequestBody::Json(body)
            }
            Provider::GenericUpload => {
                let mut multipart = FormFields::new();
                let file = require(fields, "source", &mut errors).map(PathBuf::from);
                let filename = non_empty(fields, "filename").map(str::to_string).or_else(|| {
                    file.as_deref()
                        .and_then(Path::file_name)
                        .map(|name| name.to_string_lossy().into_owned())
                });
                if let Some(filename) = filename {
                    multipart.insert("filename".to_string(), filename);
                }
                multipart.insert("path".to_string(), destination_path.trim().to_string());
                RequestBody::Multipart {
                    fields: multipart,
                    file: file.unwrap_or_default(),
                }
            }
            Provider::GlobalModel => {
                let mut body = Map::new();
                if let Some(url) = require_url(fields, "url", &mut errors) {
                    body.insert("url".into(), url.into());
                }
                if let Some(filename) = require(fields, "filename", &mut errors) {
                    body.insert("filename".into(), filename.into());
                }
                copy_optional(fields, &["model_type"], &mut body);
                RequestBody::Json(body)
            }
        };

        if !errors.is_empty() {
            debug!("{} 表单校验失败: {:?}", provider, errors);
            return Err(errors);
        }

        let endpoints = self.endpoints.for_provider(provider);
        Ok(TransferRequest {
            provider,
            endpoint: endpoints.start.clone(),
            progress_endpoint: endpoints.progress.clone(),
            destination_path: destination_path.trim().to_string(),
            body,
        })
    }
}

/// 空路径、"/"、"." 之类都视为根目录
pub fn is_root_destination(path: &str) -> bool {
    path.trim()
        .trim_matches(|c| c == '/' || c == '\\' || c == '.')
        .trim()
        .is_empty()
}

/// ".safetensors" -> "safetensors"
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').trim().to_string()
}

/// 支持分享链接和裸文件 ID
pub fn google_drive_file_id(input: &str) -> Option<String> {
    lazy_static! {
        static ref FILE_PATH_PATTERN: Regex = Regex::new(r"/file/d/([A-Za-z0-9_-]+)").unwrap();
        static ref QUERY_ID_PATTERN: Regex = Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").unwrap();
        static ref RAW_ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]{10,}$").unwrap();
    }

    let input = input.trim();
    if RAW_ID_PATTERN.is_match(input) {
        return Some(input.to_string());
    }

    for pattern in [&*FILE_PATH_PATTERN, &*QUERY_ID_PATTERN] {
        if let Some(caps) = pattern.captures(input) {
            return Some(caps[1].to_string());
        }
    }
    None
}

fn non_empty<'a>(fields: &'a FormFields, key: &str) -> Option<&'a str> {
    fields
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require<'a>(
    fields: &'a FormFields,
    key: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<&'a str> {
    let value = non_empty(fields, key);
    if value.is_none() {
        errors.push(ValidationError::new(key, ValidationReason::Missing));
    }
    value
}

fn require_url(
    fields: &FormFields,
    key: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<String> {
    let raw = require(fields, key, errors)?;
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url.to_string()),
        _ => {
            errors.push(ValidationError::new(key, ValidationReason::InvalidUrl));
            None
        }
    }
}

fn copy_optional(fields: &FormFields, keys: &[&str], body: &mut Map<String, Value>) {
    for key in keys {
        if let Some(value) = non_empty(fields, key) {
            body.insert(key.to_string(), value.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FormFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn complete_fields(provider: Provider) -> FormFields {
        match provider {
            Provider::GoogleDrive => fields(&[
                ("url", "https://drive.google.com/file/d/1AbCdEfGhIjKlMn/view"),
                ("filename", "model"),
                ("extension", "safetensors"),
            ]),
            Provider::GenericUpload => fields(&[("source", "/tmp/model.safetensors")]),
            _ => fields(&[
                ("url", "https://example.com/model.safetensors"),
                ("filename", "model.safetensors"),
            ]),
        }
    }

    #[test]
    fn test_root_destination_always_rejected() {
        let adapter = ProviderAdapter::default();
        for provider in Provider::ALL {
            for root in ["", "   ", "/", ".", "./", "//", "\\"] {
                let errors = adapter
                    .build(provider, &complete_fields(provider), root)
                    .unwrap_err();
                assert!(
                    errors.iter().any(|e| {
                        e.field == "path" && e.reason == ValidationReason::RootDestination
                    }),
                    "{} 接受了根目录 {:?}",
                    provider,
                    root
                );
            }
            let request = adapter
                .build(provider, &complete_fields(provider), "models/loras")
                .unwrap();
            assert_eq!(request.destination_path, "models/loras");
        }
    }

    #[test]
    fn test_empty_url_reports_url_field() {
        let adapter = ProviderAdapter::default();
        let errors = adapter
            .build(Provider::DirectLink, &fields(&[("url", "  ")]), "models")
            .unwrap_err();
        assert_eq!(errors, vec![ValidationError::new("url", ValidationReason::Missing)]);
    }

    #[test]
    fn test_all_invalid_fields_reported_together() {
        let adapter = ProviderAdapter::default();
        let errors = adapter
            .build(Provider::GoogleDrive, &fields(&[("extension", "...")]), "/")
            .unwrap_err();
        let names: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(names, vec!["path", "url", "filename", "extension"]);
        assert_eq!(errors[3].reason, ValidationReason::EmptyExtension);
    }

    #[test]
    fn test_google_drive_extension_normalized() {
        let adapter = ProviderAdapter::default();
        let request = adapter
            .build(
                Provider::GoogleDrive,
                &fields(&[
                    ("url", "https://drive.google.com/open?id=1AbCdEfGhIjKlMn"),
                    ("filename", "model"),
                    ("extension", ".safetensors"),
                ]),
                "models/checkpoints",
            )
            .unwrap();
        assert_eq!(request.field("extension"), Some("safetensors"));
        assert_eq!(request.field("filename"), Some("model"));
        assert_eq!(request.field("file_id"), Some("1AbCdEfGhIjKlMn"));
    }

    #[test]
    fn test_payload_carries_session_and_path() {
        let adapter = ProviderAdapter::default();
        let request = adapter
            .build(
                Provider::Civitai,
                &fields(&[("url", "https://civitai.com/api/download/models/1"), ("api_key", "k")]),
                "models/loras",
            )
            .unwrap();
        let payload = request.json_payload(&SessionId::from("civ_1_abc")).unwrap();
        assert_eq!(payload["session_id"], "civ_1_abc");
        assert_eq!(payload["path"], "models/loras");
        assert_eq!(payload["api_key"], "k");
        assert_eq!(request.endpoint, "/filemanager/download/civitai");
    }

    #[test]
    fn test_upload_defaults_filename_to_source() {
        let adapter = ProviderAdapter::default();
        let request = adapter
            .build(
                Provider::GenericUpload,
                &fields(&[("source", "/data/vae/ae.safetensors")]),
                "models/vae",
            )
            .unwrap();
        assert_eq!(request.field("filename"), Some("ae.safetensors"));
        assert!(request.json_payload(&SessionId::from("up_1_x")).is_none());
    }

    #[test]
    fn test_rejects_non_http_urls() {
        let adapter = ProviderAdapter::default();
        let errors = adapter
            .build(Provider::HuggingFace, &fields(&[("url", "ftp://host/x")]), "models")
            .unwrap_err();
        assert_eq!(errors[0].reason, ValidationReason::InvalidUrl);
    }
}
