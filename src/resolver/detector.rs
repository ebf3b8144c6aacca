use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::downloader::models::Provider;

lazy_static! {
    static ref HUGGINGFACE_HOST: Regex = Regex::new(r"(?i)(^|\.)(huggingface\.co|hf\.co)$").unwrap();
    static ref CIVITAI_HOST: Regex = Regex::new(r"(?i)(^|\.)civitai\.com$").unwrap();
    static ref GOOGLE_DRIVE_HOST: Regex =
        Regex::new(r"(?i)^(drive|docs)\.google\.com$").unwrap();
}

/// 根据下载地址判断该走哪种来源，认不出来的交给后端的模型下载接口
pub fn detect_provider(url: &str) -> Provider {
    let Ok(parsed) = Url::parse(url.trim()) else {
        return Provider::GlobalModel;
    };
    let Some(host) = parsed.host_str() else {
        return Provider::GlobalModel;
    };

    if HUGGINGFACE_HOST.is_match(host) {
        Provider::HuggingFace
    } else if CIVITAI_HOST.is_match(host) {
        Provider::Civitai
    } else if GOOGLE_DRIVE_HOST.is_match(host) {
        Provider::GoogleDrive
    } else {
        Provider::GlobalModel
    }
}
