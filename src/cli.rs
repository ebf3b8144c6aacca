use clap::{Parser, Subcommand};
use std::path::PathBuf;

use model_transfer::downloader::models::{FormFields, Provider};

/// 远程模型传输工具
#[derive(Parser, Debug)]
#[command(name = "mtdl")]
#[command(version)]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "让文件管理后端下载或上传模型，并跟踪进度", long_about = None)]
pub struct Cli {
    /// 配置文件 (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 后端地址，覆盖配置文件中的 base_url
    #[arg(long, global = true, value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub base_url: Option<String>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 发起单个传输
    Download {
        /// 来源: direct-link, google-drive, huggingface, civitai, generic-upload, global-model
        #[arg(long, value_name = "PROVIDER")]
        provider: Provider,

        /// 后端文件树中的目标目录
        #[arg(long, value_name = "DIR")]
        path: String,

        /// 表单字段，可重复，如: --field url=https://... --field filename=model
        #[arg(short = 'f', long = "field", value_name = "KEY=VALUE")]
        #[arg(value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// 显示名称
        #[arg(long)]
        label: Option<String>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// 按 JSON 列表批量传输
    Sync {
        /// JSON 数组: [{ provider, path, fields, label? }]
        #[arg(long, value_name = "FILE")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        items: PathBuf,

        /// 同时进行的会话数，覆盖配置
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// 找出工作流缺少的模型并下载
    Resolve {
        /// 工作流 JSON
        #[arg(long, value_name = "FILE")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        workflow: PathBuf,

        /// 已安装的模型列表 (JSON 数组或每行一个文件名)
        #[arg(long, value_name = "FILE")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        installed: PathBuf,

        /// 只列出缺少的模型，不下载
        #[arg(long)]
        dry_run: bool,

        /// 同时进行的会话数，覆盖配置
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        #[command(flatten)]
        credentials: CredentialArgs,
    },
}

/// 遇到需要凭据时用来重试的凭据
#[derive(clap::Args, Debug, Default)]
pub struct CredentialArgs {
    /// Hugging Face token
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// CivitAI API key
    #[arg(long, value_name = "KEY")]
    pub api_key: Option<String>,
}

impl CredentialArgs {
    pub fn to_fields(&self) -> FormFields {
        let mut fields = FormFields::new();
        if let Some(token) = &self.token {
            fields.insert("token".to_string(), token.clone());
        }
        if let Some(key) = &self.api_key {
            fields.insert("api_key".to_string(), key.clone());
        }
        fields
    }
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("字段格式应为 KEY=VALUE: {}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("字段名不能为空: {}", raw));
    }
    Ok((key.to_string(), value.to_string()))
}
