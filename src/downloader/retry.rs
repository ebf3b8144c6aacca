use tracing::debug;

use crate::{
    common::client::models::transfer::{ProgressResponse, RemoteStatus, StartResponse},
    config::OrchestratorConfig,
};

use super::models::Progress;

/// 一次轮询得到的结果
#[derive(Debug, Clone)]
pub enum PollTick {
    Report(ProgressResponse),
    // 轮询请求本身失败，按传输失败处理
    Lost(String),
}

impl PollTick {
    pub fn is_terminal(&self) -> bool {
        match self {
            PollTick::Report(report) => !matches!(
                report.status,
                RemoteStatus::Downloading | RemoteStatus::Unknown
            ),
            PollTick::Lost(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Continue(Progress),
    Completed(Progress),
    Failed(String),
    Cancelled,
    AccessRestricted(String),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Continue(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted,
    Rejected(String),
    AccessRestricted(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 自动凭据重试上限，用户主动重试不受限制
    pub max_auto_credential_retries: u32,
    /// 允许连续失败的轮询次数
    pub poll_failure_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_auto_credential_retries: config.max_auto_credential_retries,
            poll_failure_retries: config.poll_failure_retries,
        }
    }

    pub fn classify_start(&self, response: &StartResponse) -> StartOutcome {
        if response.success {
            return StartOutcome::Accepted;
        }
        let message = response
            .error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "后端未说明原因".to_string());
        if response.is_access_restricted() {
            StartOutcome::AccessRestricted(message)
        } else {
            StartOutcome::Rejected(message)
        }
    }

    pub fn classify(&self, tick: &PollTick, last: &Progress) -> Outcome {
        let report = match tick {
            PollTick::Report(report) => report,
            PollTick::Lost(reason) => return Outcome::Failed(format!("轮询中断: {}", reason)),
        };

        let progress = Progress {
            downloaded_bytes: report.downloaded.unwrap_or(last.downloaded_bytes),
            total_bytes: report.total.filter(|t| *t > 0).or(last.total_bytes),
            percentage: derive_percentage(
                report.downloaded,
                report.total,
                report.percentage,
                last.percentage,
            ),
            message: report.message.clone(),
        };

        match report.status {
            RemoteStatus::Downloading => Outcome::Continue(progress),
            RemoteStatus::Unknown => {
                debug!("未知的后端状态，按下载中处理: {:?}", report);
                Outcome::Continue(progress)
            }
            RemoteStatus::Completed => Outcome::Completed(progress),
            RemoteStatus::Cancelled => Outcome::Cancelled,
            RemoteStatus::Error => Outcome::Failed(non_empty_or(&report.message, "传输失败")),
            RemoteStatus::AccessRestricted => {
                Outcome::AccessRestricted(non_empty_or(&report.message, "该资源需要访问凭据"))
            }
        }
    }

    pub fn allows_auto_credential_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_auto_credential_retries
    }
}

/// 计算百分比，结果始终在 [0, 100] 内，不会出现 NaN/Infinity
pub fn derive_percentage(
    downloaded: Option<u64>,
    total: Option<u64>,
    reported: Option<f64>,
    last: f64,
) -> f64 {
    let derived = match (downloaded, total) {
        (Some(downloaded), Some(total)) if total > 0 => downloaded as f64 / total as f64 * 100.0,
        _ => match reported {
            Some(pct) if pct.is_finite() => pct,
            _ if last.is_finite() => last,
            _ => 0.0,
        },
    };
    derived.clamp(0.0, 100.0)
}

fn non_empty_or(message: &str, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message.to_string()
    }
}
