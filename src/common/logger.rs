use colored::*;

use crate::downloader::{
    batch::{BatchJob, ItemOutcome},
    models::{SessionState, StatusRecord},
};

/// 终端里给人看的输出，日志走 tracing
pub struct PrettyLogger;

impl PrettyLogger {
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    pub fn error(message: impl AsRef<str>) {
        println!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示步骤开始
    pub fn step_start(step: impl AsRef<str>) {
        println!("\n{} {}", "▶".cyan().bold(), step.as_ref().bold());
    }

    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    fn state_badge(state: SessionState) -> ColoredString {
        let text = state.to_string();
        match state {
            SessionState::Pending => text.bright_black(),
            SessionState::Downloading => text.blue(),
            SessionState::Completed => text.green().bold(),
            SessionState::Failed => text.red().bold(),
            SessionState::Cancelled => text.yellow(),
            SessionState::AccessRestricted => text.magenta().bold(),
        }
    }

    /// 单个会话的最终状态
    pub fn status(label: impl AsRef<str>, record: &StatusRecord) {
        let mut line = format!(
            "{} [{}] {} {:.1}%",
            "⬇".blue().bold(),
            Self::state_badge(record.state),
            label.as_ref(),
            record.percentage
        );
        if !record.message.is_empty() {
            line.push_str(&format!(" - {}", record.message.bright_black()));
        }
        println!("{}", line);
    }

    /// 批量条目结束时的一行
    pub fn item_outcome(outcome: &ItemOutcome) {
        let id = outcome
            .session_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>3}. [{}] {} ({}) {}",
            outcome.index + 1,
            Self::state_badge(outcome.state),
            outcome.label.bold(),
            id.bright_black(),
            outcome.message
        );
    }

    /// 批量任务结束后的汇总
    pub fn batch_summary(job: &BatchJob) {
        Self::separator();
        let headline = if job.completed_count() == job.len() {
            "🎉 全部完成！".green().bold()
        } else {
            "📦 批量任务结束".yellow().bold()
        };
        println!("{} {:.1}%", headline, job.overall_progress());
        println!(
            "  完成 {}  失败 {}  取消 {}  需要凭据 {}",
            job.completed_count().to_string().green(),
            job.failed_count().to_string().red(),
            job.cancelled_count().to_string().yellow(),
            job.restricted_count().to_string().magenta()
        );
        if job.restricted_count() > 0 {
            println!(
                "{}",
                "   需要凭据的项可以加上 --token / --api-key 重新同步".bright_black()
            );
        }
    }
}

/// 便捷宏用于漂亮的日志输出
#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::success(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::warning(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::error(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_step {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::step_start(format!($($arg)*))
    };
}
