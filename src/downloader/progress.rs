use std::{collections::HashMap, sync::Arc};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use super::{
    models::{BatchEvent, BatchId, OrchestratorEvent, SessionId, SessionState, StatusRecord},
    registry::SessionRegistry,
};

// 进度条按千分比推进，保留一位小数
const BAR_SCALE: u64 = 1000;

fn session_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>10.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

fn batch_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>10.bold.magenta} [{elapsed_precise}] {wide_bar:.magenta} {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn position(percentage: f64) -> u64 {
    (percentage.clamp(0.0, 100.0) * BAR_SCALE as f64 / 100.0).round() as u64
}

/// 终端进度展示：每个会话一条进度条，批量任务额外一条总进度
pub struct TransferProgress {
    multi: MultiProgress,
    registry: Arc<SessionRegistry>,
    sessions: HashMap<SessionId, ProgressBar>,
    batches: HashMap<BatchId, ProgressBar>,
}

impl TransferProgress {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_target(registry, ProgressDrawTarget::stderr())
    }

    pub fn hidden(registry: Arc<SessionRegistry>) -> Self {
        Self::with_target(registry, ProgressDrawTarget::hidden())
    }

    fn with_target(registry: Arc<SessionRegistry>, target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            registry,
            sessions: HashMap::new(),
            batches: HashMap::new(),
        }
    }

    /// 持续消费事件直到通道关闭
    pub async fn run(mut self, mut events: broadcast::Receiver<OrchestratorEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("进度展示落后，跳过 {} 条事件", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.finish();
    }

    pub fn apply(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::Status(record) => self.apply_status(record),
            OrchestratorEvent::Batch(event) => self.apply_batch(event),
        }
    }

    /// 仍在显示中的会话数
    pub fn active_bars(&self) -> usize {
        self.sessions.len()
    }

    fn apply_status(&mut self, record: &StatusRecord) {
        let bar = match self.sessions.get(&record.session_id) {
            Some(bar) => bar.clone(),
            None => {
                // 终止状态才第一次出现的会话不再画条，避免残留
                if record.state.is_terminal() {
                    return;
                }
                let bar = self.multi.add(ProgressBar::new(BAR_SCALE));
                bar.set_style(session_style());
                let label = self
                    .registry
                    .get(&record.session_id)
                    .map(|session| session.label)
                    .unwrap_or_else(|| record.session_id.to_string());
                bar.set_prefix(label);
                self.sessions.insert(record.session_id.clone(), bar.clone());
                bar
            }
        };

        bar.set_position(position(record.percentage));

        match record.state {
            SessionState::Pending | SessionState::Downloading => {
                bar.set_message(record.message.clone());
            }
            SessionState::Completed => {
                bar.set_position(BAR_SCALE);
                bar.finish_with_message(format!("✓ {}", record.state));
                self.sessions.remove(&record.session_id);
            }
            _ => {
                let message = if record.message.is_empty() {
                    format!("✗ {}", record.state)
                } else {
                    format!("✗ {}: {}", record.state, record.message)
                };
                bar.abandon_with_message(message);
                self.sessions.remove(&record.session_id);
            }
        }
    }

    fn apply_batch(&mut self, event: &BatchEvent) {
        let bar = self
            .batches
            .entry(event.batch_id)
            .or_insert_with(|| {
                let bar = self.multi.insert(0, ProgressBar::new(BAR_SCALE));
                bar.set_style(batch_style());
                bar.set_prefix("批量");
                bar
            })
            .clone();

        bar.set_position(position(event.overall_progress));
        bar.set_message(format!(
            "完成 {} / 失败 {}",
            event.completed_count, event.failed_count
        ));
    }

    fn finish(&mut self) {
        for (_, bar) in self.sessions.drain() {
            bar.abandon();
        }
        for (_, bar) in self.batches.drain() {
            bar.finish();
        }
    }
}
