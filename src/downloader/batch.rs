use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use futures::{
    Stream, StreamExt,
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    future::BoxFuture,
};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;

use super::{
    TransferOrchestrator,
    cancel::CancelAck,
    models::{
        BatchEvent, BatchId, FormFields, OrchestratorEvent, SessionId, SessionState,
        StatusRecord, TransferSpec,
    },
};

/// 批量任务的启动节奏
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    pub stagger: Duration,    // 相邻两项启动之间的间隔
    pub max_in_flight: usize, // 同时进行中的会话上限，1 表示顺序执行
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(500),
            max_in_flight: 1,
        }
    }
}

impl ConcurrencyPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            stagger: config.stagger(),
            max_in_flight: config.max_in_flight.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub spec: TransferSpec,
    pub label: String,
    pub session_id: Option<SessionId>,
    pub state: SessionState,
    pub percentage: f64,
    pub total_bytes: Option<u64>,
    pub message: String,
    pub retry_count: u32,
}

impl BatchItem {
    fn new(spec: TransferSpec) -> Self {
        Self {
            label: spec.display_label(),
            spec,
            session_id: None,
            state: SessionState::Pending,
            percentage: 0.0,
            total_bytes: None,
            message: String::new(),
            retry_count: 0,
        }
    }

    // 计入总进度时的权重
    fn weight(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => total as f64,
            _ => 1.0,
        }
    }

    fn contribution(&self) -> f64 {
        match self.state {
            SessionState::Completed => 100.0,
            // 未完成的项不能把总进度推到 100
            _ => self.percentage.clamp(0.0, 99.9),
        }
    }
}

/// 一次批量操作，所有计数都由条目状态现算
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub id: BatchId,
    pub items: Vec<BatchItem>,
}

impl BatchJob {
    pub fn new(specs: Vec<TransferSpec>) -> Self {
        Self {
            id: BatchId::new(),
            items: specs.into_iter().map(BatchItem::new).collect(),
        }
    }

    fn count(&self, state: SessionState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.count(SessionState::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(SessionState::Failed)
    }

    pub fn cancelled_count(&self) -> usize {
        self.count(SessionState::Cancelled)
    }

    pub fn restricted_count(&self) -> usize {
        self.count(SessionState::AccessRestricted)
    }

    /// 尚未结束的项（等待中或下载中）
    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| !item.state.is_terminal())
            .count()
    }

    /// 按字节数加权的平均进度；只有全部完成时才会是 100
    pub fn overall_progress(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        if self
            .items
            .iter()
            .all(|item| item.state == SessionState::Completed)
        {
            return 100.0;
        }

        let (weighted, weights) = self.items.iter().fold((0.0, 0.0), |(sum, w), item| {
            let weight = item.weight();
            (sum + item.contribution() * weight, w + weight)
        });
        (weighted / weights).clamp(0.0, 99.9)
    }

    pub fn event(&self) -> BatchEvent {
        BatchEvent {
            batch_id: self.id,
            completed_count: self.completed_count(),
            failed_count: self.failed_count(),
            overall_progress: self.overall_progress(),
        }
    }

    /// 把某个会话的状态记录合并到对应条目
    pub fn observe(&mut self, index: usize, record: &StatusRecord, total_bytes: Option<u64>) {
        let Some(item) = self.items.get_mut(index) else {
            warn!("批量任务 {} 没有第 {} 项", self.id, index);
            return;
        };

        let same_session = item.session_id.as_ref() == Some(&record.session_id);
        if !same_session {
            // 需要凭据的项可以由新会话接替，其余终止状态不再变化
            if item.state.is_terminal() && item.state != SessionState::AccessRestricted {
                return;
            }
            if item.session_id.is_some() {
                item.retry_count += 1;
            }
            item.session_id = Some(record.session_id.clone());
            item.percentage = 0.0;
        } else if item.state.is_terminal() {
            return;
        }

        item.state = record.state;
        item.message = record.message.clone();
        item.total_bytes = total_bytes.or(item.total_bytes);
        item.percentage = match record.state {
            SessionState::Completed => 100.0,
            _ => item.percentage.max(record.percentage),
        };
    }

    // 没有会话可以承载的结果，例如校验失败或未启动就被取消
    fn settle(&mut self, index: usize, state: SessionState, message: String) {
        if let Some(item) = self.items.get_mut(index) {
            if item.state.is_terminal() && item.state != SessionState::AccessRestricted {
                return;
            }
            item.state = state;
            item.message = message;
        }
    }

    /// 失败和需要凭据的项，凭据只合并进后者
    pub fn retry_items(&self, credentials: &FormFields) -> Vec<TransferSpec> {
        self.items
            .iter()
            .filter_map(|item| match item.state {
                SessionState::Failed => Some(item.spec.clone()),
                SessionState::AccessRestricted => Some(item.spec.with_credentials(credentials)),
                _ => None,
            })
            .collect()
    }

    fn outcome(&self, index: usize) -> Option<ItemOutcome> {
        self.items.get(index).map(|item| ItemOutcome {
            index,
            label: item.label.clone(),
            session_id: item.session_id.clone(),
            state: item.state,
            message: item.message.clone(),
        })
    }
}

/// 单个条目的最终结果，按完成先后从 `BatchRun` 中产出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub index: usize,
    pub label: String,
    pub session_id: Option<SessionId>,
    pub state: SessionState,
    pub message: String,
}

fn lock(job: &Mutex<BatchJob>) -> MutexGuard<'_, BatchJob> {
    job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 一次批量执行，产出有限个 `ItemOutcome` 后结束，不可重启
pub struct BatchRun {
    id: BatchId,
    outcomes: UnboundedReceiver<ItemOutcome>,
    job: Arc<Mutex<BatchJob>>,
    token: CancellationToken,
    orchestrator: Arc<TransferOrchestrator>,
}

impl BatchRun {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn job(&self) -> BatchJob {
        lock(&self.job).clone()
    }

    /// 取消所有未结束的条目，尚未启动的项直接记为已取消
    pub fn cancel(&self) -> Vec<BoxFuture<'static, CancelAck>> {
        self.token.cancel();
        let open: Vec<SessionId> = lock(&self.job)
            .items
            .iter()
            .filter(|item| !item.state.is_terminal())
            .filter_map(|item| item.session_id.clone())
            .collect();

        info!("取消批量任务 {}，{} 个会话进行中", self.id, open.len());
        open.iter().map(|id| self.orchestrator.cancel(id)).collect()
    }

    /// 等待全部条目结束
    pub async fn finish(mut self) -> (Vec<ItemOutcome>, BatchJob) {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.outcomes.next().await {
            outcomes.push(outcome);
        }
        let job = self.job();
        (outcomes, job)
    }
}

impl Stream for BatchRun {
    type Item = ItemOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().outcomes.poll_next_unpin(cx)
    }
}

pub struct BatchCoordinator {
    orchestrator: Arc<TransferOrchestrator>,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<TransferOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn run(&self, items: Vec<TransferSpec>, policy: ConcurrencyPolicy) -> BatchRun {
        let job = BatchJob::new(items.clone());
        let id = job.id;
        let job = Arc::new(Mutex::new(job));
        let (tx, rx) = mpsc::unbounded();
        let token = CancellationToken::new();

        info!(
            "📦 批量任务 {} 开始: {} 项，间隔 {:?}，并发上限 {}",
            id,
            items.len(),
            policy.stagger,
            policy.max_in_flight
        );

        self.orchestrator.track_batch(id, token.clone());
        tokio::spawn(drive(
            Arc::clone(&self.orchestrator),
            items,
            policy,
            Arc::clone(&job),
            tx,
            token.clone(),
        ));

        BatchRun {
            id,
            outcomes: rx,
            job,
            token,
            orchestrator: Arc::clone(&self.orchestrator),
        }
    }

    /// 由上一次批量结果生成重试条目
    pub fn retry_failed(previous: &BatchJob, credentials: &FormFields) -> Vec<TransferSpec> {
        previous.retry_items(credentials)
    }
}

fn publish(orchestrator: &TransferOrchestrator, job: &Mutex<BatchJob>) {
    let event = lock(job).event();
    // 没有订阅者时发送失败是正常情况
    let _ = orchestrator
        .registry()
        .events()
        .send(OrchestratorEvent::Batch(event));
}

fn settle_and_report(
    orchestrator: &TransferOrchestrator,
    job: &Mutex<BatchJob>,
    tx: &UnboundedSender<ItemOutcome>,
    index: usize,
    state: SessionState,
    message: String,
) {
    let outcome = {
        let mut job = lock(job);
        job.settle(index, state, message);
        job.outcome(index)
    };
    publish(orchestrator, job);
    if let Some(outcome) = outcome {
        let _ = tx.unbounded_send(outcome);
    }
}

async fn drive(
    orchestrator: Arc<TransferOrchestrator>,
    items: Vec<TransferSpec>,
    policy: ConcurrencyPolicy,
    job: Arc<Mutex<BatchJob>>,
    tx: UnboundedSender<ItemOutcome>,
    token: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(policy.max_in_flight.max(1)));
    let total = items.len();
    let mut members = Vec::with_capacity(total);

    for (index, spec) in items.into_iter().enumerate() {
        if index > 0 && !policy.stagger.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(policy.stagger) => {}
            }
        }

        let permit = tokio::select! {
            _ = token.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };

        let permit = match permit {
            Some(permit) if !token.is_cancelled() => permit,
            _ => {
                debug!("批量任务已取消，跳过剩余 {} 项", total - index);
                for skipped in index..total {
                    settle_and_report(
                        &orchestrator,
                        &job,
                        &tx,
                        skipped,
                        SessionState::Cancelled,
                        "批量任务已取消".to_string(),
                    );
                }
                break;
            }
        };

        members.push(tokio::spawn(run_item(
            Arc::clone(&orchestrator),
            index,
            spec,
            Arc::clone(&job),
            tx.clone(),
            token.clone(),
            permit,
        )));
    }

    for member in members {
        if let Err(e) = member.await {
            error!("批量任务条目异常退出: {}", e);
        }
    }

    let job = lock(&job);
    orchestrator.untrack_batch(&job.id);
    info!(
        "📦 批量任务 {} 结束: 完成 {}，失败 {}，取消 {}，需要凭据 {}",
        job.id,
        job.completed_count(),
        job.failed_count(),
        job.cancelled_count(),
        job.restricted_count()
    );
}

async fn run_item(
    orchestrator: Arc<TransferOrchestrator>,
    index: usize,
    spec: TransferSpec,
    job: Arc<Mutex<BatchJob>>,
    tx: UnboundedSender<ItemOutcome>,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let mut on_status = |record: &StatusRecord| {
        let total_bytes = orchestrator
            .registry()
            .get(&record.session_id)
            .and_then(|session| session.progress.total_bytes);
        lock(&job).observe(index, record, total_bytes);
        publish(&orchestrator, &job);

        // 批量取消时本项可能还没拿到会话 ID，这里补一次取消
        if record.state == SessionState::Pending && token.is_cancelled() {
            tokio::spawn(orchestrator.cancel(&record.session_id));
        }
    };

    match orchestrator.execute(&spec, &mut on_status).await {
        Ok(record) => {
            debug!("批量条目 {} 结束: {}", index, record.state);
            let outcome = lock(&job).outcome(index);
            if let Some(outcome) = outcome {
                let _ = tx.unbounded_send(outcome);
            }
        }
        Err(e) => {
            warn!("批量条目 {} 失败: {}", index, e);
            settle_and_report(
                &orchestrator,
                &job,
                &tx,
                index,
                SessionState::Failed,
                e.to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::models::Provider;

    fn spec(name: &str) -> TransferSpec {
        TransferSpec::new(Provider::DirectLink, "models/checkpoints")
            .field("url", format!("https://example.com/{}", name))
            .with_label(name)
    }

    fn record(id: &str, state: SessionState, percentage: f64) -> StatusRecord {
        StatusRecord {
            session_id: SessionId::from(id),
            state,
            message: String::new(),
            percentage,
        }
    }

    fn new_job(n: usize) -> BatchJob {
        BatchJob::new((0..n).map(|i| spec(&format!("m{}", i))).collect())
    }

    #[test]
    fn test_empty_batch_progress() {
        let job = new_job(0);
        assert_eq!(job.overall_progress(), 0.0);
        assert_eq!(job.pending_count(), 0);
    }

    #[test]
    fn test_overall_progress_weighted_by_bytes() {
        let mut job = new_job(2);
        job.observe(0, &record("a", SessionState::Downloading, 50.0), Some(300));
        job.observe(1, &record("b", SessionState::Downloading, 10.0), Some(100));
        // (50 * 300 + 10 * 100) / 400
        assert!((job.overall_progress() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_size_weighs_one() {
        let mut job = new_job(2);
        job.observe(0, &record("a", SessionState::Downloading, 80.0), None);
        job.observe(1, &record("b", SessionState::Downloading, 20.0), None);
        assert!((job.overall_progress() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_hundred_only_when_all_completed() {
        let mut job = new_job(2);
        job.observe(0, &record("a", SessionState::Completed, 100.0), None);
        job.observe(1, &record("b", SessionState::Failed, 100.0), None);
        assert!(job.overall_progress() < 100.0);

        let mut job = new_job(2);
        job.observe(0, &record("a", SessionState::Completed, 100.0), None);
        job.observe(1, &record("b", SessionState::Completed, 0.0), None);
        assert_eq!(job.overall_progress(), 100.0);
    }

    #[test]
    fn test_counts_independent_of_completion_order() {
        let updates = [
            (0, record("a", SessionState::Completed, 100.0)),
            (1, record("b", SessionState::Failed, 30.0)),
            (2, record("c", SessionState::AccessRestricted, 0.0)),
            (3, record("d", SessionState::Cancelled, 10.0)),
        ];

        let mut forward = new_job(4);
        for (i, r) in updates.iter() {
            forward.observe(*i, r, Some(100));
        }
        let mut backward = new_job(4);
        for (i, r) in updates.iter().rev() {
            backward.observe(*i, r, Some(100));
        }

        assert_eq!(forward.event().completed_count, backward.event().completed_count);
        assert_eq!(forward.event().failed_count, backward.event().failed_count);
        assert_eq!(forward.overall_progress(), backward.overall_progress());
        assert_eq!(forward.completed_count(), 1);
        assert_eq!(forward.failed_count(), 1);
        assert_eq!(forward.restricted_count(), 1);
        assert_eq!(forward.cancelled_count(), 1);
    }

    #[test]
    fn test_terminal_item_ignores_late_updates() {
        let mut job = new_job(1);
        job.observe(0, &record("a", SessionState::Cancelled, 40.0), None);
        job.observe(0, &record("a", SessionState::Completed, 100.0), None);
        assert_eq!(job.items[0].state, SessionState::Cancelled);
    }

    #[test]
    fn test_restricted_item_taken_over_by_new_session() {
        let mut job = new_job(1);
        job.observe(0, &record("a", SessionState::AccessRestricted, 0.0), None);
        job.observe(0, &record("b", SessionState::Pending, 0.0), None);
        assert_eq!(job.items[0].session_id, Some(SessionId::from("b")));
        assert_eq!(job.items[0].retry_count, 1);
        job.observe(0, &record("b", SessionState::Completed, 100.0), None);
        assert_eq!(job.completed_count(), 1);
    }

    #[test]
    fn test_retry_items_merge_credentials_into_restricted_only() {
        let mut job = new_job(3);
        job.observe(0, &record("a", SessionState::Completed, 100.0), None);
        job.observe(1, &record("b", SessionState::Failed, 0.0), None);
        job.observe(2, &record("c", SessionState::AccessRestricted, 0.0), None);

        let mut credentials = FormFields::new();
        credentials.insert("token".to_string(), "hf_secret".to_string());
        let retry = BatchCoordinator::retry_failed(&job, &credentials);

        assert_eq!(retry.len(), 2);
        assert!(!retry[0].fields.contains_key("token"));
        assert_eq!(retry[1].fields.get("token").map(String::as_str), Some("hf_secret"));
    }
}
