use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use super::models::{OrchestratorEvent, Provider, Session, SessionId, StatusRecord};

struct SessionEntry {
    session: Session,
    status_tx: watch::Sender<StatusRecord>,
    seq: u64, // 注册顺序
}

/// 进程内唯一的会话表，不做持久化，重启后所有会话视为丢失
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>, // session_id -> 会话
    // 发放过的 ID 永不复用；只增不减，每个 ID 几十字节，随进程退出释放
    issued: DashSet<SessionId>,
    next_seq: AtomicU64,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl SessionRegistry {
    pub fn new(events: broadcast::Sender<OrchestratorEvent>) -> Self {
        Self {
            sessions: DashMap::new(),
            issued: DashSet::new(),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// 必须在发送网络请求之前调用
    pub fn create(
        &self,
        provider: Provider,
        label: impl Into<String>,
        destination_path: impl Into<String>,
        retry_count: u32,
    ) -> SessionId {
        self.register(provider, label.into(), destination_path.into(), retry_count)
            .0
    }

    // 注册并同时返回状态订阅，保证不会错过任何一次更新
    pub(crate) fn register(
        &self,
        provider: Provider,
        label: String,
        destination_path: String,
        retry_count: u32,
    ) -> (SessionId, watch::Receiver<StatusRecord>) {
        let id = loop {
            let candidate = SessionId::generate(provider);
            if self.issued.insert(candidate.clone()) {
                break candidate;
            }
            warn!("会话 ID 冲突，重新生成: {}", candidate);
        };

        let session = Session::new(id.clone(), provider, label, destination_path, retry_count);
        let (status_tx, status_rx) = watch::channel(session.status_record());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                session,
                status_tx,
                seq,
            },
        );
        debug!("注册会话: {}", id);
        (id, status_rx)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// 订阅单个会话的状态，会话注销后通道关闭
    pub fn subscribe(&self, id: &SessionId) -> Option<watch::Receiver<StatusRecord>> {
        self.sessions.get(id).map(|entry| entry.status_tx.subscribe())
    }

    /// 仅当会话仍在注册表中时才应用修改，产生的状态记录会同时推送给订阅者
    pub fn update<F>(&self, id: &SessionId, mutate: F) -> Option<StatusRecord>
    where
        F: FnOnce(&mut Session) -> Option<StatusRecord>,
    {
        let mut entry = self.sessions.get_mut(id)?;
        let record = mutate(&mut entry.session)?;
        entry.status_tx.send_replace(record.clone());
        drop(entry);

        // 没有订阅者时发送失败是正常情况
        let _ = self.events.send(OrchestratorEvent::Status(record.clone()));
        Some(record)
    }

    /// 幂等：重复移除同一个 ID 不会报错
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!("注销会话: {}", id);
        }
        removed
    }

    /// 按注册顺序返回
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<(u64, Session)> = self
            .sessions
            .iter()
            .map(|entry| (entry.seq, entry.session.clone()))
            .collect();
        sessions.sort_by_key(|(seq, _)| *seq);
        sessions.into_iter().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn events(&self) -> &broadcast::Sender<OrchestratorEvent> {
        &self.events
    }
}
