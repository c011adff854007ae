//! 事件系统模块 - 同步层诊断事件
//!
//! 功能包括：
//! - 连通性变化事件
//! - 入队 / 重放 / 排空中断事件
//! - 全部同步完成事件
//! - 远端推送快照落地事件
//! - 事件广播和监听回调

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::model::{now_millis, Namespace, OwnerKey};
use crate::sync::operation::OperationKind;

/// 同步层事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 连通性变化
    ConnectivityChanged { online: bool, timestamp: i64 },
    /// 变更已乐观写入本地并入队
    OperationQueued {
        op_id: u64,
        owner_key: OwnerKey,
        kind: OperationKind,
        timestamp: i64,
    },
    /// 队列中的变更已成功重放
    OperationReplayed {
        op_id: u64,
        owner_key: OwnerKey,
        kind: OperationKind,
        timestamp: i64,
    },
    /// 排空在某条操作处中断
    DrainHalted {
        op_id: u64,
        error: String,
        /// 连续中断次数
        attempt: u32,
        /// 下次自动重试的延迟；None 表示等待下一次上线
        next_retry_ms: Option<u64>,
        timestamp: i64,
    },
    /// 队列已清空，完全同步
    Synced { timestamp: i64 },
    /// 远端推送快照已写入缓存
    SnapshotApplied {
        namespace: Namespace,
        owner_key: OwnerKey,
        /// 在推送快照上重新叠加的待重放操作数
        rebased_ops: usize,
        timestamp: i64,
    },
    /// 本地持久化失败（调用方会收到失败）
    LocalWriteFailed {
        owner_key: OwnerKey,
        kind: OperationKind,
        error: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::OperationQueued { .. } => "operation_queued",
            SyncEvent::OperationReplayed { .. } => "operation_replayed",
            SyncEvent::DrainHalted { .. } => "drain_halted",
            SyncEvent::Synced { .. } => "synced",
            SyncEvent::SnapshotApplied { .. } => "snapshot_applied",
            SyncEvent::LocalWriteFailed { .. } => "local_write_failed",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::OperationQueued { timestamp, .. }
            | SyncEvent::OperationReplayed { timestamp, .. }
            | SyncEvent::DrainHalted { timestamp, .. }
            | SyncEvent::Synced { timestamp }
            | SyncEvent::SnapshotApplied { timestamp, .. }
            | SyncEvent::LocalWriteFailed { timestamp, .. } => *timestamp,
        }
    }

    /// 事件相关的 owner
    pub fn owner_key(&self) -> Option<&OwnerKey> {
        match self {
            SyncEvent::OperationQueued { owner_key, .. }
            | SyncEvent::OperationReplayed { owner_key, .. }
            | SyncEvent::SnapshotApplied { owner_key, .. }
            | SyncEvent::LocalWriteFailed { owner_key, .. } => Some(owner_key),
            _ => None,
        }
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SyncEvent>,
    /// 事件监听器映射，`*` 为通配
    listeners: Arc<RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read();
        for key in [event.event_type(), "*"] {
            if let Some(list) = listeners.get(key) {
                for listener in list {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器，`event_type` 为 `*` 时监听全部事件
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));
        self.stats.write().listener_count = listeners.values().map(Vec::len).sum();
        info!("Added listener for event type: {}", event_type);
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn connectivity_changed(online: bool) -> SyncEvent {
        SyncEvent::ConnectivityChanged { online, timestamp: now_millis() }
    }

    pub fn operation_queued(op_id: u64, owner_key: OwnerKey, kind: OperationKind) -> SyncEvent {
        SyncEvent::OperationQueued { op_id, owner_key, kind, timestamp: now_millis() }
    }

    pub fn operation_replayed(op_id: u64, owner_key: OwnerKey, kind: OperationKind) -> SyncEvent {
        SyncEvent::OperationReplayed { op_id, owner_key, kind, timestamp: now_millis() }
    }

    pub fn drain_halted(op_id: u64, error: String, attempt: u32, next_retry_ms: Option<u64>) -> SyncEvent {
        SyncEvent::DrainHalted { op_id, error, attempt, next_retry_ms, timestamp: now_millis() }
    }

    pub fn synced() -> SyncEvent {
        SyncEvent::Synced { timestamp: now_millis() }
    }

    pub fn snapshot_applied(namespace: Namespace, owner_key: OwnerKey, rebased_ops: usize) -> SyncEvent {
        SyncEvent::SnapshotApplied { namespace, owner_key, rebased_ops, timestamp: now_millis() }
    }

    pub fn local_write_failed(owner_key: OwnerKey, kind: OperationKind, error: String) -> SyncEvent {
        SyncEvent::LocalWriteFailed { owner_key, kind, error, timestamp: now_millis() }
    }
}
