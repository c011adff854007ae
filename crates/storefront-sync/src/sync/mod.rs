/// 同步模块
///
/// 职责：
/// - 变更的远端尝试 / 乐观写入 + 入队
/// - 上线后按 FIFO 排空操作日志
/// - 远端推送的多路复用与缓存落地
/// - 统一的本地合并规则与重试策略

pub mod operation;
pub mod apply;
pub mod retry_policy;
pub mod subscription;
pub mod coordinator;

pub use operation::{Mutation, OperationKind, QueuedOperation};
pub use apply::{apply_locally, rebase};
pub use retry_policy::{ReplayFailureReason, RetryPolicy};
pub use subscription::{SnapshotObserver, SnapshotRacePolicy, Subscription, SubscriptionMultiplexer};
pub use coordinator::{CoordinatorOptions, DrainHalt, DrainReport, MutationOutcome, PlaceOrderOutcome, SyncCoordinator};

use crate::error::Result;
use crate::model::{Namespace, OwnerKey, Snapshot};
use crate::storage::{LocalCache, OperationLog};

/// 同步状态（诊断用，UI 正确性不依赖它）
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncStatus {
    /// 队列为空
    Synced,
    /// 有待重放操作
    Pending {
        count: usize,
    },
    /// 正在排空
    Draining {
        remaining: usize,
    },
}

/// 把远端权威快照写入缓存
///
/// `rebase_pending` 为 true 时先叠加该键仍在队列中的操作（跳过 `skip_op`）。
/// 远端不存在时以命名空间空值为基线；`user` 无空值，保留现有缓存条目不动，
/// 缓存条目只由登出或清空缓存删除。返回当前缓存中的快照和叠加的操作数。
pub(crate) fn store_authoritative(
    cache: &LocalCache,
    oplog: &OperationLog,
    namespace: Namespace,
    owner: &OwnerKey,
    authoritative: Option<Snapshot>,
    rebase_pending: bool,
    skip_op: Option<u64>,
) -> Result<(Option<Snapshot>, usize)> {
    let base = authoritative.or_else(|| Snapshot::empty(namespace));
    let (value, rebased) = if rebase_pending {
        let pending: Vec<QueuedOperation> = oplog
            .pending_for(owner)?
            .into_iter()
            .filter(|op| op.namespace() == namespace && Some(op.id) != skip_op)
            .collect();
        (rebase(namespace, base, &pending)?, pending.len())
    } else {
        (base, 0)
    };

    match value {
        Some(snapshot) => {
            cache.write(namespace, owner, snapshot.clone())?;
            Ok((Some(snapshot), rebased))
        }
        None => {
            let kept = cache.read(namespace, owner)?.map(|entry| entry.value);
            Ok((kept, rebased))
        }
    }
}
