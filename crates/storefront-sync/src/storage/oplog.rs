//! 操作日志 - 持久化 FIFO 队列
//!
//! 键格式：`oplog:` + 8 字节大端 id，键序即入队顺序，重启后顺序不变。
//! 队列只追加、只按 id 删除，从不重排或去重。

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{now_millis, OwnerKey};
use crate::storage::kv::{KvStore, Table};
use crate::sync::operation::{Mutation, QueuedOperation};

const PREFIX: &[u8] = b"oplog:";

#[derive(Debug)]
pub struct OperationLog {
    kv: Arc<KvStore>,
}

impl OperationLog {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(PREFIX.len() + 8);
        key.extend_from_slice(PREFIX);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// 追加一条操作
    ///
    /// 介质写入失败（包括配额耗尽）直接返回错误，绝不静默丢弃。
    pub fn enqueue(&self, owner: &OwnerKey, payload: Mutation) -> Result<QueuedOperation> {
        let id = self.kv.next_id()?;
        let op = QueuedOperation {
            id,
            owner_key: owner.clone(),
            kind: payload.kind(),
            payload,
            enqueued_at: now_millis(),
            attempts: 0,
        };
        self.kv.set(Table::OpLog, Self::key(id), &op)?;
        debug!("操作已入队: #{} {} owner={}", op.id, op.kind, owner);
        Ok(op)
    }

    /// 按入队顺序返回全部操作
    pub fn peek_all(&self) -> Result<Vec<QueuedOperation>> {
        let items = self.kv.scan_prefix::<QueuedOperation>(Table::OpLog, PREFIX)?;
        Ok(items.into_iter().map(|(_, op)| op).collect())
    }

    /// 某个 owner 的待重放操作（保持顺序）
    pub fn pending_for(&self, owner: &OwnerKey) -> Result<Vec<QueuedOperation>> {
        Ok(self
            .peek_all()?
            .into_iter()
            .filter(|op| &op.owner_key == owner)
            .collect())
    }

    pub fn has_pending_for(&self, owner: &OwnerKey) -> Result<bool> {
        Ok(self.peek_all()?.iter().any(|op| &op.owner_key == owner))
    }

    /// 移除一条操作；id 不存在时什么也不做
    pub fn dequeue(&self, id: u64) -> Result<()> {
        if self.kv.delete(Table::OpLog, Self::key(id))? {
            debug!("操作已出队: #{}", id);
        }
        Ok(())
    }

    /// 记录一次重放失败
    pub fn record_failure(&self, id: u64) -> Result<()> {
        let key = Self::key(id);
        match self.kv.get::<_, QueuedOperation>(Table::OpLog, &key)? {
            Some(mut op) => {
                op.attempts = op.attempts.saturating_add(1);
                self.kv.set(Table::OpLog, &key, &op)
            }
            None => {
                warn!("记录失败次数时操作已不在队列中: #{}", id);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.kv.len(Table::OpLog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::model::NewCartItem;
    use crate::sync::operation::OperationKind;
    use tempfile::TempDir;

    fn owner() -> OwnerKey {
        OwnerKey::from_email("queue@example.com").unwrap()
    }

    fn add(id: &str) -> Mutation {
        Mutation::AddCartItem { item: NewCartItem::new(id, id, 100), added_at: 0 }
    }

    #[test]
    fn dequeue_is_idempotent() {
        let log = OperationLog::new(Arc::new(KvStore::memory()));
        let op = log.enqueue(&owner(), add("a")).unwrap();
        log.enqueue(&owner(), add("b")).unwrap();

        log.dequeue(op.id).unwrap();
        let after_first = log.peek_all().unwrap();
        log.dequeue(op.id).unwrap();
        let after_second = log.peek_all().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 1);
        assert!(log.dequeue(987_654).is_ok());
    }

    #[test]
    fn peek_all_preserves_enqueue_order() {
        let log = OperationLog::new(Arc::new(KvStore::memory()));
        let o = owner();
        log.enqueue(&o, add("a")).unwrap();
        log.enqueue(&o, Mutation::UpdateCartItemQty { item_id: "a".into(), quantity: 3 }).unwrap();
        log.enqueue(&o, Mutation::RemoveCartItem { item_id: "a".into() }).unwrap();
        let kinds: Vec<_> = log.peek_all().unwrap().into_iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::AddCartItem, OperationKind::UpdateCartItemQty, OperationKind::RemoveCartItem]
        );
    }

    #[test]
    fn id_keys_sort_numerically() {
        // 大端编码保证 255 < 256 的键序
        assert!(OperationLog::key(255) < OperationLog::key(256));
        assert!(OperationLog::key(1) < OperationLog::key(u64::MAX));
    }

    #[tokio::test]
    async fn fifo_order_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let o = owner();
        let ids: Vec<u64> = {
            let log = OperationLog::new(Arc::new(KvStore::open(temp_dir.path()).await.unwrap()));
            (0..5)
                .map(|i| log.enqueue(&o, add(&format!("item-{}", i))).unwrap().id)
                .collect()
        };
        let log = OperationLog::new(Arc::new(KvStore::open(temp_dir.path()).await.unwrap()));
        let restored: Vec<u64> = log.peek_all().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(restored, ids);

        // 重启后新入队的操作排在最后
        let next = log.enqueue(&o, Mutation::ClearCart).unwrap();
        assert_eq!(log.peek_all().unwrap().last().unwrap().id, next.id);
    }

    #[test]
    fn enqueue_fails_loudly_when_medium_is_full() {
        let log = OperationLog::new(Arc::new(KvStore::memory_with_quota(1)));
        log.enqueue(&owner(), add("a")).unwrap();
        let err = log.enqueue(&owner(), add("b")).unwrap_err();
        assert!(matches!(err, SyncError::StorageFull(_)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn pending_for_filters_by_owner_and_records_failures() {
        let log = OperationLog::new(Arc::new(KvStore::memory()));
        let alice = owner();
        let bob = OwnerKey::from_email("bob@example.com").unwrap();
        let a = log.enqueue(&alice, add("a")).unwrap();
        log.enqueue(&bob, add("b")).unwrap();

        assert_eq!(log.pending_for(&alice).unwrap().len(), 1);
        assert!(log.has_pending_for(&bob).unwrap());

        log.record_failure(a.id).unwrap();
        log.record_failure(a.id).unwrap();
        assert_eq!(log.pending_for(&alice).unwrap()[0].attempts, 2);
        assert!(!log.is_empty());
    }
}
