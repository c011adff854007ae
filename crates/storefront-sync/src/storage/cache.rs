//! 本地缓存 - 每个 (命名空间, owner) 一条最新快照
//!
//! 键格式：`cache:{namespace}:{owner_key}`
//!
//! 所有操作同步完成，写入在返回前已落盘；从不访问网络。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::{now_millis, Namespace, OwnerKey, Snapshot};
use crate::storage::kv::{KvStore, Table};

const PREFIX: &str = "cache";

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub namespace: Namespace,
    pub owner_key: OwnerKey,
    pub value: Snapshot,
    /// 最后更新时间（UTC 毫秒），仅供参考，不参与冲突处理
    pub last_updated: i64,
}

#[derive(Debug)]
pub struct LocalCache {
    kv: Arc<KvStore>,
}

impl LocalCache {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn key(namespace: Namespace, owner: &OwnerKey) -> String {
        format!("{}:{}:{}", PREFIX, namespace.as_str(), owner.as_str())
    }

    /// 读取最近一次落盘的快照
    pub fn read(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<CacheEntry>> {
        self.kv.get(Table::Cache, Self::key(namespace, owner))
    }

    /// 读取快照，缺失时退回命名空间的空值
    pub fn read_or_empty(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<Snapshot>> {
        Ok(self
            .read(namespace, owner)?
            .map(|entry| entry.value)
            .or_else(|| Snapshot::empty(namespace)))
    }

    /// 覆盖写入
    pub fn write(&self, namespace: Namespace, owner: &OwnerKey, value: Snapshot) -> Result<CacheEntry> {
        if value.namespace() != namespace {
            return Err(SyncError::InvalidArgument(format!(
                "snapshot for {} written to {}",
                value.namespace(),
                namespace
            )));
        }
        let entry = CacheEntry {
            namespace,
            owner_key: owner.clone(),
            value,
            last_updated: now_millis(),
        };
        self.kv.set(Table::Cache, Self::key(namespace, owner), &entry)?;
        debug!("缓存已写入: {}/{}", namespace, owner);
        Ok(entry)
    }

    /// 读-改-写，`f` 收到当前快照（不存在时为 None）
    pub fn mutate<F>(&self, namespace: Namespace, owner: &OwnerKey, f: F) -> Result<CacheEntry>
    where
        F: FnOnce(Option<Snapshot>) -> Result<Snapshot>,
    {
        let current = self.read(namespace, owner)?.map(|entry| entry.value);
        let next = f(current)?;
        self.write(namespace, owner, next)
    }

    /// 删除单条
    pub fn clear(&self, namespace: Namespace, owner: &OwnerKey) -> Result<()> {
        self.kv.delete(Table::Cache, Self::key(namespace, owner))?;
        Ok(())
    }

    /// 删除某个 owner 的全部命名空间（登出）
    pub fn clear_owner(&self, owner: &OwnerKey) -> Result<()> {
        for namespace in Namespace::ALL {
            self.clear(namespace, owner)?;
        }
        debug!("已清理用户缓存: {}", owner);
        Ok(())
    }

    /// 清空全部缓存
    pub fn clear_all(&self) -> Result<usize> {
        self.kv.remove_prefix(Table::Cache, format!("{}:", PREFIX).as_bytes())
    }
}
