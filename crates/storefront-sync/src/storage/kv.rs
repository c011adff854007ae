//! KV 存储模块 - 缓存快照与操作日志的持久化介质
//!
//! 本模块提供：
//! - 基于 sled 的持久化实现（每次写入在返回前 flush）
//! - 内存实现（可设置条目配额，用于测试与临时会话）
//! - 按逻辑表隔离的命名空间
//! - 单调递增 ID 生成

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{Result, SyncError};
use crate::version::STORAGE_FORMAT_VERSION;

/// 逻辑表
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// 缓存快照
    Cache,
    /// 操作日志
    OpLog,
    /// 元数据（格式版本等）
    Meta,
}

impl Table {
    pub fn tree_name(self) -> &'static str {
        match self {
            Table::Cache => "cache",
            Table::OpLog => "oplog",
            Table::Meta => "meta",
        }
    }
}

const FORMAT_VERSION_KEY: &str = "format_version";

/// KV 存储 - 支持 sled 持久化与内存两种介质
#[derive(Debug)]
pub enum KvStore {
    Sled(SledKv),
    Memory(MemoryKv),
}

impl KvStore {
    /// 在 `base_path/kv` 下打开 sled 存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let kv = SledKv::open(base_path).await?;
        let store = KvStore::Sled(kv);
        store.check_format_version()?;
        Ok(store)
    }

    /// 不限容量的内存存储
    pub fn memory() -> Self {
        KvStore::Memory(MemoryKv::new(None))
    }

    /// 带条目配额的内存存储，超过配额的新增写入返回 `StorageFull`
    pub fn memory_with_quota(max_entries: usize) -> Self {
        KvStore::Memory(MemoryKv::new(Some(max_entries)))
    }

    /// 校验并写入持久化格式版本（防止旧版本 SDK 打开新格式数据）
    fn check_format_version(&self) -> Result<()> {
        let stored: Option<u32> = self.get(Table::Meta, FORMAT_VERSION_KEY)?;
        match stored {
            Some(version) if version > STORAGE_FORMAT_VERSION => Err(SyncError::Config(format!(
                "storage format v{} is newer than supported v{}",
                version, STORAGE_FORMAT_VERSION
            ))),
            Some(version) if version == STORAGE_FORMAT_VERSION => Ok(()),
            _ => self.set(Table::Meta, FORMAT_VERSION_KEY, &STORAGE_FORMAT_VERSION),
        }
    }

    /// 写入键值对，返回前已落盘
    pub fn set<K, V>(&self, table: Table, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SyncError::Serialization(format!("序列化值失败: {}", e)))?;
        match self {
            KvStore::Sled(kv) => kv.insert(table, key.as_ref(), bytes),
            KvStore::Memory(kv) => kv.insert(table, key.as_ref(), bytes),
        }
    }

    /// 读取键值对
    pub fn get<K, V>(&self, table: Table, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let raw = match self {
            KvStore::Sled(kv) => kv.get(table, key.as_ref())?,
            KvStore::Memory(kv) => kv.get(table, key.as_ref()),
        };
        match raw {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键，返回键此前是否存在
    pub fn delete<K>(&self, table: Table, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        match self {
            KvStore::Sled(kv) => kv.remove(table, key.as_ref()),
            KvStore::Memory(kv) => Ok(kv.remove(table, key.as_ref())),
        }
    }

    /// 按键序扫描指定前缀
    pub fn scan_prefix<V>(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let raw = match self {
            KvStore::Sled(kv) => kv.scan_prefix(table, prefix)?,
            KvStore::Memory(kv) => kv.scan_prefix(table, prefix),
        };
        raw.into_iter()
            .map(|(key, bytes)| {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok((key, value))
            })
            .collect()
    }

    /// 删除指定前缀下的所有键，返回删除条数
    pub fn remove_prefix(&self, table: Table, prefix: &[u8]) -> Result<usize> {
        let keys: Vec<Vec<u8>> = match self {
            KvStore::Sled(kv) => kv.scan_prefix(table, prefix)?.into_iter().map(|(k, _)| k).collect(),
            KvStore::Memory(kv) => kv.scan_prefix(table, prefix).into_iter().map(|(k, _)| k).collect(),
        };
        let mut removed = 0;
        for key in keys {
            if self.delete(table, &key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// 生成单调递增 ID（跨重启保持递增）
    pub fn next_id(&self) -> Result<u64> {
        match self {
            KvStore::Sled(kv) => kv.next_id(),
            KvStore::Memory(kv) => Ok(kv.next_id()),
        }
    }

    /// 表内条目数
    pub fn len(&self, table: Table) -> usize {
        match self {
            KvStore::Sled(kv) => kv.tree(table).len(),
            KvStore::Memory(kv) => kv.len(table),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, KvStore::Sled(_))
    }
}

/// sled 持久化实现
#[derive(Debug)]
pub struct SledKv {
    base_path: PathBuf,
    db: Db,
    cache: Tree,
    oplog: Tree,
    meta: Tree,
}

impl SledKv {
    async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| SyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 50;
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    db_opt = Some(db);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::debug!("sled 被占用，{}ms 后重试 (#{})", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            SyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let cache = db.open_tree(Table::Cache.tree_name())?;
        let oplog = db.open_tree(Table::OpLog.tree_name())?;
        let meta = db.open_tree(Table::Meta.tree_name())?;

        tracing::info!("KV 存储已打开: {}", kv_path.display());

        Ok(Self { base_path, db, cache, oplog, meta })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn tree(&self, table: Table) -> &Tree {
        match table {
            Table::Cache => &self.cache,
            Table::OpLog => &self.oplog,
            Table::Meta => &self.meta,
        }
    }

    fn insert(&self, table: Table, key: &[u8], value: Vec<u8>) -> Result<()> {
        let tree = self.tree(table);
        tree.insert(key, value)
            .map_err(|e| SyncError::KvStore(format!("写入失败: {}", e)))?;
        tree.flush()
            .map_err(|e| SyncError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(())
    }

    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .tree(table)
            .get(key)
            .map_err(|e| SyncError::KvStore(format!("读取失败: {}", e)))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn remove(&self, table: Table, key: &[u8]) -> Result<bool> {
        let tree = self.tree(table);
        let previous = tree
            .remove(key)
            .map_err(|e| SyncError::KvStore(format!("删除失败: {}", e)))?;
        tree.flush()
            .map_err(|e| SyncError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(previous.is_some())
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree(table)
            .scan_prefix(prefix)
            .map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| SyncError::KvStore(format!("扫描前缀失败: {}", e)))
            })
            .collect()
    }

    fn next_id(&self) -> Result<u64> {
        self.db
            .generate_id()
            .map_err(|e| SyncError::KvStore(format!("生成 ID 失败: {}", e)))
    }
}

/// 内存实现
#[derive(Debug)]
pub struct MemoryKv {
    tables: RwLock<BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
    next_id: AtomicU64,
    /// 全部表的条目总数上限
    max_entries: Option<usize>,
}

impl MemoryKv {
    fn new(max_entries: Option<usize>) -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            max_entries,
        }
    }

    fn insert(&self, table: Table, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(max) = self.max_entries {
            let total: usize = tables.values().map(BTreeMap::len).sum();
            let is_new = tables.get(&table).map_or(true, |t| !t.contains_key(key));
            if is_new && total >= max {
                return Err(SyncError::StorageFull(format!(
                    "memory quota of {} entries exhausted",
                    max
                )));
            }
        }
        tables.entry(table).or_default().insert(key.to_vec(), value);
        Ok(())
    }

    fn get(&self, table: Table, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.read().get(&table).and_then(|t| t.get(key).cloned())
    }

    fn remove(&self, table: Table, key: &[u8]) -> bool {
        self.tables
            .write()
            .get_mut(&table)
            .map_or(false, |t| t.remove(key).is_some())
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.tables
            .read()
            .get(&table)
            .map(|t| {
                t.range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }
}
