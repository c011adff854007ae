//! 远端文档存储边界
//!
//! 同步层只依赖三个原语：按键读、按键写（返回权威快照）、按键订阅推送。
//! 任何提供这三者的存储都能接入。
//!
//! `MemoryRemoteStore` 是进程内的参考实现，带故障注入，
//! 写入时使用与本地乐观写入相同的合并规则。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::RemoteError;
use crate::model::{Namespace, OwnerKey, Snapshot};
use crate::sync::apply::apply_locally;
use crate::sync::operation::Mutation;

/// 推送回调；`None` 表示远端该键不存在
pub type SnapshotSink = Arc<dyn Fn(Option<Snapshot>) + Send + Sync>;

/// 远端订阅句柄，`cancel` 或 drop 时关闭通道
pub struct RemoteSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemoteSubscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for RemoteSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSubscription").field("active", &self.cancel.is_some()).finish()
    }
}

/// 远端文档存储
#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// 读取快照
    async fn read(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<Snapshot>, RemoteError>;

    /// 应用一次变更，返回写入后的权威快照
    async fn write(
        &self,
        namespace: Namespace,
        owner: &OwnerKey,
        mutation: &Mutation,
    ) -> Result<Snapshot, RemoteError>;

    /// 打开推送通道
    async fn subscribe(
        &self,
        namespace: Namespace,
        owner: &OwnerKey,
        sink: SnapshotSink,
    ) -> Result<RemoteSubscription, RemoteError>;
}

type DocKey = (Namespace, OwnerKey);

struct FailureRule {
    matcher: Box<dyn Fn(&Mutation) -> bool + Send + Sync>,
    error: RemoteError,
    /// 剩余生效次数；None 表示一直生效
    remaining: Option<u32>,
}

#[derive(Default)]
struct MemoryInner {
    docs: Mutex<HashMap<DocKey, Snapshot>>,
    subscribers: Mutex<HashMap<DocKey, Vec<(u64, SnapshotSink)>>>,
    failures: Mutex<Vec<FailureRule>>,
    unavailable: Mutex<bool>,
    latency: Mutex<Option<Duration>>,
    write_log: Mutex<Vec<(OwnerKey, Mutation)>>,
    next_subscriber_id: AtomicU64,
}

/// 进程内远端存储
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<MemoryInner>,
}

impl fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("docs", &self.inner.docs.lock().len())
            .field("writes", &self.inner.write_log.lock().len())
            .finish()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟后端整体不可达
    pub fn set_available(&self, available: bool) {
        *self.inner.unavailable.lock() = !available;
    }

    /// 每次调用前等待的延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// 接下来 `count` 次写入失败
    pub fn fail_next_writes(&self, count: u32, error: RemoteError) {
        self.inner.failures.lock().push(FailureRule {
            matcher: Box::new(|_| true),
            error,
            remaining: Some(count),
        });
    }

    /// 匹配的写入一直失败，直到 `clear_failures`
    pub fn fail_writes_matching<F>(&self, matcher: F, error: RemoteError)
    where
        F: Fn(&Mutation) -> bool + Send + Sync + 'static,
    {
        self.inner.failures.lock().push(FailureRule {
            matcher: Box::new(matcher),
            error,
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    /// 当前存储的快照
    pub fn snapshot(&self, namespace: Namespace, owner: &OwnerKey) -> Option<Snapshot> {
        self.inner.docs.lock().get(&(namespace, owner.clone())).cloned()
    }

    /// 直接覆盖远端数据（模拟其他设备写入），并推送给订阅者
    pub fn put(&self, owner: &OwnerKey, snapshot: Snapshot) {
        let key = (snapshot.namespace(), owner.clone());
        self.inner.docs.lock().insert(key.clone(), snapshot.clone());
        self.notify(&key, Some(snapshot));
    }

    /// 已成功应用的写入记录（按时间顺序）
    pub fn write_log(&self) -> Vec<(OwnerKey, Mutation)> {
        self.inner.write_log.lock().clone()
    }

    pub fn subscriber_count(&self, namespace: Namespace, owner: &OwnerKey) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(&(namespace, owner.clone()))
            .map_or(0, Vec::len)
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if *self.inner.unavailable.lock() {
            return Err(RemoteError::Unavailable("memory remote marked unavailable".to_string()));
        }
        Ok(())
    }

    fn injected_failure(&self, mutation: &Mutation) -> Option<RemoteError> {
        let mut failures = self.inner.failures.lock();
        let index = failures.iter().position(|rule| (rule.matcher)(mutation))?;
        let error = failures[index].error.clone();
        if let Some(remaining) = failures[index].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                failures.remove(index);
            }
        }
        Some(error)
    }

    fn notify(&self, key: &DocKey, snapshot: Option<Snapshot>) {
        // 拷贝出回调再调用，回调内可以再次访问存储
        let sinks: Vec<SnapshotSink> = self
            .inner
            .subscribers
            .lock()
            .get(key)
            .map(|list| list.iter().map(|(_, sink)| sink.clone()).collect())
            .unwrap_or_default();
        for sink in sinks {
            sink(snapshot.clone());
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn read(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<Snapshot>, RemoteError> {
        self.simulate_network().await?;
        Ok(self.snapshot(namespace, owner))
    }

    async fn write(
        &self,
        namespace: Namespace,
        owner: &OwnerKey,
        mutation: &Mutation,
    ) -> Result<Snapshot, RemoteError> {
        self.simulate_network().await?;
        if mutation.namespace() != namespace {
            return Err(RemoteError::Rejected(format!(
                "{} does not apply to {}",
                mutation.kind(),
                namespace
            )));
        }
        if let Some(error) = self.injected_failure(mutation) {
            debug!("注入的远端写入失败: {} -> {}", mutation.kind(), error);
            return Err(error);
        }

        let key = (namespace, owner.clone());
        let next = {
            let mut docs = self.inner.docs.lock();
            let current = docs.get(&key).cloned();
            let next = apply_locally(mutation, current)
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            docs.insert(key.clone(), next.clone());
            next
        };
        self.inner.write_log.lock().push((owner.clone(), mutation.clone()));
        self.notify(&key, Some(next.clone()));
        Ok(next)
    }

    async fn subscribe(
        &self,
        namespace: Namespace,
        owner: &OwnerKey,
        sink: SnapshotSink,
    ) -> Result<RemoteSubscription, RemoteError> {
        self.simulate_network().await?;
        let key = (namespace, owner.clone());
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, sink.clone()));

        // 与常见文档数据库一致：订阅后立即推送一次当前值
        sink(self.snapshot(namespace, owner));

        let inner = Arc::downgrade(&self.inner);
        Ok(RemoteSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut subscribers = inner.subscribers.lock();
                if let Some(list) = subscribers.get_mut(&key) {
                    list.retain(|(sid, _)| *sid != id);
                    if list.is_empty() {
                        subscribers.remove(&key);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewCartItem;

    fn owner() -> OwnerKey {
        OwnerKey::from_email("remote@example.com").unwrap()
    }

    fn add(id: &str) -> Mutation {
        Mutation::AddCartItem { item: NewCartItem::new(id, id, 100), added_at: 0 }
    }

    #[tokio::test]
    async fn write_applies_merge_rule_and_records() {
        let remote = MemoryRemoteStore::new();
        remote.write(Namespace::Cart, &owner(), &add("a")).await.unwrap();
        let snapshot = remote.write(Namespace::Cart, &owner(), &add("a")).await.unwrap();
        assert_eq!(snapshot.as_cart().unwrap().get("a").unwrap().quantity, 2);
        assert_eq!(remote.write_log().len(), 2);
    }

    #[tokio::test]
    async fn failure_injection() {
        let remote = MemoryRemoteStore::new();
        remote.fail_next_writes(1, RemoteError::Timeout(10));
        assert!(remote.write(Namespace::Cart, &owner(), &add("a")).await.is_err());
        assert!(remote.write(Namespace::Cart, &owner(), &add("a")).await.is_ok());

        remote.fail_writes_matching(
            |m| matches!(m, Mutation::ClearCart),
            RemoteError::Backend { code: 503, message: "down".into() },
        );
        assert!(remote.write(Namespace::Cart, &owner(), &Mutation::ClearCart).await.is_err());
        assert!(remote.write(Namespace::Cart, &owner(), &add("b")).await.is_ok());
        remote.clear_failures();
        assert!(remote.write(Namespace::Cart, &owner(), &Mutation::ClearCart).await.is_ok());

        remote.set_available(false);
        assert!(matches!(
            remote.read(Namespace::Cart, &owner()).await,
            Err(RemoteError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn wrong_namespace_is_rejected() {
        let remote = MemoryRemoteStore::new();
        let result = remote.write(Namespace::Orders, &owner(), &Mutation::ClearCart).await;
        assert!(matches!(result, Err(RemoteError::Rejected(_))));
    }

    #[tokio::test]
    async fn subscribe_pushes_current_value_then_updates() {
        let remote = MemoryRemoteStore::new();
        let seen: Arc<Mutex<Vec<Option<Snapshot>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let subscription = remote
            .subscribe(
                Namespace::Cart,
                &owner(),
                Arc::new(move |snapshot| sink_seen.lock().push(snapshot)),
            )
            .await
            .unwrap();
        assert_eq!(remote.subscriber_count(Namespace::Cart, &owner()), 1);

        remote.write(Namespace::Cart, &owner(), &add("a")).await.unwrap();
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert!(seen[0].is_none());
            assert!(seen[1].is_some());
        }

        subscription.cancel();
        assert_eq!(remote.subscriber_count(Namespace::Cart, &owner()), 0);
        remote.write(Namespace::Cart, &owner(), &add("b")).await.unwrap();
        assert_eq!(seen.lock().len(), 2);
    }
}
