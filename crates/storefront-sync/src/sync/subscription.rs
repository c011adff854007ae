//! 订阅多路复用器
//!
//! 每个 (命名空间, owner) 最多一个远端推送通道，推送的快照先写入缓存，
//! 再分发给该键的全部观察者。离线时订阅只投递一次缓存快照，不打开通道；
//! 上线后 `go_online` 为所有仍有观察者的键打开通道。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::RemoteError;
use crate::events::{event_builders, EventManager};
use crate::model::{Namespace, OwnerKey, Snapshot};
use crate::network::ConnectivityMonitor;
use crate::remote::{RemoteStore, RemoteSubscription, SnapshotSink};
use crate::storage::{LocalCache, OperationLog};
use crate::sync::store_authoritative;

/// 观察者回调；`user` 命名空间无数据时收到 None
pub type SnapshotObserver = Arc<dyn Fn(Option<&Snapshot>) + Send + Sync>;

/// 推送快照与本地待重放操作并存时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRacePolicy {
    /// 在推送快照上重新叠加该键的待重放操作后再缓存、分发（不再原样转发）
    #[default]
    RebasePending,
    /// 推送快照原样覆盖缓存（可能暂时丢失未重放的本地修改）
    Overwrite,
}

type TopicKey = (Namespace, OwnerKey);

#[derive(Default)]
struct Topic {
    observers: Vec<(u64, SnapshotObserver)>,
    channel: Option<RemoteSubscription>,
    opening: bool,
    /// 每次离线递增，晚到的通道按过期处理
    generation: u64,
}

struct MuxInner {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    oplog: Arc<OperationLog>,
    connectivity: ConnectivityMonitor,
    events: Arc<EventManager>,
    policy: SnapshotRacePolicy,
    remote_timeout: Duration,
    topics: Mutex<HashMap<TopicKey, Topic>>,
    /// 正在重放、远端已接收但尚未出队的操作
    in_flight: Mutex<Option<u64>>,
    next_observer_id: AtomicU64,
}

/// 订阅多路复用器，克隆后共享同一组通道
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("policy", &self.inner.policy)
            .field("topics", &self.inner.topics.lock().len())
            .field("open_channels", &self.open_channel_count())
            .finish()
    }
}

impl SubscriptionMultiplexer {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<LocalCache>,
        oplog: Arc<OperationLog>,
        connectivity: ConnectivityMonitor,
        events: Arc<EventManager>,
        policy: SnapshotRacePolicy,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                remote,
                cache,
                oplog,
                connectivity,
                events,
                policy,
                remote_timeout,
                topics: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(None),
                next_observer_id: AtomicU64::new(1),
            }),
        }
    }

    /// 注册观察者
    ///
    /// 返回的 `Subscription` 在 `unsubscribe` 或 drop 时注销，
    /// 最后一个观察者离开时关闭远端通道。
    pub async fn subscribe<F>(&self, namespace: Namespace, owner: &OwnerKey, observer: F) -> Subscription
    where
        F: Fn(Option<&Snapshot>) + Send + Sync + 'static,
    {
        let observer: SnapshotObserver = Arc::new(observer);
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let key = (namespace, owner.clone());
        let online = self.inner.connectivity.is_online();

        let open_generation = {
            let mut topics = self.inner.topics.lock();
            let topic = topics.entry(key.clone()).or_default();
            topic.observers.push((id, observer.clone()));
            if online && topic.channel.is_none() && !topic.opening {
                topic.opening = true;
                Some(topic.generation)
            } else {
                None
            }
        };

        match open_generation {
            Some(generation) => self.inner.open_channel(key.clone(), generation).await,
            // 离线，或通道已由其他观察者打开：先补发当前缓存
            None => self.inner.deliver_cached(&key, &[observer]),
        }

        debug!("观察者已注册: {}/{} #{}", namespace, owner, id);
        Subscription {
            inner: Arc::downgrade(&self.inner),
            key,
            id,
            active: true,
        }
    }

    /// 为所有仍有观察者的键打开推送通道
    pub async fn go_online(&self) {
        let pending: Vec<(TopicKey, u64)> = {
            let mut topics = self.inner.topics.lock();
            topics
                .iter_mut()
                .filter(|(_, topic)| !topic.observers.is_empty() && topic.channel.is_none() && !topic.opening)
                .map(|(key, topic)| {
                    topic.opening = true;
                    (key.clone(), topic.generation)
                })
                .collect()
        };
        if !pending.is_empty() {
            info!("上线，打开 {} 个推送通道", pending.len());
        }
        for (key, generation) in pending {
            self.inner.open_channel(key, generation).await;
        }
    }

    /// 关闭全部推送通道，观察者保留
    pub fn go_offline(&self) {
        let closed: Vec<RemoteSubscription> = {
            let mut topics = self.inner.topics.lock();
            topics
                .values_mut()
                .filter_map(|topic| {
                    topic.generation += 1;
                    topic.opening = false;
                    topic.channel.take()
                })
                .collect()
        };
        if !closed.is_empty() {
            info!("离线，关闭 {} 个推送通道", closed.len());
        }
        drop(closed);
    }

    /// 把协调器写入缓存的新快照分发给观察者
    pub fn publish_local(&self, namespace: Namespace, owner: &OwnerKey, snapshot: Option<&Snapshot>) {
        self.inner.fan_out(&(namespace, owner.clone()), snapshot);
    }

    /// 标记正在重放的操作，推送变基时跳过它
    pub(crate) fn set_in_flight(&self, op_id: Option<u64>) {
        *self.inner.in_flight.lock() = op_id;
    }

    /// 注销全部观察者并关闭通道
    pub fn shutdown(&self) {
        let topics: Vec<Topic> = self.inner.topics.lock().drain().map(|(_, topic)| topic).collect();
        debug!("多路复用器关闭，释放 {} 个键", topics.len());
        drop(topics);
    }

    pub fn observer_count(&self, namespace: Namespace, owner: &OwnerKey) -> usize {
        self.inner
            .topics
            .lock()
            .get(&(namespace, owner.clone()))
            .map_or(0, |topic| topic.observers.len())
    }

    /// 该键的推送通道是否已打开
    pub fn has_open_channel(&self, namespace: Namespace, owner: &OwnerKey) -> bool {
        self.inner
            .topics
            .lock()
            .get(&(namespace, owner.clone()))
            .is_some_and(|topic| topic.channel.is_some())
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner
            .topics
            .lock()
            .values()
            .filter(|topic| topic.channel.is_some())
            .count()
    }
}

impl MuxInner {
    async fn open_channel(self: &Arc<Self>, key: TopicKey, generation: u64) {
        let weak = Arc::downgrade(self);
        let sink_key = key.clone();
        let sink: SnapshotSink = Arc::new(move |snapshot| {
            if let Some(inner) = weak.upgrade() {
                inner.on_remote_snapshot(&sink_key, snapshot);
            }
        });

        let (namespace, owner) = (key.0, &key.1);
        let result = match tokio::time::timeout(self.remote_timeout, self.remote.subscribe(namespace, owner, sink)).await
        {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.remote_timeout.as_millis() as u64)),
        };

        match result {
            Ok(channel) => {
                let stale = {
                    let mut topics = self.topics.lock();
                    match topics.get_mut(&key) {
                        Some(topic) if topic.generation == generation && !topic.observers.is_empty() => {
                            topic.opening = false;
                            topic.channel.replace(channel)
                        }
                        _ => Some(channel),
                    }
                };
                if stale.is_some() {
                    debug!("推送通道已过期，立即关闭: {}/{}", namespace, owner);
                } else {
                    info!("推送通道已打开: {}/{}", namespace, owner);
                }
                drop(stale);
            }
            Err(e) => {
                warn!("打开推送通道失败，改用缓存快照: {}/{}: {}", namespace, owner, e);
                let observers: Vec<SnapshotObserver> = {
                    let mut topics = self.topics.lock();
                    match topics.get_mut(&key) {
                        Some(topic) if topic.generation == generation => {
                            topic.opening = false;
                            topic.observers.iter().map(|(_, o)| o.clone()).collect()
                        }
                        _ => Vec::new(),
                    }
                };
                self.deliver_cached(&key, &observers);
            }
        }
    }

    fn on_remote_snapshot(&self, key: &TopicKey, snapshot: Option<Snapshot>) {
        if !self.topics.lock().contains_key(key) {
            return;
        }
        let (namespace, owner) = (key.0, &key.1);
        let rebase_pending = self.policy == SnapshotRacePolicy::RebasePending;
        let skip = *self.in_flight.lock();

        let value = match store_authoritative(&self.cache, &self.oplog, namespace, owner, snapshot.clone(), rebase_pending, skip)
        {
            Ok((value, rebased_ops)) => {
                if rebased_ops > 0 {
                    info!("推送快照与 {} 条待重放操作并存，已重新叠加: {}/{}", rebased_ops, namespace, owner);
                }
                self.events
                    .emit(event_builders::snapshot_applied(namespace, owner.clone(), rebased_ops));
                value
            }
            Err(e) => {
                error!("推送快照写入缓存失败: {}/{}: {}", namespace, owner, e);
                snapshot.or_else(|| Snapshot::empty(namespace))
            }
        };
        self.fan_out(key, value.as_ref());
    }

    fn deliver_cached(&self, key: &TopicKey, observers: &[SnapshotObserver]) {
        if observers.is_empty() {
            return;
        }
        match self.cache.read_or_empty(key.0, &key.1) {
            Ok(snapshot) => {
                for observer in observers {
                    observer(snapshot.as_ref());
                }
            }
            Err(e) => error!("读取缓存快照失败: {}/{}: {}", key.0, key.1, e),
        }
    }

    fn fan_out(&self, key: &TopicKey, snapshot: Option<&Snapshot>) {
        // 先拷贝再回调，观察者里可以注销自己
        let observers: Vec<SnapshotObserver> = self
            .topics
            .lock()
            .get(key)
            .map(|topic| topic.observers.iter().map(|(_, o)| o.clone()).collect())
            .unwrap_or_default();
        for observer in observers {
            observer(snapshot);
        }
    }

    fn unsubscribe(&self, key: &TopicKey, id: u64) -> bool {
        let (removed, channel) = {
            let mut topics = self.topics.lock();
            let Some(topic) = topics.get_mut(key) else {
                return false;
            };
            let before = topic.observers.len();
            topic.observers.retain(|(oid, _)| *oid != id);
            let removed = topic.observers.len() != before;
            let channel = if topic.observers.is_empty() {
                topics.remove(key).and_then(|topic| topic.channel)
            } else {
                None
            };
            (removed, channel)
        };
        if channel.is_some() {
            debug!("最后一个观察者离开，关闭推送通道: {}/{}", key.0, key.1);
        }
        drop(channel);
        removed
    }
}

/// 观察者句柄
pub struct Subscription {
    inner: Weak<MuxInner>,
    key: TopicKey,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn namespace(&self) -> Namespace {
        self.key.0
    }

    pub fn owner_key(&self) -> &OwnerKey {
        &self.key.1
    }

    /// 注销该观察者，不影响同一键上的其他观察者
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("namespace", &self.key.0)
            .field("owner_key", &self.key.1)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cart, NewCartItem, UserProfile};
    use crate::remote::MemoryRemoteStore;
    use crate::storage::KvStore;
    use crate::sync::operation::Mutation;

    type Seen = Arc<Mutex<Vec<Option<Snapshot>>>>;

    struct Harness {
        mux: SubscriptionMultiplexer,
        remote: MemoryRemoteStore,
        cache: Arc<LocalCache>,
        oplog: Arc<OperationLog>,
        connectivity: ConnectivityMonitor,
    }

    fn harness(online: bool, policy: SnapshotRacePolicy) -> Harness {
        let kv = Arc::new(KvStore::memory());
        let cache = Arc::new(LocalCache::new(kv.clone()));
        let oplog = Arc::new(OperationLog::new(kv));
        let remote = MemoryRemoteStore::new();
        let connectivity = ConnectivityMonitor::new(online);
        let mux = SubscriptionMultiplexer::new(
            Arc::new(remote.clone()),
            cache.clone(),
            oplog.clone(),
            connectivity.clone(),
            Arc::new(EventManager::new(16)),
            policy,
            Duration::from_secs(1),
        );
        Harness { mux, remote, cache, oplog, connectivity }
    }

    fn owner() -> OwnerKey {
        OwnerKey::from_email("mux@example.com").unwrap()
    }

    fn recorder() -> (Seen, impl Fn(Option<&Snapshot>) + Send + Sync + 'static) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |snapshot: Option<&Snapshot>| sink.lock().push(snapshot.cloned()))
    }

    fn cart_with(id: &str) -> Snapshot {
        let mut cart = Cart::default();
        cart.add(&NewCartItem::new(id, id, 100), 0);
        Snapshot::Cart(cart)
    }

    #[tokio::test]
    async fn offline_subscribe_delivers_cache_once_without_channel() {
        let h = harness(false, SnapshotRacePolicy::RebasePending);
        h.cache.write(Namespace::Cart, &owner(), cart_with("a")).unwrap();

        let (seen, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::Cart, &owner(), observer).await;

        assert_eq!(seen.lock().clone(), vec![Some(cart_with("a"))]);
        assert_eq!(h.remote.subscriber_count(Namespace::Cart, &owner()), 0);
        assert_eq!(h.mux.open_channel_count(), 0);

        // 上线后打开通道，首个推送成为新基线
        h.connectivity.set_online(true);
        h.mux.go_online().await;
        assert_eq!(h.remote.subscriber_count(Namespace::Cart, &owner()), 1);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[1], Some(Snapshot::Cart(Cart::default())));
    }

    #[tokio::test]
    async fn pushes_are_cached_and_fanned_out() {
        let h = harness(true, SnapshotRacePolicy::RebasePending);
        let (first, observer_a) = recorder();
        let (second, observer_b) = recorder();
        let _a = h.mux.subscribe(Namespace::Cart, &owner(), observer_a).await;
        let _b = h.mux.subscribe(Namespace::Cart, &owner(), observer_b).await;
        assert_eq!(h.remote.subscriber_count(Namespace::Cart, &owner()), 1);

        h.remote.put(&owner(), cart_with("z"));
        assert_eq!(first.lock().last().cloned().flatten(), Some(cart_with("z")));
        assert_eq!(second.lock().last().cloned().flatten(), Some(cart_with("z")));
        assert_eq!(h.cache.read(Namespace::Cart, &owner()).unwrap().unwrap().value, cart_with("z"));
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_channel() {
        let h = harness(true, SnapshotRacePolicy::RebasePending);
        let (_, observer_a) = recorder();
        let (seen_b, observer_b) = recorder();
        let a = h.mux.subscribe(Namespace::Orders, &owner(), observer_a).await;
        let b = h.mux.subscribe(Namespace::Orders, &owner(), observer_b).await;

        a.unsubscribe();
        assert_eq!(h.mux.observer_count(Namespace::Orders, &owner()), 1);
        assert_eq!(h.remote.subscriber_count(Namespace::Orders, &owner()), 1);

        h.remote.put(&owner(), Snapshot::Orders(vec![]));
        let delivered = seen_b.lock().len();
        assert!(delivered >= 2);

        drop(b);
        assert_eq!(h.mux.observer_count(Namespace::Orders, &owner()), 0);
        assert_eq!(h.remote.subscriber_count(Namespace::Orders, &owner()), 0);
    }

    #[tokio::test]
    async fn go_offline_closes_channels_and_keeps_observers() {
        let h = harness(true, SnapshotRacePolicy::RebasePending);
        let (_, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::Cart, &owner(), observer).await;
        assert_eq!(h.mux.open_channel_count(), 1);

        h.mux.go_offline();
        assert_eq!(h.mux.open_channel_count(), 0);
        assert_eq!(h.remote.subscriber_count(Namespace::Cart, &owner()), 0);
        assert_eq!(h.mux.observer_count(Namespace::Cart, &owner()), 1);

        h.mux.go_online().await;
        assert_eq!(h.mux.open_channel_count(), 1);
    }

    #[tokio::test]
    async fn rebase_policy_keeps_queued_edits_on_push() {
        let h = harness(true, SnapshotRacePolicy::RebasePending);
        h.oplog
            .enqueue(&owner(), Mutation::AddCartItem { item: NewCartItem::new("local", "L", 1), added_at: 0 })
            .unwrap();
        let (seen, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::Cart, &owner(), observer).await;

        let last = seen.lock().last().cloned().flatten().unwrap();
        assert!(last.as_cart().unwrap().get("local").is_some());
        let cached = h.cache.read(Namespace::Cart, &owner()).unwrap().unwrap().value;
        assert!(cached.as_cart().unwrap().get("local").is_some());
    }

    #[tokio::test]
    async fn overwrite_policy_forwards_push_verbatim() {
        let h = harness(true, SnapshotRacePolicy::Overwrite);
        h.oplog
            .enqueue(&owner(), Mutation::AddCartItem { item: NewCartItem::new("local", "L", 1), added_at: 0 })
            .unwrap();
        let (seen, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::Cart, &owner(), observer).await;

        assert_eq!(seen.lock().last().cloned().flatten(), Some(Snapshot::Cart(Cart::default())));
    }

    #[tokio::test]
    async fn failed_open_falls_back_to_cache() {
        let h = harness(true, SnapshotRacePolicy::RebasePending);
        h.remote.set_available(false);
        h.cache.write(Namespace::Cart, &owner(), cart_with("cached")).unwrap();

        let (seen, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::Cart, &owner(), observer).await;
        assert_eq!(seen.lock().clone(), vec![Some(cart_with("cached"))]);
        assert_eq!(h.mux.open_channel_count(), 0);

        h.remote.set_available(true);
        h.mux.go_online().await;
        assert_eq!(h.mux.open_channel_count(), 1);
    }

    #[tokio::test]
    async fn missing_user_profile_is_delivered_as_none() {
        let h = harness(false, SnapshotRacePolicy::RebasePending);
        let (seen, observer) = recorder();
        let sub = h.mux.subscribe(Namespace::User, &owner(), observer).await;
        assert_eq!(seen.lock().clone(), vec![None]);
        assert_eq!(sub.namespace(), Namespace::User);
    }

    #[tokio::test]
    async fn empty_user_push_keeps_cached_profile() {
        let h = harness(true, SnapshotRacePolicy::Overwrite);
        let profile = Snapshot::User(UserProfile { display_name: "Kept".into(), ..Default::default() });
        h.cache.write(Namespace::User, &owner(), profile.clone()).unwrap();

        let (seen, observer) = recorder();
        let _sub = h.mux.subscribe(Namespace::User, &owner(), observer).await;

        assert_eq!(h.mux.open_channel_count(), 1);
        assert_eq!(seen.lock().clone(), vec![Some(profile.clone())]);
        assert_eq!(h.cache.read(Namespace::User, &owner()).unwrap().unwrap().value, profile);
    }
}
