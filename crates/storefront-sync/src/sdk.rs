use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::events::{event_builders, EventManager};
use crate::model::{Cart, Namespace, NewCartItem, Order, OrderDraft, OwnerKey, Snapshot, UserProfile};
use crate::network::ConnectivityMonitor;
use crate::remote::RemoteStore;
use crate::storage::{KvStore, LocalCache, OperationLog};
use crate::sync::coordinator::CoordinatorOptions;
use crate::sync::{
    DrainReport, MutationOutcome, OperationKind, RetryPolicy, SnapshotRacePolicy, Subscription, SyncCoordinator,
    SyncStatus,
};

/// 存储介质
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageBackend {
    /// `{data_dir}/kv` 下的 sled 数据库
    Sled,
    /// 进程内存储，可选条目配额（测试、临时会话）
    Memory { quota: Option<usize> },
}

/// 同步层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 存储介质
    pub storage: StorageBackend,
    /// 排空重试策略
    pub retry: RetryPolicy,
    /// 单次远端调用超时（毫秒），超时按远端失败处理
    pub remote_timeout_ms: u64,
    /// 事件广播缓冲大小
    pub event_buffer_size: usize,
    /// 推送快照与待重放操作并存时的处理方式
    ///
    /// 默认 `RebasePending`：推送快照不再原样转发，而是先叠加该键仍在队列中的操作，
    /// 离线修改在重放前不会被推送覆盖。每次叠加都会发出 `SnapshotApplied`
    /// 事件并带上叠加条数。需要原样转发时设为 `Overwrite`。
    pub snapshot_race_policy: SnapshotRacePolicy,
    /// 初始化时若在线且队列非空，立即排空一次
    pub drain_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./storefront_data"),
            storage: StorageBackend::Sled,
            retry: RetryPolicy::default(),
            remote_timeout_ms: 10_000,
            event_buffer_size: 256,
            snapshot_race_policy: SnapshotRacePolicy::default(),
            drain_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.storage == StorageBackend::Sled && self.data_dir.as_os_str().is_empty() {
            return Err(SyncError::Config("数据目录不能为空".to_string()));
        }
        if let StorageBackend::Memory { quota: Some(0) } = self.storage {
            return Err(SyncError::Config("内存存储配额必须大于 0".to_string()));
        }
        if self.remote_timeout_ms == 0 {
            return Err(SyncError::Config("远端超时必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(SyncError::Config("事件缓冲大小必须大于 0".to_string()));
        }
        self.retry.validate()
    }
}

pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self { config: SyncConfig::default() }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn storage(mut self, storage: StorageBackend) -> Self {
        self.config.storage = storage;
        self
    }

    /// 使用内存存储
    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageBackend::Memory { quota: None };
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn remote_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.remote_timeout_ms = timeout_ms;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn snapshot_race_policy(mut self, policy: SnapshotRacePolicy) -> Self {
        self.config.snapshot_race_policy = policy;
        self
    }

    pub fn drain_on_start(mut self, enabled: bool) -> Self {
        self.config.drain_on_start = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

/// 下单结果（UI 层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub success: bool,
    /// 客户端生成的订单号，离线下单也会返回
    pub order_id: Option<String>,
}

/// 面向 UI 的同步层入口
///
/// 所有变更接口返回 bool：只有本地持久化失败才返回 false，
/// 远端失败会被吸收为乐观写入 + 入队。
pub struct StorefrontSync {
    config: SyncConfig,
    kv: Arc<KvStore>,
    connectivity: ConnectivityMonitor,
    events: Arc<EventManager>,
    coordinator: Arc<SyncCoordinator>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for StorefrontSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorefrontSync")
            .field("data_dir", &self.config.data_dir)
            .field("persistent", &self.kv.is_persistent())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl StorefrontSync {
    /// 异步初始化
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 网络层 → 3. 事件层 → 4. 同步层
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 StorefrontSync...");
        config.validate()?;

        // === 第1层：存储 ===
        let kv = Arc::new(match &config.storage {
            StorageBackend::Sled => KvStore::open(&config.data_dir).await?,
            StorageBackend::Memory { quota: Some(quota) } => KvStore::memory_with_quota(*quota),
            StorageBackend::Memory { quota: None } => KvStore::memory(),
        });
        let cache = Arc::new(LocalCache::new(kv.clone()));
        let oplog = Arc::new(OperationLog::new(kv.clone()));
        info!("存储层初始化完成 (待重放 {} 条)", oplog.len());

        // === 第2层：网络 ===
        info!("网络状态: {}", if connectivity.is_online() { "online" } else { "offline" });

        // === 第3层：事件 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：同步协调器 ===
        let coordinator = SyncCoordinator::new(
            cache,
            oplog,
            remote,
            connectivity.clone(),
            events.clone(),
            CoordinatorOptions {
                retry: config.retry.clone(),
                remote_timeout: config.remote_timeout(),
                race_policy: config.snapshot_race_policy,
            },
        );
        coordinator.start();
        info!("同步协调器初始化完成");

        if config.drain_on_start && connectivity.is_online() && coordinator.pending_count() > 0 {
            info!("启动时存在 {} 条待重放操作，开始排空", coordinator.pending_count());
            coordinator.kick_drain();
        }

        info!("StorefrontSync 初始化完成");
        Ok(Arc::new(Self {
            config,
            kv,
            connectivity,
            events,
            coordinator,
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    // ========== 变更 ==========

    pub async fn add_cart_item(&self, owner: &OwnerKey, item: NewCartItem) -> bool {
        let result = self.coordinator.add_cart_item(owner, item).await;
        self.report(owner, OperationKind::AddCartItem, result)
    }

    pub async fn update_cart_quantity(&self, owner: &OwnerKey, item_id: &str, quantity: u32) -> bool {
        let result = self.coordinator.update_cart_quantity(owner, item_id, quantity).await;
        self.report(owner, OperationKind::UpdateCartItemQty, result)
    }

    pub async fn remove_cart_item(&self, owner: &OwnerKey, item_id: &str) -> bool {
        let result = self.coordinator.remove_cart_item(owner, item_id).await;
        self.report(owner, OperationKind::RemoveCartItem, result)
    }

    pub async fn clear_cart(&self, owner: &OwnerKey) -> bool {
        let result = self.coordinator.clear_cart(owner).await;
        self.report(owner, OperationKind::ClearCart, result)
    }

    pub async fn save_user(&self, owner: &OwnerKey, profile: UserProfile) -> bool {
        let result = self.coordinator.save_user(owner, profile).await;
        self.report(owner, OperationKind::SaveUser, result)
    }

    pub async fn place_order(&self, owner: &OwnerKey, draft: OrderDraft) -> PlaceOrderResult {
        match self.coordinator.place_order(owner, draft).await {
            Ok(placed) => PlaceOrderResult { success: true, order_id: Some(placed.order.order_id) },
            Err(e) => {
                self.report_failure(owner, OperationKind::PlaceOrder, &e);
                PlaceOrderResult { success: false, order_id: None }
            }
        }
    }

    fn report(&self, owner: &OwnerKey, kind: OperationKind, result: Result<MutationOutcome>) -> bool {
        match result {
            Ok(outcome) => {
                debug!("{} 完成: owner={} {:?}", kind, owner, outcome);
                true
            }
            Err(e) => {
                self.report_failure(owner, kind, &e);
                false
            }
        }
    }

    fn report_failure(&self, owner: &OwnerKey, kind: OperationKind, e: &SyncError) {
        if e.is_local_durability() {
            error!("{} 本地持久化失败: owner={}: {}", kind, owner, e);
        } else {
            warn!("{} 被拒绝: owner={}: {}", kind, owner, e);
        }
        self.events
            .emit(event_builders::local_write_failed(owner.clone(), kind, e.to_string()));
    }

    // ========== 订阅 ==========

    pub async fn subscribe_cart<F>(&self, owner: &OwnerKey, observer: F) -> Subscription
    where
        F: Fn(&Cart) + Send + Sync + 'static,
    {
        self.coordinator
            .multiplexer()
            .subscribe(Namespace::Cart, owner, move |snapshot: Option<&Snapshot>| {
                match snapshot.and_then(Snapshot::as_cart) {
                    Some(cart) => observer(cart),
                    None => observer(&Cart::default()),
                }
            })
            .await
    }

    pub async fn subscribe_orders<F>(&self, owner: &OwnerKey, observer: F) -> Subscription
    where
        F: Fn(&[Order]) + Send + Sync + 'static,
    {
        self.coordinator
            .multiplexer()
            .subscribe(Namespace::Orders, owner, move |snapshot: Option<&Snapshot>| {
                observer(snapshot.and_then(Snapshot::as_orders).unwrap_or(&[]))
            })
            .await
    }

    pub async fn subscribe_user<F>(&self, owner: &OwnerKey, observer: F) -> Subscription
    where
        F: Fn(Option<&UserProfile>) + Send + Sync + 'static,
    {
        self.coordinator
            .multiplexer()
            .subscribe(Namespace::User, owner, move |snapshot: Option<&Snapshot>| {
                observer(snapshot.and_then(Snapshot::as_user))
            })
            .await
    }

    // ========== 读取 ==========

    pub async fn cart(&self, owner: &OwnerKey) -> Result<Cart> {
        let snapshot = self.coordinator.load(Namespace::Cart, owner).await?;
        Ok(snapshot.and_then(|s| s.as_cart().cloned()).unwrap_or_default())
    }

    pub async fn orders(&self, owner: &OwnerKey) -> Result<Vec<Order>> {
        let snapshot = self.coordinator.load(Namespace::Orders, owner).await?;
        Ok(snapshot
            .and_then(|s| s.as_orders().map(<[Order]>::to_vec))
            .unwrap_or_default())
    }

    pub async fn user(&self, owner: &OwnerKey) -> Result<Option<UserProfile>> {
        let snapshot = self.coordinator.load(Namespace::User, owner).await?;
        Ok(snapshot.and_then(|s| s.as_user().cloned()))
    }

    /// 登出：删除该用户的本地缓存
    pub fn logout(&self, owner: &OwnerKey) -> bool {
        match self.coordinator.logout(owner) {
            Ok(()) => {
                info!("用户已登出: {}", owner);
                true
            }
            Err(e) => {
                error!("登出清理缓存失败: owner={}: {}", owner, e);
                false
            }
        }
    }

    // ========== 同步状态 ==========

    pub fn sync_status(&self) -> SyncStatus {
        self.coordinator.sync_status()
    }

    /// 立即排空一次（离线时不做任何事）
    pub async fn drain_now(&self) -> Result<DrainReport> {
        self.coordinator.drain().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// 异步关闭
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            warn!("StorefrontSync 已经关闭");
            return Ok(());
        }
        info!("正在关闭 StorefrontSync...");
        self.coordinator.shutdown();
        self.connectivity.stop();
        info!("StorefrontSync 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::remote::MemoryRemoteStore;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn owner() -> OwnerKey {
        OwnerKey::from_email("Hungry@Example.com").unwrap()
    }

    async fn memory_sync(online: bool) -> (Arc<StorefrontSync>, MemoryRemoteStore) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let remote = MemoryRemoteStore::new();
        let config = SyncConfig::builder()
            .in_memory()
            .retry(RetryPolicy::disabled())
            .build();
        let sync = StorefrontSync::initialize(config, Arc::new(remote.clone()), ConnectivityMonitor::new(online))
            .await
            .unwrap();
        (sync, remote)
    }

    #[test]
    fn config_builder_and_validation() {
        let config = SyncConfig::builder()
            .data_dir("/tmp/storefront")
            .remote_timeout_ms(500)
            .snapshot_race_policy(SnapshotRacePolicy::Overwrite)
            .drain_on_start(false)
            .build();
        assert_eq!(config.remote_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());

        let bad = SyncConfig::builder().remote_timeout_ms(0).build();
        assert!(matches!(bad.validate(), Err(SyncError::Config(_))));

        let bad = SyncConfig::builder().data_dir("").build();
        assert!(bad.validate().is_err());

        let bad = SyncConfig::builder().storage(StorageBackend::Memory { quota: Some(0) }).build();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SyncConfig::builder().in_memory().build();
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.storage, StorageBackend::Memory { quota: None });
        assert_eq!(back.snapshot_race_policy, SnapshotRacePolicy::RebasePending);
    }

    #[tokio::test]
    async fn offline_calls_succeed_and_observers_see_local_state() {
        let (sync, remote) = memory_sync(false).await;
        let o = owner();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = sync.subscribe_cart(&o, move |cart: &Cart| sink.lock().push(cart.len())).await;

        assert!(sync.add_cart_item(&o, NewCartItem::new("chicken-1", "Chicken", 299)).await);
        assert!(sync.add_cart_item(&o, NewCartItem::new("fries", "Fries", 99)).await);
        assert!(sync.update_cart_quantity(&o, "fries", 3).await);

        assert_eq!(seen.lock().clone(), vec![0, 1, 2, 2]);
        assert_eq!(sync.cart(&o).await.unwrap().total(), 299 + 3 * 99);
        assert_eq!(sync.sync_status(), SyncStatus::Pending { count: 3 });
        assert!(remote.write_log().is_empty());
        sync.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn place_order_returns_client_order_id() {
        let (sync, _remote) = memory_sync(false).await;
        let o = owner();
        assert!(sync.add_cart_item(&o, NewCartItem::new("a", "A", 500)).await);

        let orders: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = orders.clone();
        let _sub = sync
            .subscribe_orders(&o, move |list: &[Order]| {
                *sink.lock() = list.iter().map(|order| order.order_id.clone()).collect();
            })
            .await;

        let cart = sync.cart(&o).await.unwrap();
        let result = sync.place_order(&o, OrderDraft::from_cart(&cart)).await;
        assert!(result.success);
        let order_id = result.order_id.unwrap();
        assert!(uuid::Uuid::parse_str(&order_id).is_ok());
        assert_eq!(orders.lock().clone(), vec![order_id]);
        assert!(sync.cart(&o).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_order_reports_no_id() {
        let (sync, _remote) = memory_sync(false).await;
        let result = sync.place_order(&owner(), OrderDraft::from_cart(&Cart::default())).await;
        assert_eq!(result, PlaceOrderResult { success: false, order_id: None });
    }

    #[tokio::test]
    async fn only_invalid_input_or_durability_returns_false() {
        let (sync, remote) = memory_sync(true).await;
        let o = owner();

        assert!(!sync.add_cart_item(&o, NewCartItem::new("a", "A", 1).with_quantity(0)).await);
        assert!(!sync.add_cart_item(&o, NewCartItem::new("", "Nameless", 1)).await);
        assert_eq!(sync.sync_status(), SyncStatus::Synced);
        assert!(sync.cart(&o).await.unwrap().is_empty());

        // 远端失败不算失败
        remote.set_available(false);
        assert!(sync.add_cart_item(&o, NewCartItem::new("a", "A", 1)).await);
        assert_eq!(sync.coordinator().pending_count(), 1);
        sync.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn durability_failure_returns_false_and_emits_event() {
        let remote = MemoryRemoteStore::new();
        let config = SyncConfig::builder()
            .storage(StorageBackend::Memory { quota: Some(1) })
            .build();
        let sync = StorefrontSync::initialize(config, Arc::new(remote), ConnectivityMonitor::new(false))
            .await
            .unwrap();
        let mut events = sync.events().subscribe();

        assert!(!sync.add_cart_item(&owner(), NewCartItem::new("a", "A", 1)).await);
        match events.recv().await.unwrap() {
            SyncEvent::LocalWriteFailed { kind, .. } => assert_eq!(kind, OperationKind::AddCartItem),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn online_writes_reach_remote_and_user_round_trips() {
        let (sync, remote) = memory_sync(true).await;
        let o = owner();
        let profile = UserProfile {
            email: "hungry@example.com".into(),
            display_name: "Hungry".into(),
            ..Default::default()
        };
        assert!(sync.save_user(&o, profile).await);
        assert_eq!(sync.sync_status(), SyncStatus::Synced);

        let stored = sync.user(&o).await.unwrap().unwrap();
        assert_eq!(stored.display_name, "Hungry");
        assert!(stored.updated_at > 0);
        assert_eq!(remote.write_log().len(), 1);

        assert!(sync.logout(&o));
        sync.connectivity().set_online(false);
        assert!(sync.user(&o).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sled_backed_queue_drains_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let remote = MemoryRemoteStore::new();
        let config = SyncConfig::builder()
            .data_dir(temp_dir.path())
            .retry(RetryPolicy::disabled())
            .build();

        {
            let sync = StorefrontSync::initialize(
                config.clone(),
                Arc::new(remote.clone()),
                ConnectivityMonitor::new(false),
            )
            .await
            .unwrap();
            assert!(sync.add_cart_item(&owner(), NewCartItem::new("a", "A", 1)).await);
            sync.shutdown().await.unwrap();
        }

        let config = SyncConfig { drain_on_start: false, ..config };
        let sync = StorefrontSync::initialize(config, Arc::new(remote.clone()), ConnectivityMonitor::new(true))
            .await
            .unwrap();
        assert_eq!(sync.sync_status(), SyncStatus::Pending { count: 1 });
        let report = sync.drain_now().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(remote.write_log().len(), 1);
        sync.shutdown().await.unwrap();
    }
}
