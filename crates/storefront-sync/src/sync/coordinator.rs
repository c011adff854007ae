//! 同步协调器
//!
//! 每次变更：在线时先尝试远端写入，成功则用权威快照更新缓存；
//! 离线或远端失败时按同一合并规则乐观写入缓存并入队，调用方总是立即得到结果。
//! 只有本地持久化失败或输入校验失败（`InvalidArgument`）才会以 `Err` 返回，远端失败从不返回 `Err`。
//!
//! 上线时按 FIFO 逐条重放操作日志，遇到失败立即停止，按 `RetryPolicy` 退避重试。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{RemoteError, Result, SyncError};
use crate::events::{event_builders, EventManager};
use crate::model::{now_millis, Namespace, NewCartItem, Order, OrderDraft, OrderStatus, OwnerKey, Snapshot, UserProfile};
use crate::network::ConnectivityMonitor;
use crate::remote::RemoteStore;
use crate::storage::{LocalCache, OperationLog};
use crate::sync::apply::apply_locally;
use crate::sync::operation::{Mutation, OperationKind, QueuedOperation};
use crate::sync::retry_policy::{ReplayFailureReason, RetryPolicy};
use crate::sync::subscription::{SnapshotRacePolicy, SubscriptionMultiplexer};
use crate::sync::{store_authoritative, SyncStatus};

type KeyLocks = Arc<RwLock<HashMap<(Namespace, OwnerKey), Arc<Mutex<()>>>>>;

/// 单次变更的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// 远端已确认
    Synced,
    /// 已乐观写入本地并入队
    Queued { op_id: u64 },
}

impl MutationOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, MutationOutcome::Synced)
    }

    pub fn op_id(&self) -> Option<u64> {
        match self {
            MutationOutcome::Synced => None,
            MutationOutcome::Queued { op_id } => Some(*op_id),
        }
    }
}

/// 下单结果：下单与清空购物车两个子操作各自的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrderOutcome {
    pub order: Order,
    pub order_outcome: MutationOutcome,
    pub cart_outcome: MutationOutcome,
}

/// 排空中断信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainHalt {
    pub op_id: u64,
    pub kind: OperationKind,
    pub error: RemoteError,
    /// 连续中断次数
    pub attempt: u32,
    /// 下次自动重试的延迟；None 表示等待下一次上线
    pub next_retry: Option<Duration>,
}

/// 一次排空的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub remaining: usize,
    pub halted: Option<DrainHalt>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && self.remaining == 0
    }
}

/// 协调器参数
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub retry: RetryPolicy,
    pub remote_timeout: Duration,
    pub race_policy: SnapshotRacePolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            remote_timeout: Duration::from_secs(10),
            race_policy: SnapshotRacePolicy::default(),
        }
    }
}

pub struct SyncCoordinator {
    me: Weak<SyncCoordinator>,
    cache: Arc<LocalCache>,
    oplog: Arc<OperationLog>,
    remote: Arc<dyn RemoteStore>,
    connectivity: ConnectivityMonitor,
    multiplexer: SubscriptionMultiplexer,
    events: Arc<EventManager>,
    retry: RetryPolicy,
    remote_timeout: Duration,
    /// 每个 (命名空间, owner) 一把锁，同键变更不重叠
    key_locks: KeyLocks,
    /// 同一时刻只有一个排空
    drain_lock: Mutex<()>,
    draining: AtomicBool,
    /// 连续中断的排空次数，全部同步或上线时清零
    halted_attempts: AtomicU32,
    retry_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("online", &self.connectivity.is_online())
            .field("pending", &self.oplog.len())
            .field("draining", &self.draining.load(Ordering::SeqCst))
            .field("retry", &self.retry)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        cache: Arc<LocalCache>,
        oplog: Arc<OperationLog>,
        remote: Arc<dyn RemoteStore>,
        connectivity: ConnectivityMonitor,
        events: Arc<EventManager>,
        options: CoordinatorOptions,
    ) -> Arc<Self> {
        let multiplexer = SubscriptionMultiplexer::new(
            remote.clone(),
            cache.clone(),
            oplog.clone(),
            connectivity.clone(),
            events.clone(),
            options.race_policy,
            options.remote_timeout,
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cache,
            oplog,
            remote,
            connectivity,
            multiplexer,
            events,
            retry: options.retry,
            remote_timeout: options.remote_timeout,
            key_locks: Arc::new(RwLock::new(HashMap::new())),
            drain_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
            halted_attempts: AtomicU32::new(0),
            retry_task: parking_lot::Mutex::new(None),
            watcher: parking_lot::Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.multiplexer
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    // ========== 变更入口 ==========

    pub async fn save_user(&self, owner: &OwnerKey, mut profile: UserProfile) -> Result<MutationOutcome> {
        profile.updated_at = now_millis();
        self.mutate(owner, Mutation::SaveUser { profile }).await
    }

    pub async fn add_cart_item(&self, owner: &OwnerKey, item: NewCartItem) -> Result<MutationOutcome> {
        if item.id.trim().is_empty() {
            return Err(SyncError::InvalidArgument("cart item id must not be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(SyncError::InvalidArgument("cart item quantity must be at least 1".to_string()));
        }
        self.mutate(owner, Mutation::AddCartItem { item, added_at: now_millis() }).await
    }

    /// 数量为 0 时移除该行
    pub async fn update_cart_quantity(&self, owner: &OwnerKey, item_id: &str, quantity: u32) -> Result<MutationOutcome> {
        self.mutate(owner, Mutation::UpdateCartItemQty { item_id: item_id.to_string(), quantity })
            .await
    }

    pub async fn remove_cart_item(&self, owner: &OwnerKey, item_id: &str) -> Result<MutationOutcome> {
        self.mutate(owner, Mutation::RemoveCartItem { item_id: item_id.to_string() }).await
    }

    pub async fn clear_cart(&self, owner: &OwnerKey) -> Result<MutationOutcome> {
        self.mutate(owner, Mutation::ClearCart).await
    }

    /// 下单并清空购物车
    ///
    /// 两个子操作按顺序执行：离线时依次入队；远端下单成功而清空失败时只有清空入队。
    pub async fn place_order(&self, owner: &OwnerKey, draft: OrderDraft) -> Result<PlaceOrderOutcome> {
        if draft.items.is_empty() {
            return Err(SyncError::InvalidArgument("order has no items".to_string()));
        }
        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            total: draft.total(),
            items: draft.items,
            status: OrderStatus::Placed,
            delivery_address: draft.delivery_address,
            note: draft.note,
            placed_at: now_millis(),
        };

        let order_outcome = self.mutate(owner, Mutation::PlaceOrder { order: order.clone() }).await?;
        let cart_outcome = self.mutate(owner, Mutation::ClearCart).await?;
        info!(
            "订单已提交: {} owner={} order={:?} cart={:?}",
            order.order_id, owner, order_outcome, cart_outcome
        );
        Ok(PlaceOrderOutcome { order, order_outcome, cart_outcome })
    }

    async fn mutate(&self, owner: &OwnerKey, mutation: Mutation) -> Result<MutationOutcome> {
        self.ensure_running()?;
        let namespace = mutation.namespace();
        let kind = mutation.kind();
        let lock = self.key_lock(namespace, owner).await;
        let _guard = lock.lock().await;

        let online = self.connectivity.is_online();
        if online {
            if self.oplog.has_pending_for(owner)? {
                // 队列里还有该 owner 的操作，直接写远端会越过它们
                debug!("存在待重放操作，{} 排在其后: owner={}", kind, owner);
            } else {
                match self.with_timeout(self.remote.write(namespace, owner, &mutation)).await {
                    Ok(snapshot) => {
                        let entry = self.cache.write(namespace, owner, snapshot)?;
                        // 通道已打开时远端推送会带来同一快照
                        if !self.multiplexer.has_open_channel(namespace, owner) {
                            self.multiplexer.publish_local(namespace, owner, Some(&entry.value));
                        }
                        debug!("远端写入成功: {} owner={}", kind, owner);
                        return Ok(MutationOutcome::Synced);
                    }
                    Err(e) => warn!("远端写入失败，转为本地排队: {} owner={}: {}", kind, owner, e),
                }
            }
        }

        let outcome = self.queue_locally(owner, mutation)?;
        if online {
            self.kick_drain();
        }
        Ok(outcome)
    }

    /// 乐观写入缓存并入队
    ///
    /// 先入队再写缓存；缓存写入失败时撤销入队，调用方看到的失败不会在之后被重放。
    fn queue_locally(&self, owner: &OwnerKey, mutation: Mutation) -> Result<MutationOutcome> {
        let namespace = mutation.namespace();
        let kind = mutation.kind();
        let current = self.cache.read(namespace, owner)?.map(|entry| entry.value);
        let next = apply_locally(&mutation, current)?;

        let op = self.oplog.enqueue(owner, mutation)?;
        if let Err(e) = self.cache.write(namespace, owner, next.clone()) {
            if let Err(rollback) = self.oplog.dequeue(op.id) {
                error!("撤销入队失败: #{}: {}", op.id, rollback);
            }
            return Err(e);
        }

        self.events
            .emit(event_builders::operation_queued(op.id, owner.clone(), kind));
        self.multiplexer.publish_local(namespace, owner, Some(&next));
        info!("变更已乐观写入并入队: #{} {} owner={}", op.id, kind, owner);
        Ok(MutationOutcome::Queued { op_id: op.id })
    }

    // ========== 读取 ==========

    /// 在线时读远端（叠加待重放操作后写入缓存），否则或失败时读缓存
    pub async fn load(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<Snapshot>> {
        self.ensure_running()?;
        if self.connectivity.is_online() {
            let lock = self.key_lock(namespace, owner).await;
            let _guard = lock.lock().await;
            match self.with_timeout(self.remote.read(namespace, owner)).await {
                Ok(remote) => {
                    let (value, _) =
                        store_authoritative(&self.cache, &self.oplog, namespace, owner, remote, true, None)?;
                    self.multiplexer.publish_local(namespace, owner, value.as_ref());
                    return Ok(value);
                }
                Err(e) => warn!("远端读取失败，使用缓存: {}/{}: {}", namespace, owner, e),
            }
        }
        self.cache.read_or_empty(namespace, owner)
    }

    /// 只读缓存，不访问网络
    pub fn cached(&self, namespace: Namespace, owner: &OwnerKey) -> Result<Option<Snapshot>> {
        self.cache.read_or_empty(namespace, owner)
    }

    /// 登出：删除该 owner 的缓存，待重放操作保留
    pub fn logout(&self, owner: &OwnerKey) -> Result<()> {
        self.cache.clear_owner(owner)?;
        let pending = self.oplog.pending_for(owner)?.len();
        if pending > 0 {
            warn!("登出时仍有 {} 条待重放操作，保留在队列中: owner={}", pending, owner);
        }
        Ok(())
    }

    // ========== 排空 ==========

    /// 按 FIFO 逐条重放操作日志
    ///
    /// 同一时刻只有一个排空；离线时直接返回。遇到失败立即停止，不跳过、不重排。
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport> {
        self.ensure_running()?;
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.connectivity.is_online() {
            report.remaining = self.oplog.len();
            debug!("离线，跳过排空 (剩余 {})", report.remaining);
            return Ok(report);
        }

        self.draining.store(true, Ordering::SeqCst);
        let result = self.drain_queue(&mut report).await;
        self.draining.store(false, Ordering::SeqCst);
        result?;

        report.remaining = self.oplog.len();
        Ok(report)
    }

    async fn drain_queue(&self, report: &mut DrainReport) -> Result<()> {
        loop {
            // 排空期间新入队的操作在下一轮取出
            let batch = self.oplog.peek_all()?;
            if batch.is_empty() {
                break;
            }
            for op in batch {
                if self.shutting_down.load(Ordering::SeqCst) {
                    return Err(SyncError::ShuttingDown("drain interrupted".to_string()));
                }
                if !self.connectivity.is_online() {
                    info!("排空中途离线，剩余操作等待下次上线");
                    return Ok(());
                }
                if let Err(error) = self.replay(&op).await? {
                    report.halted = Some(self.halt(&op, error)?);
                    return Ok(());
                }
                report.replayed += 1;
            }
        }

        self.halted_attempts.store(0, Ordering::SeqCst);
        if report.replayed > 0 {
            info!("队列已清空，完全同步 (重放 {} 条)", report.replayed);
            self.events.emit(event_builders::synced());
        }
        Ok(())
    }

    /// 重放单条操作；外层 `Err` 是本地错误，内层是远端失败
    async fn replay(&self, op: &QueuedOperation) -> Result<std::result::Result<(), RemoteError>> {
        let namespace = op.namespace();
        let owner = &op.owner_key;
        let lock = self.key_lock(namespace, owner).await;
        let _guard = lock.lock().await;

        self.multiplexer.set_in_flight(Some(op.id));
        let written = self.with_timeout(self.remote.write(namespace, owner, &op.payload)).await;
        let result = match written {
            Ok(snapshot) => self.settle_replayed(op, snapshot).map(Ok),
            Err(e) => Ok(Err(e)),
        };
        self.multiplexer.set_in_flight(None);
        result
    }

    fn settle_replayed(&self, op: &QueuedOperation, snapshot: Snapshot) -> Result<()> {
        let namespace = op.namespace();
        let owner = &op.owner_key;
        self.oplog.dequeue(op.id)?;
        let (value, rebased) =
            store_authoritative(&self.cache, &self.oplog, namespace, owner, Some(snapshot), true, None)?;
        self.multiplexer.publish_local(namespace, owner, value.as_ref());
        self.events
            .emit(event_builders::operation_replayed(op.id, owner.clone(), op.kind));
        debug!("重放成功: #{} {} owner={} (叠加 {} 条)", op.id, op.kind, owner, rebased);
        Ok(())
    }

    fn halt(&self, op: &QueuedOperation, error: RemoteError) -> Result<DrainHalt> {
        self.oplog.record_failure(op.id)?;
        let attempt = self.halted_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let reason = ReplayFailureReason::from(&error);
        let next_retry = self.retry.delay_for(attempt, &reason);

        warn!("排空在 #{} {} 处中断 (第 {} 次): {}", op.id, op.kind, attempt, error);
        self.events.emit(event_builders::drain_halted(
            op.id,
            error.to_string(),
            attempt,
            next_retry.map(|delay| delay.as_millis() as u64),
        ));

        match next_retry {
            Some(delay) => self.schedule_retry(delay),
            None => info!("不再自动重试，等待下一次上线"),
        }
        Ok(DrainHalt { op_id: op.id, kind: op.kind, error, attempt, next_retry })
    }

    fn schedule_retry(&self, delay: Duration) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        debug!("{}ms 后重试排空", delay.as_millis());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // 先让出槽位，本次排空再中断时会放入新的任务
            drop(this.retry_task.lock().take());
            if this.connectivity.is_online() {
                if let Err(e) = this.drain().await {
                    error!("定时重试排空失败: {}", e);
                }
            }
        });
        if let Some(previous) = self.retry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 在后台触发一次排空
    pub fn kick_drain(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = this.drain().await {
                error!("后台排空失败: {}", e);
            }
        });
    }

    // ========== 连通性 ==========

    /// 启动连通性监听：上线时排空并打开推送通道，离线时关闭通道
    pub fn start(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }
        let mut receiver = self.connectivity.subscribe();
        let weak = self.me.clone();
        *watcher = Some(tokio::spawn(async move {
            loop {
                let online = match receiver.recv().await {
                    Ok(event) => event.online,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("连通性事件积压，跳过 {} 条，按当前状态处理", skipped);
                        match weak.upgrade() {
                            Some(this) => this.connectivity.is_online(),
                            None => break,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.on_connectivity_change(online).await;
            }
            debug!("连通性监听结束");
        }));
        info!("同步协调器已启动");
    }

    async fn on_connectivity_change(&self, online: bool) {
        self.events.emit(event_builders::connectivity_changed(online));
        if online {
            self.halted_attempts.store(0, Ordering::SeqCst);
            match self.drain().await {
                Ok(report) => debug!("上线排空: {:?}", report),
                Err(e) => error!("上线排空失败: {}", e),
            }
            // 先排空再打开通道，首个推送已包含重放结果
            self.multiplexer.go_online().await;
        } else {
            if let Some(task) = self.retry_task.lock().take() {
                task.abort();
            }
            self.multiplexer.go_offline();
        }
    }

    // ========== 状态 ==========

    pub fn sync_status(&self) -> SyncStatus {
        let pending = self.oplog.len();
        if self.draining.load(Ordering::SeqCst) {
            SyncStatus::Draining { remaining: pending }
        } else if pending == 0 {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending { count: pending }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.oplog.len()
    }

    pub fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.oplog.peek_all()
    }

    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
        self.multiplexer.shutdown();
        info!("同步协调器已关闭 (剩余 {} 条待重放)", self.oplog.len());
    }

    // ========== 内部工具 ==========

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown("sync coordinator is shut down".to_string()));
        }
        Ok(())
    }

    async fn with_timeout<T, F>(&self, future: F) -> std::result::Result<T, RemoteError>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.remote_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.remote_timeout.as_millis() as u64)),
        }
    }

    async fn key_lock(&self, namespace: Namespace, owner: &OwnerKey) -> Arc<Mutex<()>> {
        let key = (namespace, owner.clone());
        {
            let locks = self.key_locks.read().await;
            if let Some(lock) = locks.get(&key) {
                return lock.clone();
            }
        }
        let mut locks = self.key_locks.write().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
