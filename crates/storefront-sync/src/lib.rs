//! Storefront Sync - 外卖点餐客户端的离线优先同步层
//!
//! 网络或后端不可用时，购物车、用户资料和订单历史仍然可用；
//! 恢复连接后自动与远端文档存储对账：
//! - 📡 连通性监控：注入式的在线/离线信号
//! - 💾 本地缓存：每个 (命名空间, 用户) 一条最新快照，sled 持久化
//! - 📜 操作日志：持久化 FIFO 队列，重启不丢失
//! - 🔁 同步协调：远端优先，失败时乐观写入 + 入队，上线后按序重放
//! - 🔔 订阅复用：远端推送落地缓存并分发给 UI 观察者
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront_sync::{
//!     ConnectivityMonitor, MemoryRemoteStore, NewCartItem, OwnerKey, StorefrontSync, SyncConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder().data_dir("/path/to/data").build();
//!     let sync = StorefrontSync::initialize(
//!         config,
//!         Arc::new(MemoryRemoteStore::new()),
//!         ConnectivityMonitor::default(),
//!     )
//!     .await?;
//!
//!     let owner = OwnerKey::from_email("diner@example.com")?;
//!     let _subscription = sync
//!         .subscribe_cart(&owner, |cart| println!("购物车: {} 件", cart.item_count()))
//!         .await;
//!
//!     // 离线时同样立即成功，恢复连接后自动重放
//!     sync.add_cart_item(&owner, NewCartItem::new("chicken-1", "Fried Chicken", 299)).await;
//!
//!     sync.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod version;
pub mod model;
pub mod storage;
pub mod network;
pub mod events;
pub mod remote;
pub mod sync;
pub mod sdk;

// 重新导出核心类型，方便使用
pub use error::{RemoteError, Result, SyncError};
pub use model::{
    Cart, CartItem, Namespace, NewCartItem, Order, OrderDraft, OrderStatus, OwnerKey, Snapshot, UserProfile,
};
pub use storage::{CacheEntry, KvStore, LocalCache, OperationLog};
pub use network::{
    ChannelNetworkStatusListener, ConnectivityEvent, ConnectivityMonitor, NetworkStatus, NetworkStatusEvent,
    NetworkStatusListener,
};
pub use events::{EventManager, EventStats, SyncEvent};
pub use remote::{MemoryRemoteStore, RemoteStore, RemoteSubscription, SnapshotSink};
pub use sync::{
    CoordinatorOptions, DrainReport, Mutation, MutationOutcome, OperationKind, PlaceOrderOutcome, QueuedOperation, RetryPolicy,
    SnapshotRacePolicy, Subscription, SubscriptionMultiplexer, SyncCoordinator, SyncStatus,
};
pub use sdk::{PlaceOrderResult, StorageBackend, StorefrontSync, SyncConfig, SyncConfigBuilder};
pub use version::SDK_VERSION;
