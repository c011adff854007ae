//! 网络连通性监控
//!
//! `ConnectivityMonitor` 是全局唯一的在线/离线信号，以对象形式注入到各组件，
//! 不使用全局变量。宿主平台通过 `NetworkStatusListener` 提供真实的网络状态；
//! 没有信号时默认在线（fail-open），避免所有写入无谓地滞留在队列里。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限
    Limited,
}

impl NetworkStatus {
    /// 是否可达（受限网络也视为可达，写入失败会自然走离线路径）
    pub fn is_reachable(self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 平台层上报的网络状态变化
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器 trait（由宿主平台实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 连通性翻转事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub online: bool,
    pub timestamp: i64,
}

/// 连通性回调
pub type ConnectivityListener = Arc<dyn Fn(bool) + Send + Sync>;

/// `on_change` 返回的监听器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 连通性监控器，克隆后共享同一状态
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    online: AtomicBool,
    sender: broadcast::Sender<ConnectivityEvent>,
    listeners: Mutex<Vec<(ListenerId, ConnectivityListener)>>,
    next_listener_id: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl Default for ConnectivityMonitor {
    /// 没有宿主信号时假定在线
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial_online: bool) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initial_online),
                sender,
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// 从宿主监听器构建：启动时采样一次，之后跟随其事件
    ///
    /// 监听器无法启动时保持在线（fail-open）。
    pub async fn from_listener(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let initial = listener.get_current_status().await;
        let monitor = Self::new(initial.is_reachable());
        info!("初始网络状态: {:?}", initial);

        match listener.start_monitoring().await {
            Ok(mut receiver) => {
                let forward = monitor.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(event) => forward.set_online(event.new_status.is_reachable()),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("网络状态事件积压，跳过 {} 条", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    debug!("网络状态监听结束");
                });
                *monitor.inner.watcher.lock() = Some(handle);
            }
            Err(e) => {
                warn!("网络状态监听启动失败，按在线处理: {}", e);
                monitor.set_online(true);
            }
        }
        monitor
    }

    /// 当前是否在线
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// 更新在线状态，仅在真正翻转时通知
    pub fn set_online(&self, online: bool) {
        let previous = self.inner.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }
        info!("网络连通性变化: {} -> {}", label(previous), label(online));

        let event = ConnectivityEvent { online, timestamp: now_millis() };
        if self.inner.sender.send(event).is_err() {
            debug!("连通性事件无订阅者");
        }

        // 先拷贝再回调，回调里可以安全地再注册/移除监听器
        let listeners: Vec<ConnectivityListener> =
            self.inner.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(online);
        }
    }

    /// 注册翻转回调
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// 订阅翻转事件（供异步任务使用）
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.sender.subscribe()
    }

    /// 停止跟随宿主监听器
    pub fn stop(&self) {
        if let Some(handle) = self.inner.watcher.lock().take() {
            handle.abort();
        }
    }
}

fn label(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

/// 推送式的宿主监听器：平台代码调用 `report` 上报状态
#[derive(Debug)]
pub struct ChannelNetworkStatusListener {
    status: Mutex<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl ChannelNetworkStatusListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { status: Mutex::new(initial), sender }
    }

    /// 上报新的网络状态
    pub fn report(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.status.lock(), new_status);
        let _ = self.sender.send(NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        });
    }
}

#[async_trait]
impl NetworkStatusListener for ChannelNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.lock()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}
