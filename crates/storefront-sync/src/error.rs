use thiserror::Error;

/// 远端存储错误
///
/// 由 `RemoteStore` 实现返回。协调器把所有远端错误都当作可恢复的：
/// 走本地乐观写入 + 入队，调用方只看到成功。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// 网络不可达
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    /// 请求超时
    #[error("remote timeout after {0} ms")]
    Timeout(u64),
    /// 后端返回错误
    #[error("backend error [{code}]: {message}")]
    Backend { code: u16, message: String },
    /// 后端拒绝了该变更（例如校验失败）
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// 是否为瞬时故障（网络/超时/5xx）
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Unavailable(_) | RemoteError::Timeout(_) => true,
            RemoteError::Backend { code, .. } => *code >= 500,
            RemoteError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 持久化介质已满（配额耗尽）
    #[error("Storage full: {0}")]
    StorageFull(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl SyncError {
    /// 是否为本地持久化失败（调用方可见的唯一失败类型）
    pub fn is_local_durability(&self) -> bool {
        matches!(
            self,
            SyncError::KvStore(_) | SyncError::StorageFull(_) | SyncError::IO(_) | SyncError::Serialization(_)
        )
    }
}

impl From<sled::Error> for SyncError {
    fn from(error: sled::Error) -> Self {
        SyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        SyncError::IO(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
