//! 存储层
//!
//! ```text
//! KvStore (sled / 内存)
//!   ├── LocalCache    表 `cache`：每个 (命名空间, owner) 的最新快照
//!   └── OperationLog  表 `oplog`：待重放的变更队列
//! ```

pub mod kv;
pub mod cache;
pub mod oplog;

pub use kv::{KvStore, Table};
pub use cache::{CacheEntry, LocalCache};
pub use oplog::OperationLog;
