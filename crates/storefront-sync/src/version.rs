//! SDK 版本信息

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 持久化格式版本，写入 KV 元数据，打开时校验
///
/// 缓存快照与操作日志的 JSON 结构发生不兼容变更时递增。
pub const STORAGE_FORMAT_VERSION: u32 = 1;
