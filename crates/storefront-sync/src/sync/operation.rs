//! 变更操作 - 既用于远端写入，也作为操作日志的重放参数

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Namespace, NewCartItem, Order, OwnerKey, UserProfile};

/// 操作类型（受控枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    SaveUser,
    AddCartItem,
    UpdateCartItemQty,
    RemoveCartItem,
    ClearCart,
    PlaceOrder,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SaveUser => "saveUser",
            Self::AddCartItem => "addCartItem",
            Self::UpdateCartItemQty => "updateCartItemQty",
            Self::RemoveCartItem => "removeCartItem",
            Self::ClearCart => "clearCart",
            Self::PlaceOrder => "placeOrder",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次变更的完整参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "camelCase")]
pub enum Mutation {
    SaveUser { profile: UserProfile },
    AddCartItem { item: NewCartItem, added_at: i64 },
    UpdateCartItemQty { item_id: String, quantity: u32 },
    RemoveCartItem { item_id: String },
    ClearCart,
    PlaceOrder { order: Order },
}

impl Mutation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Mutation::SaveUser { .. } => OperationKind::SaveUser,
            Mutation::AddCartItem { .. } => OperationKind::AddCartItem,
            Mutation::UpdateCartItemQty { .. } => OperationKind::UpdateCartItemQty,
            Mutation::RemoveCartItem { .. } => OperationKind::RemoveCartItem,
            Mutation::ClearCart => OperationKind::ClearCart,
            Mutation::PlaceOrder { .. } => OperationKind::PlaceOrder,
        }
    }

    /// 变更作用的命名空间
    pub fn namespace(&self) -> Namespace {
        match self {
            Mutation::SaveUser { .. } => Namespace::User,
            Mutation::AddCartItem { .. }
            | Mutation::UpdateCartItemQty { .. }
            | Mutation::RemoveCartItem { .. }
            | Mutation::ClearCart => Namespace::Cart,
            Mutation::PlaceOrder { .. } => Namespace::Orders,
        }
    }
}

/// 操作日志中的一条待重放操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// 单调递增，仅用于保持 FIFO 顺序
    pub id: u64,
    pub owner_key: OwnerKey,
    pub kind: OperationKind,
    pub payload: Mutation,
    /// 入队时间（UTC 毫秒）
    pub enqueued_at: i64,
    /// 重放失败次数（诊断用）
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedOperation {
    pub fn namespace(&self) -> Namespace {
        self.payload.namespace()
    }
}
