//! 本地合并规则
//!
//! `apply_locally` 是唯一的合并入口：乐观写入、重放后的变基（rebase）以及
//! 内存版远端存储都走这里，保证本地与远端对同一变更得到同一结果。

use crate::error::{Result, SyncError};
use crate::model::{Cart, Namespace, Order, Snapshot};
use crate::sync::operation::{Mutation, QueuedOperation};

/// 在 `current` 上应用一次变更，返回新快照
///
/// `current` 为 None 时以命名空间空值为起点；`user` 命名空间直接被覆盖。
pub fn apply_locally(mutation: &Mutation, current: Option<Snapshot>) -> Result<Snapshot> {
    let namespace = mutation.namespace();
    if let Some(snapshot) = &current {
        if snapshot.namespace() != namespace {
            return Err(SyncError::InvalidArgument(format!(
                "cannot apply {} to a {} snapshot",
                mutation.kind(),
                snapshot.namespace()
            )));
        }
    }

    match mutation {
        Mutation::SaveUser { profile } => Ok(Snapshot::User(profile.clone())),
        Mutation::AddCartItem { item, added_at } => {
            let mut cart = into_cart(current);
            cart.add(item, *added_at);
            Ok(Snapshot::Cart(cart))
        }
        Mutation::UpdateCartItemQty { item_id, quantity } => {
            let mut cart = into_cart(current);
            cart.set_quantity(item_id, *quantity);
            Ok(Snapshot::Cart(cart))
        }
        Mutation::RemoveCartItem { item_id } => {
            let mut cart = into_cart(current);
            cart.remove(item_id);
            Ok(Snapshot::Cart(cart))
        }
        Mutation::ClearCart => {
            let mut cart = into_cart(current);
            cart.clear();
            Ok(Snapshot::Cart(cart))
        }
        Mutation::PlaceOrder { order } => {
            let mut orders = into_orders(current);
            // 同一订单号重放时不重复追加
            match orders.iter_mut().find(|o| o.order_id == order.order_id) {
                Some(existing) => *existing = order.clone(),
                None => orders.push(order.clone()),
            }
            Ok(Snapshot::Orders(orders))
        }
    }
}

/// 把 `pending` 中属于 `namespace` 的操作按顺序叠加到 `base` 上
pub fn rebase<'a, I>(namespace: Namespace, base: Option<Snapshot>, pending: I) -> Result<Option<Snapshot>>
where
    I: IntoIterator<Item = &'a QueuedOperation>,
{
    let mut snapshot = base;
    for op in pending.into_iter().filter(|op| op.namespace() == namespace) {
        snapshot = Some(apply_locally(&op.payload, snapshot)?);
    }
    Ok(snapshot)
}

fn into_cart(current: Option<Snapshot>) -> Cart {
    match current {
        Some(Snapshot::Cart(cart)) => cart,
        _ => Cart::default(),
    }
}

fn into_orders(current: Option<Snapshot>) -> Vec<Order> {
    match current {
        Some(Snapshot::Orders(orders)) => orders,
        _ => Vec::new(),
    }
}
