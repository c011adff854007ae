//! 领域模型 - 用户资料、购物车、订单及其快照
//!
//! 快照按命名空间划分：
//! - `user`：单条用户资料
//! - `cart`：按加入顺序排列的商品 id → 购物车条目
//! - `orders`：订单记录序列

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// 用户标识派生出的存储键
///
/// 由账号邮箱确定性派生：去空白、转小写后做 hex 编码。
/// hex 编码是单射的，不同邮箱不会碰撞，结果只含 `[0-9a-f]`，可以安全放进 KV 键。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    /// 从账号邮箱派生
    pub fn from_email(email: &str) -> Result<Self> {
        let normalized = email.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(SyncError::InvalidArgument("email cannot be empty".to_string()));
        }
        match normalized.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => {
                return Err(SyncError::InvalidArgument(format!("malformed email: {}", email)));
            }
        }
        Ok(Self(hex::encode(normalized.as_bytes())))
    }

    /// 使用已派生好的 token（例如从持久化数据中读回）
    pub fn from_raw(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let valid = !token.is_empty()
            && token.len() % 2 == 0
            && token.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(SyncError::InvalidArgument(format!("invalid owner key: {}", token)));
        }
        Ok(Self(token))
    }

    /// 还原出规范化后的邮箱
    pub fn email(&self) -> Option<String> {
        hex::decode(&self.0).ok().and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 缓存命名空间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    User,
    Cart,
    Orders,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::User, Namespace::Cart, Namespace::Orders];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cart => "cart",
            Self::Orders => "orders",
        }
    }
}

impl FromStr for Namespace {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "cart" => Ok(Self::Cart),
            "orders" => Ok(Self::Orders),
            other => Err(SyncError::InvalidArgument(format!("unknown namespace: {}", other))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 用户资料
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    /// 最后更新时间（UTC 毫秒）
    pub updated_at: i64,
}

/// 加入购物车的输入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCartItem {
    pub id: String,
    pub name: String,
    /// 单价（最小货币单位，如分）
    pub unit_price: u64,
    pub image: Option<String>,
    pub quantity: u32,
}

impl NewCartItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, unit_price: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            unit_price,
            image: None,
            quantity: 1,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
}

/// 购物车条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: String,
    pub name: String,
    pub unit_price: u64,
    pub image: Option<String>,
    pub quantity: u32,
    /// 加入时间（UTC 毫秒）
    pub added_at: i64,
}

impl CartItem {
    /// 超出 u64 时取上限
    pub fn line_total(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

/// 购物车，按加入顺序保存
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart {
    items: IndexMap<String, CartItem>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item_id: &str) -> Option<&CartItem> {
        self.items.get(item_id)
    }

    pub fn items(&self) -> impl Iterator<Item = &CartItem> {
        self.items.values()
    }

    /// 商品件数总和
    pub fn item_count(&self) -> u64 {
        self.items.values().map(|i| u64::from(i.quantity)).sum()
    }

    pub fn total(&self) -> u64 {
        self.items
            .values()
            .map(CartItem::line_total)
            .fold(0, u64::saturating_add)
    }

    /// 合并规则：同 id 累加数量，否则追加新行
    pub(crate) fn add(&mut self, item: &NewCartItem, added_at: i64) {
        match self.items.get_mut(&item.id) {
            Some(existing) => {
                existing.quantity = existing.quantity.saturating_add(item.quantity);
            }
            None => {
                self.items.insert(
                    item.id.clone(),
                    CartItem {
                        id: item.id.clone(),
                        name: item.name.clone(),
                        unit_price: item.unit_price,
                        image: item.image.clone(),
                        quantity: item.quantity,
                        added_at,
                    },
                );
            }
        }
    }

    /// 数量为 0 视为删除；不存在的条目忽略
    pub(crate) fn set_quantity(&mut self, item_id: &str, quantity: u32) {
        if quantity == 0 {
            self.remove(item_id);
        } else if let Some(existing) = self.items.get_mut(item_id) {
            existing.quantity = quantity;
        }
    }

    pub(crate) fn remove(&mut self, item_id: &str) {
        // shift_remove 保持其余条目的加入顺序
        self.items.shift_remove(item_id);
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 已下单，等待商家确认
    Placed,
    Preparing,
    OutForDelivery,
    Delivered,
    Cancelled,
}

/// 下单输入
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub items: Vec<CartItem>,
    pub delivery_address: Option<String>,
    pub note: Option<String>,
}

impl OrderDraft {
    /// 以购物车当前内容构造
    pub fn from_cart(cart: &Cart) -> Self {
        Self {
            items: cart.items().cloned().collect(),
            delivery_address: None,
            note: None,
        }
    }

    pub fn with_delivery_address(mut self, address: impl Into<String>) -> Self {
        self.delivery_address = Some(address.into());
        self
    }

    pub fn total(&self) -> u64 {
        self.items.iter().map(CartItem::line_total).fold(0, u64::saturating_add)
    }
}

/// 订单记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// 客户端生成的订单号（UUID v4）
    pub order_id: String,
    pub items: Vec<CartItem>,
    pub total: u64,
    pub status: OrderStatus,
    pub delivery_address: Option<String>,
    pub note: Option<String>,
    /// 下单时间（UTC 毫秒）
    pub placed_at: i64,
}

/// 缓存快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "namespace", content = "value", rename_all = "lowercase")]
pub enum Snapshot {
    User(UserProfile),
    Cart(Cart),
    Orders(Vec<Order>),
}

impl Snapshot {
    pub fn namespace(&self) -> Namespace {
        match self {
            Snapshot::User(_) => Namespace::User,
            Snapshot::Cart(_) => Namespace::Cart,
            Snapshot::Orders(_) => Namespace::Orders,
        }
    }

    /// 命名空间的空快照；`user` 没有空值
    pub fn empty(namespace: Namespace) -> Option<Snapshot> {
        match namespace {
            Namespace::User => None,
            Namespace::Cart => Some(Snapshot::Cart(Cart::default())),
            Namespace::Orders => Some(Snapshot::Orders(Vec::new())),
        }
    }

    pub fn as_cart(&self) -> Option<&Cart> {
        match self {
            Snapshot::Cart(cart) => Some(cart),
            _ => None,
        }
    }

    pub fn as_orders(&self) -> Option<&[Order]> {
        match self {
            Snapshot::Orders(orders) => Some(orders),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserProfile> {
        match self {
            Snapshot::User(profile) => Some(profile),
            _ => None,
        }
    }
}

/// 当前 UTC 毫秒时间戳
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_key_is_deterministic_and_normalized() {
        let a = OwnerKey::from_email("Alice@Example.com").unwrap();
        let b = OwnerKey::from_email("  alice@example.com ").unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.email().as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn owner_key_does_not_collide_on_punctuation() {
        // 旧方案把 '.' 替换成 ','，a.b@x 和 a,b@x 会撞键
        let dotted = OwnerKey::from_email("a.b@x.io").unwrap();
        let comma = OwnerKey::from_email("a,b@x.io").unwrap();
        assert_ne!(dotted, comma);
    }

    #[test]
    fn owner_key_rejects_malformed_input() {
        assert!(OwnerKey::from_email("").is_err());
        assert!(OwnerKey::from_email("no-at-symbol").is_err());
        assert!(OwnerKey::from_email("@domain.com").is_err());
        assert!(OwnerKey::from_email("user@").is_err());
        assert!(OwnerKey::from_raw("XYZ").is_err());
        assert!(OwnerKey::from_raw("abc").is_err());
        assert!(OwnerKey::from_raw("61").is_ok());
    }

    #[test]
    fn namespace_round_trips_through_str() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
        assert!("payments".parse::<Namespace>().is_err());
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let mut cart = Cart::default();
        cart.add(&NewCartItem::new("big", "Big", u64::MAX / 2 + 1).with_quantity(2), 0);
        cart.add(&NewCartItem::new("small", "Small", 10), 0);
        assert_eq!(cart.get("big").unwrap().line_total(), u64::MAX);
        assert_eq!(cart.total(), u64::MAX);
        assert_eq!(OrderDraft::from_cart(&cart).total(), u64::MAX);
    }

    #[test]
    fn cart_keeps_insertion_order_after_removal() {
        let mut cart = Cart::new();
        cart.add(&NewCartItem::new("a", "A", 100), 1);
        cart.add(&NewCartItem::new("b", "B", 200), 2);
        cart.add(&NewCartItem::new("c", "C", 300), 3);
        cart.remove("b");
        let ids: Vec<_> = cart.items().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(cart.total(), 400);
    }

    #[test]
    fn snapshot_serializes_with_namespace_tag() {
        let snapshot = Snapshot::Orders(Vec::new());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["namespace"], "orders");
        let back: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
