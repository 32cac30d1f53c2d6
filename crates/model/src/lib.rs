//! Domain model for the purchase saga.
//!
//! Entities and value objects shared by the orchestrator, the participant
//! services, and the HTTP surface. Wire-level command and reply structures
//! live in [`wire`], the saga progress event in [`event`], and the stable
//! topic/metadata identifiers in [`topic`].

pub mod event;
pub mod topic;
pub mod wire;

use serde::{Deserialize, Serialize};

/// CartItem - a product and amount as placed in a cart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CartItem {
    /// Product identifier
    #[serde(rename = "product_id")]
    pub product_id: u64,
    /// Requested amount, must be positive
    pub amount: i64,
}

/// PurchasedItem - a product and amount committed by a purchase.
///
/// Identical in shape to [`CartItem`]; kept separate because a purchased
/// item has passed validation and is referenced by the idempotency log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchasedItem {
    #[serde(rename = "product_id")]
    pub product_id: u64,
    pub amount: i64,
}

impl From<CartItem> for PurchasedItem {
    fn from(item: CartItem) -> Self {
        Self {
            product_id: item.product_id,
            amount: item.amount,
        }
    }
}

/// ProductDetail - descriptive fields of a product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProductDetail {
    /// Product name
    pub name: String,
    /// Longer description text
    pub description: String,
    /// Brand name
    #[serde(rename = "brand_name")]
    pub brand_name: String,
    /// Unit price
    pub price: i64,
}

/// Product - catalog entity with live inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Product {
    /// Unique product identifier
    pub id: u64,
    /// Descriptive fields
    pub detail: ProductDetail,
    /// Units currently in stock, never negative
    pub inventory: i64,
}

/// ProductCatalog - listing projection of a product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductCatalog {
    pub id: u64,
    pub name: String,
    pub inventory: i64,
    pub price: i64,
}

/// ProductStatus - result of a cheap existence probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProductStatus {
    Exists,
    NotExists,
}

/// Order - one customer's purchased items under a shared purchase id.
///
/// Persisted as one row per item keyed by `(id, product_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    /// Order identifier, equal to the owning purchase id
    pub id: u64,
    /// Customer identifier
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    /// Items in the order, each with a positive amount
    #[serde(rename = "purchased_items")]
    pub purchased_items: Vec<PurchasedItem>,
}

/// DetailedPurchasedItem - purchased item joined with product details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetailedPurchasedItem {
    #[serde(rename = "product_id")]
    pub product_id: u64,
    pub name: String,
    pub description: String,
    #[serde(rename = "brand_name")]
    pub brand_name: String,
    pub price: i64,
    pub amount: i64,
}

/// DetailedOrder - order read model with product details joined in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetailedOrder {
    pub id: u64,
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    #[serde(rename = "purchased_items")]
    pub purchased_items: Vec<DetailedPurchasedItem>,
}

/// Payment - payment record under the shared purchase id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    /// Payment identifier, equal to the owning purchase id
    pub id: u64,
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    /// ISO currency code, e.g. "USD"
    #[serde(rename = "currency_code")]
    pub currency_code: String,
    /// Total amount in minor units
    pub amount: i64,
}

/// IdempotencyEntry - committed inventory reservation record.
///
/// Unique on `(key, product_id)`. Never deleted; `rolled_back` flips to
/// true exactly once when the reservation is compensated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdempotencyEntry {
    /// Idempotency key, equal to the purchase id
    pub key: u64,
    #[serde(rename = "product_id")]
    pub product_id: u64,
    pub amount: i64,
    #[serde(rename = "rolled_back")]
    pub rolled_back: bool,
}

/// Purchase - the value flowing through the saga.
///
/// The purchase id, its order id, and its payment id are one and the same;
/// [`Purchase::assign_id`] is the only way ids are set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Purchase {
    pub id: u64,
    pub order: Order,
    pub payment: Payment,
}

impl Purchase {
    /// Builds a purchase with no id yet; the orchestrator assigns one.
    pub fn new(order: Order, payment: Payment) -> Self {
        Self {
            id: 0,
            order,
            payment,
        }
    }

    /// Stamps `id` onto the purchase, its order, and its payment.
    pub fn assign_id(&mut self, id: u64) {
        self.id = id;
        self.order.id = id;
        self.payment.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_purchase() -> Purchase {
        Purchase::new(
            Order {
                id: 0,
                customer_id: 42,
                purchased_items: vec![
                    PurchasedItem {
                        product_id: 7,
                        amount: 2,
                    },
                    PurchasedItem {
                        product_id: 9,
                        amount: 1,
                    },
                ],
            },
            Payment {
                id: 0,
                customer_id: 42,
                currency_code: "USD".to_string(),
                amount: 1817,
            },
        )
    }

    #[test]
    fn test_assign_id_shares_one_id() {
        let mut purchase = sample_purchase();
        purchase.assign_id(123456789);
        assert_eq!(purchase.id, 123456789);
        assert_eq!(purchase.order.id, purchase.id);
        assert_eq!(purchase.payment.id, purchase.id);
    }

    #[test]
    fn test_deserialize_order_from_json() {
        let json = r#"
        {
            "id": 10,
            "customer_id": 42,
            "purchased_items": [
                { "product_id": 7, "amount": 2 }
            ]
        }
        "#;
        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.id, 10);
        assert_eq!(order.purchased_items.len(), 1);
        assert_eq!(order.purchased_items[0].product_id, 7);
    }

    #[test]
    fn test_purchase_roundtrip() {
        let mut purchase = sample_purchase();
        purchase.assign_id(55);
        let json = serde_json::to_string(&purchase).unwrap();
        let back: Purchase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, purchase);
    }
}
