//! Wire-level command and reply payloads.
//!
//! JSON renditions of the protobuf-defined structures exchanged over the
//! broker. The nested purchase shape deliberately omits ids: the single
//! `purchase_id` keys the whole saga, and decoding rebuilds the order and
//! payment ids from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Order, Payment, Purchase, PurchasedItem};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePurchasedItem {
    #[serde(rename = "product_id")]
    pub product_id: u64,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireOrder {
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    #[serde(rename = "purchased_items")]
    pub purchased_items: Vec<WirePurchasedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePayment {
    #[serde(rename = "currency_code")]
    pub currency_code: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WirePurchase {
    pub order: WireOrder,
    pub payment: WirePayment,
}

/// Forward command carrying the full purchase payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePurchaseCmd {
    #[serde(rename = "purchase_id")]
    pub purchase_id: u64,
    pub purchase: WirePurchase,
    pub timestamp: DateTime<Utc>,
}

/// Compensation command; the payload is small because rollback only needs
/// the idempotency key and the customer for progress events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackCmd {
    #[serde(rename = "purchase_id")]
    pub purchase_id: u64,
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// Reply to a forward command. Carries the purchase back so the
/// orchestrator stays stateless between messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatePurchaseResponse {
    #[serde(rename = "purchase_id")]
    pub purchase_id: u64,
    pub purchase: WirePurchase,
    pub success: bool,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Reply to a compensation command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackResponse {
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    #[serde(rename = "purchase_id")]
    pub purchase_id: u64,
    pub success: bool,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Purchase> for WirePurchase {
    fn from(purchase: &Purchase) -> Self {
        Self {
            order: WireOrder {
                customer_id: purchase.order.customer_id,
                purchased_items: purchase
                    .order
                    .purchased_items
                    .iter()
                    .map(|item| WirePurchasedItem {
                        product_id: item.product_id,
                        amount: item.amount,
                    })
                    .collect(),
            },
            payment: WirePayment {
                currency_code: purchase.payment.currency_code.clone(),
                amount: purchase.payment.amount,
            },
        }
    }
}

impl CreatePurchaseCmd {
    pub fn from_purchase(purchase: &Purchase) -> Self {
        Self {
            purchase_id: purchase.id,
            purchase: WirePurchase::from(purchase),
            timestamp: Utc::now(),
        }
    }

    /// Rebuilds the domain purchase, restoring the shared id on the order
    /// and payment.
    pub fn into_purchase(self) -> Purchase {
        wire_to_purchase(self.purchase_id, self.purchase)
    }
}

impl RollbackCmd {
    pub fn new(purchase_id: u64, customer_id: u64) -> Self {
        Self {
            purchase_id,
            customer_id,
            timestamp: Utc::now(),
        }
    }
}

impl CreatePurchaseResponse {
    pub fn ok(purchase: &Purchase) -> Self {
        Self {
            purchase_id: purchase.id,
            purchase: WirePurchase::from(purchase),
            success: true,
            error: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn err(purchase: &Purchase, error: impl Into<String>) -> Self {
        Self {
            purchase_id: purchase.id,
            purchase: WirePurchase::from(purchase),
            success: false,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn into_purchase(self) -> Purchase {
        wire_to_purchase(self.purchase_id, self.purchase)
    }
}

impl RollbackResponse {
    pub fn ok(customer_id: u64, purchase_id: u64) -> Self {
        Self {
            customer_id,
            purchase_id,
            success: true,
            error: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn err(customer_id: u64, purchase_id: u64, error: impl Into<String>) -> Self {
        Self {
            customer_id,
            purchase_id,
            success: false,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

fn wire_to_purchase(purchase_id: u64, wire: WirePurchase) -> Purchase {
    let customer_id = wire.order.customer_id;
    let mut purchase = Purchase::new(
        Order {
            id: 0,
            customer_id,
            purchased_items: wire
                .order
                .purchased_items
                .into_iter()
                .map(|item| PurchasedItem {
                    product_id: item.product_id,
                    amount: item.amount,
                })
                .collect(),
        },
        Payment {
            id: 0,
            customer_id,
            currency_code: wire.payment.currency_code,
            amount: wire.payment.amount,
        },
    );
    purchase.assign_id(purchase_id);
    purchase
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_purchase() -> Purchase {
        let mut purchase = Purchase::new(
            Order {
                id: 0,
                customer_id: 42,
                purchased_items: vec![PurchasedItem {
                    product_id: 7,
                    amount: 2,
                }],
            },
            Payment {
                id: 0,
                customer_id: 42,
                currency_code: "USD".to_string(),
                amount: 20,
            },
        );
        purchase.assign_id(99);
        purchase
    }

    #[test]
    fn test_cmd_roundtrip_restores_shared_ids() {
        let purchase = sample_purchase();
        let cmd = CreatePurchaseCmd::from_purchase(&purchase);
        let json = serde_json::to_vec(&cmd).unwrap();
        let decoded: CreatePurchaseCmd = serde_json::from_slice(&json).unwrap();
        let back = decoded.into_purchase();
        assert_eq!(back, purchase);
        assert_eq!(back.order.id, 99);
        assert_eq!(back.payment.id, 99);
    }

    #[test]
    fn test_failure_response_keeps_error_text() {
        let purchase = sample_purchase();
        let resp = CreatePurchaseResponse::err(&purchase, "insufficient inventory");
        assert!(!resp.success);
        assert_eq!(resp.error, "insufficient inventory");
        let json = serde_json::to_string(&resp).unwrap();
        let back: CreatePurchaseResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, "insufficient inventory");
    }

    #[test]
    fn test_rollback_cmd_fields() {
        let cmd = RollbackCmd::new(99, 42);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["purchase_id"], 99);
        assert_eq!(json["customer_id"], 42);
    }
}
