//! Saga progress events published on the durable result stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Saga step identifiers with their stable wire values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PurchaseStep {
    #[serde(rename = "STEP_UPDATE_PRODUCT_INVENTORY")]
    UpdateProductInventory,
    #[serde(rename = "STEP_CREATE_ORDER")]
    CreateOrder,
    #[serde(rename = "STEP_CREATE_PAYMENT")]
    CreatePayment,
}

/// Saga step statuses with their stable wire values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PurchaseStatus {
    #[serde(rename = "STATUS_EXECUTE")]
    Execute,
    #[serde(rename = "STATUS_SUCCESS")]
    Success,
    #[serde(rename = "STATUS_FAILED")]
    Failed,
    #[serde(rename = "STATUS_ROLLBACKED")]
    Rollbacked,
    #[serde(rename = "STATUS_ROLLBACK_FAIL")]
    RollbackFailed,
}

/// PurchaseResult - customer-visible progress event.
///
/// One event per state transition of a saga instance. Publishing these is
/// fire-and-forget: a failed publish never aborts the saga.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseResult {
    #[serde(rename = "customer_id")]
    pub customer_id: u64,
    #[serde(rename = "purchase_id")]
    pub purchase_id: u64,
    pub step: PurchaseStep,
    pub status: PurchaseStatus,
    pub timestamp: DateTime<Utc>,
}

impl PurchaseResult {
    pub fn new(
        customer_id: u64,
        purchase_id: u64,
        step: PurchaseStep,
        status: PurchaseStatus,
    ) -> Self {
        Self {
            customer_id,
            purchase_id,
            step,
            status,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wire_values() {
        assert_eq!(
            serde_json::to_string(&PurchaseStep::UpdateProductInventory).unwrap(),
            "\"STEP_UPDATE_PRODUCT_INVENTORY\""
        );
        assert_eq!(
            serde_json::to_string(&PurchaseStep::CreateOrder).unwrap(),
            "\"STEP_CREATE_ORDER\""
        );
        assert_eq!(
            serde_json::to_string(&PurchaseStep::CreatePayment).unwrap(),
            "\"STEP_CREATE_PAYMENT\""
        );
    }

    #[test]
    fn test_status_wire_values() {
        assert_eq!(
            serde_json::to_string(&PurchaseStatus::Execute).unwrap(),
            "\"STATUS_EXECUTE\""
        );
        assert_eq!(
            serde_json::to_string(&PurchaseStatus::RollbackFailed).unwrap(),
            "\"STATUS_ROLLBACK_FAIL\""
        );
    }

    #[test]
    fn test_result_roundtrip() {
        let result = PurchaseResult::new(
            1,
            2,
            PurchaseStep::CreateOrder,
            PurchaseStatus::Rollbacked,
        );
        let json = serde_json::to_string(&result).unwrap();
        let back: PurchaseResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
