//! Stable topic names and message metadata keys.
//!
//! These strings are identifiers shared across services and must not change
//! without coordinating every deployed consumer.

/// Subscribed topic for new purchase requests.
pub const PURCHASE: &str = "purchase";
/// Durable result stream for purchase progress events.
pub const PURCHASE_RESULT: &str = "purchase.result";

/// Saga step reply topic shared by all participants.
pub const REPLY: &str = "reply";

/// Forward step 1: reserve product inventory.
pub const UPDATE_PRODUCT_INVENTORY: &str = "product.update.inventory";
/// Compensation of step 1.
pub const ROLLBACK_PRODUCT_INVENTORY: &str = "product.rollback.inventory";
/// Forward step 2: create the order.
pub const CREATE_ORDER: &str = "order.create";
/// Compensation of step 2.
pub const ROLLBACK_ORDER: &str = "order.rollback";
/// Forward step 3: create the payment.
pub const CREATE_PAYMENT: &str = "payment.create";
/// Compensation of step 3.
pub const ROLLBACK_PAYMENT: &str = "payment.rollback";

/// Metadata key carrying the saga correlation id, echoed verbatim.
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Metadata key naming the handler that produced a reply.
pub const HANDLER_KEY: &str = "Handler";
/// Metadata key carrying the W3C traceparent string.
pub const SPAN_CONTEXT_KEY: &str = "span_ctx_key";

/// Reply tag of the inventory update handler.
pub const UPDATE_PRODUCT_INVENTORY_HANDLER: &str = "update_product_inventory_handler";
/// Reply tag of the inventory rollback handler.
pub const ROLLBACK_PRODUCT_INVENTORY_HANDLER: &str = "rollback_product_inventory_handler";
/// Reply tag of the order create handler.
pub const CREATE_ORDER_HANDLER: &str = "create_order_handler";
/// Reply tag of the order rollback handler.
pub const ROLLBACK_ORDER_HANDLER: &str = "rollback_order_handler";
/// Reply tag of the payment create handler.
pub const CREATE_PAYMENT_HANDLER: &str = "create_payment_handler";
/// Reply tag of the payment rollback handler.
pub const ROLLBACK_PAYMENT_HANDLER: &str = "rollback_payment_handler";
