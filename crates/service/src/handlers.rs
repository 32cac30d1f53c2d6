//! Router handlers bridging broker messages and the services.
//!
//! Forward handlers decode a `CreatePurchaseCmd`, run the store operation,
//! and reply with `success=false` plus a stable error string on business
//! failures; transient failures return `Err` so the router redelivers.
//! Rollback handlers do the same over `RollbackCmd`. Every handler
//! extracts the incoming traceparent and tags its reply.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{Message, MessageHandler, TraceParent};
use model::topic;
use model::wire::{CreatePurchaseCmd, CreatePurchaseResponse, RollbackCmd, RollbackResponse};
use tracing::{error, info_span, Instrument};

use crate::{OrchestratorService, SagaOrderService, SagaPaymentService, SagaProductService};

fn reply_with_tag(
    payload: &impl serde::Serialize,
    tag: &str,
    incoming: &Message,
) -> anyhow::Result<Vec<Message>> {
    let mut reply = Message::new(serde_json::to_vec(payload)?);
    reply.set_handler_tag(tag);
    if let Some(correlation_id) = incoming.correlation_id() {
        reply.set_correlation_id(correlation_id);
    }
    if let Some(parent) = incoming.traceparent() {
        reply.set_traceparent(&parent.child());
    }
    Ok(vec![reply])
}

fn span_trace_id(parent: &Option<TraceParent>) -> String {
    parent
        .as_ref()
        .map(|p| p.trace_id.clone())
        .unwrap_or_default()
}

/// Forward step 1: reserve inventory.
pub struct UpdateProductInventoryHandler {
    svc: Arc<dyn SagaProductService>,
}

impl UpdateProductInventoryHandler {
    pub fn new(svc: Arc<dyn SagaProductService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for UpdateProductInventoryHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!(
            "event.update_product_inventory",
            trace_id = %span_trace_id(&parent)
        );
        async {
            let cmd: CreatePurchaseCmd = serde_json::from_slice(&msg.payload)?;
            let purchase = cmd.into_purchase();
            let reply = match self
                .svc
                .update_product_inventory(purchase.id, &purchase.order.purchased_items)
                .await
            {
                Ok(()) => CreatePurchaseResponse::ok(&purchase),
                Err(e) if e.is_business() => {
                    CreatePurchaseResponse::err(&purchase, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::UPDATE_PRODUCT_INVENTORY_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Compensation of step 1: release inventory.
pub struct RollbackProductInventoryHandler {
    svc: Arc<dyn SagaProductService>,
}

impl RollbackProductInventoryHandler {
    pub fn new(svc: Arc<dyn SagaProductService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for RollbackProductInventoryHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!(
            "event.rollback_product_inventory",
            trace_id = %span_trace_id(&parent)
        );
        async {
            let cmd: RollbackCmd = serde_json::from_slice(&msg.payload)?;
            let reply = match self.svc.rollback_product_inventory(cmd.purchase_id).await {
                Ok(()) => RollbackResponse::ok(cmd.customer_id, cmd.purchase_id),
                Err(e) if e.is_business() => {
                    RollbackResponse::err(cmd.customer_id, cmd.purchase_id, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::ROLLBACK_PRODUCT_INVENTORY_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Forward step 2: create the order.
pub struct CreateOrderHandler {
    svc: Arc<dyn SagaOrderService>,
}

impl CreateOrderHandler {
    pub fn new(svc: Arc<dyn SagaOrderService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for CreateOrderHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!("event.create_order", trace_id = %span_trace_id(&parent));
        async {
            let cmd: CreatePurchaseCmd = serde_json::from_slice(&msg.payload)?;
            let purchase = cmd.into_purchase();
            let reply = match self.svc.create_order(&purchase.order).await {
                Ok(()) => CreatePurchaseResponse::ok(&purchase),
                Err(e) if e.is_business() => {
                    CreatePurchaseResponse::err(&purchase, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::CREATE_ORDER_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Compensation of step 2: delete the order.
pub struct RollbackOrderHandler {
    svc: Arc<dyn SagaOrderService>,
}

impl RollbackOrderHandler {
    pub fn new(svc: Arc<dyn SagaOrderService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for RollbackOrderHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!("event.rollback_order", trace_id = %span_trace_id(&parent));
        async {
            let cmd: RollbackCmd = serde_json::from_slice(&msg.payload)?;
            let reply = match self.svc.rollback_order(cmd.purchase_id).await {
                Ok(()) => RollbackResponse::ok(cmd.customer_id, cmd.purchase_id),
                Err(e) if e.is_business() => {
                    RollbackResponse::err(cmd.customer_id, cmd.purchase_id, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::ROLLBACK_ORDER_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Forward step 3: create the payment.
pub struct CreatePaymentHandler {
    svc: Arc<dyn SagaPaymentService>,
}

impl CreatePaymentHandler {
    pub fn new(svc: Arc<dyn SagaPaymentService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for CreatePaymentHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!("event.create_payment", trace_id = %span_trace_id(&parent));
        async {
            let cmd: CreatePurchaseCmd = serde_json::from_slice(&msg.payload)?;
            let purchase = cmd.into_purchase();
            let reply = match self.svc.create_payment(&purchase.payment).await {
                Ok(()) => CreatePurchaseResponse::ok(&purchase),
                Err(e) if e.is_business() => {
                    CreatePurchaseResponse::err(&purchase, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::CREATE_PAYMENT_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Compensation of step 3: delete the payment.
pub struct RollbackPaymentHandler {
    svc: Arc<dyn SagaPaymentService>,
}

impl RollbackPaymentHandler {
    pub fn new(svc: Arc<dyn SagaPaymentService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for RollbackPaymentHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let parent = msg.traceparent();
        let span = info_span!("event.rollback_payment", trace_id = %span_trace_id(&parent));
        async {
            let cmd: RollbackCmd = serde_json::from_slice(&msg.payload)?;
            let reply = match self.svc.rollback_payment(cmd.purchase_id).await {
                Ok(()) => RollbackResponse::ok(cmd.customer_id, cmd.purchase_id),
                Err(e) if e.is_business() => {
                    RollbackResponse::err(cmd.customer_id, cmd.purchase_id, e.to_string())
                }
                Err(e) => return Err(e.into()),
            };
            reply_with_tag(&reply, topic::ROLLBACK_PAYMENT_HANDLER, msg)
        }
        .instrument(span)
        .await
    }
}

/// Entry point of a saga: consumes the external purchase topic.
pub struct StartTransactionHandler {
    svc: Arc<dyn OrchestratorService>,
}

impl StartTransactionHandler {
    pub fn new(svc: Arc<dyn OrchestratorService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for StartTransactionHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        let cmd: CreatePurchaseCmd = match serde_json::from_slice(&msg.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                // A malformed purchase request would poison the topic if
                // redelivered; drop it.
                error!("undecodable purchase request skipped: {e}");
                return Ok(Vec::new());
            }
        };
        let correlation_id = msg.correlation_id().unwrap_or(&msg.uuid).to_string();
        let traceparent = msg.traceparent();
        self.svc
            .start_transaction(cmd.into_purchase(), &correlation_id, traceparent)
            .await?;
        Ok(Vec::new())
    }
}

/// Dispatches every participant reply into the state machine.
pub struct ReplyHandler {
    svc: Arc<dyn OrchestratorService>,
}

impl ReplyHandler {
    pub fn new(svc: Arc<dyn OrchestratorService>) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, msg: &Message) -> anyhow::Result<Vec<Message>> {
        self.svc.handle_reply(msg).await?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaProductServiceImpl;
    use model::{Order, Payment, Purchase, PurchasedItem};
    use model::{ProductCatalog, ProductDetail, ProductStatus};
    use repository::{ProductRepository, ReleaseOutcome, RepositoryError};
    use std::sync::Mutex;

    struct ScriptedRepo {
        update_result: Mutex<Option<RepositoryError>>,
    }

    #[async_trait]
    impl ProductRepository for ScriptedRepo {
        async fn check_product(
            &self,
            _product_id: u64,
        ) -> Result<ProductStatus, RepositoryError> {
            Ok(ProductStatus::Exists)
        }

        async fn list_products(
            &self,
            _offset: i64,
            _size: i64,
        ) -> Result<Vec<ProductCatalog>, RepositoryError> {
            Ok(Vec::new())
        }

        async fn get_product_detail(
            &self,
            _product_id: u64,
        ) -> Result<ProductDetail, RepositoryError> {
            Ok(ProductDetail::default())
        }

        async fn get_product_inventory(&self, _product_id: u64) -> Result<i64, RepositoryError> {
            Ok(0)
        }

        async fn create_product(&self, _product: &model::Product) -> Result<(), RepositoryError> {
            Ok(())
        }

        async fn update_product_inventory(
            &self,
            _idempotency_key: u64,
            _purchased_items: &[PurchasedItem],
        ) -> Result<(), RepositoryError> {
            match self.update_result.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn rollback_product_inventory(
            &self,
            _idempotency_key: u64,
        ) -> Result<ReleaseOutcome, RepositoryError> {
            Err(RepositoryError::NotFound)
        }
    }

    fn command_message() -> Message {
        let mut purchase = Purchase::new(
            Order {
                id: 0,
                customer_id: 42,
                purchased_items: vec![PurchasedItem {
                    product_id: 1,
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
        let mut msg = Message::new(
            serde_json::to_vec(&CreatePurchaseCmd::from_purchase(&purchase)).unwrap(),
        );
        msg.set_correlation_id("corr-1");
        msg.set_traceparent(&TraceParent::generate());
        msg
    }

    fn handler_with(update_result: Option<RepositoryError>) -> UpdateProductInventoryHandler {
        let repo = Arc::new(ScriptedRepo {
            update_result: Mutex::new(update_result),
        });
        UpdateProductInventoryHandler::new(Arc::new(SagaProductServiceImpl::new(repo)))
    }

    #[tokio::test]
    async fn test_success_reply_carries_tag_correlation_and_trace() {
        let incoming = command_message();
        let parent = incoming.traceparent().unwrap();
        let replies = handler_with(None).handle(&incoming).await.unwrap();

        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(
            reply.handler_tag(),
            Some(topic::UPDATE_PRODUCT_INVENTORY_HANDLER)
        );
        assert_eq!(reply.correlation_id(), Some("corr-1"));
        assert_eq!(reply.traceparent().unwrap().trace_id, parent.trace_id);

        let resp: CreatePurchaseResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert!(resp.success);
        assert_eq!(resp.purchase_id, 99);
    }

    #[tokio::test]
    async fn test_business_failure_becomes_failed_reply() {
        let replies = handler_with(Some(RepositoryError::InsufficientInventory))
            .handle(&command_message())
            .await
            .unwrap();

        let resp: CreatePurchaseResponse = serde_json::from_slice(&replies[0].payload).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error, "insufficient inventory");
    }

    #[tokio::test]
    async fn test_rollback_of_unreserved_key_replies_success() {
        let repo = Arc::new(ScriptedRepo {
            update_result: Mutex::new(None),
        });
        let handler =
            RollbackProductInventoryHandler::new(Arc::new(SagaProductServiceImpl::new(repo)));
        let mut msg = Message::new(serde_json::to_vec(&RollbackCmd::new(99, 42)).unwrap());
        msg.set_correlation_id("corr-1");

        let replies = handler.handle(&msg).await.unwrap();
        let resp: RollbackResponse = serde_json::from_slice(&replies[0].payload).unwrap();
        assert!(resp.success);
        assert_eq!(resp.purchase_id, 99);
        assert_eq!(resp.customer_id, 42);
    }
}
