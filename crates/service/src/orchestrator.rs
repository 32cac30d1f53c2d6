//! Saga orchestrator: the forward-and-compensate state machine.
//!
//! The orchestrator keeps no saga state in memory. Each reply carries the
//! full purchase (forward replies) or the `{customer_id, purchase_id}`
//! pair (rollback replies), so any orchestrator instance can drive any
//! saga and a crash loses nothing that the broker does not redeliver.

use std::sync::Arc;

use async_trait::async_trait;
use broker::{Message, Publisher, TraceParent};
use model::event::{PurchaseResult, PurchaseStatus, PurchaseStep};
use model::topic;
use model::wire::{CreatePurchaseCmd, CreatePurchaseResponse, RollbackCmd, RollbackResponse};
use model::Purchase;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::{IdGenerator, ServiceError};

/// The closed set of reply kinds, decoded once from the handler tag.
#[derive(Debug)]
pub enum Reply {
    UpdateInventory(CreatePurchaseResponse),
    RollbackInventory(RollbackResponse),
    CreateOrder(CreatePurchaseResponse),
    RollbackOrder(RollbackResponse),
    CreatePayment(CreatePurchaseResponse),
    RollbackPayment(RollbackResponse),
}

impl Reply {
    pub fn decode(msg: &Message) -> Result<Self, ServiceError> {
        let tag = msg.handler_tag().unwrap_or_default();
        match tag {
            topic::UPDATE_PRODUCT_INVENTORY_HANDLER => Ok(Reply::UpdateInventory(
                serde_json::from_slice(&msg.payload)?,
            )),
            topic::ROLLBACK_PRODUCT_INVENTORY_HANDLER => Ok(Reply::RollbackInventory(
                serde_json::from_slice(&msg.payload)?,
            )),
            topic::CREATE_ORDER_HANDLER => {
                Ok(Reply::CreateOrder(serde_json::from_slice(&msg.payload)?))
            }
            topic::ROLLBACK_ORDER_HANDLER => {
                Ok(Reply::RollbackOrder(serde_json::from_slice(&msg.payload)?))
            }
            topic::CREATE_PAYMENT_HANDLER => {
                Ok(Reply::CreatePayment(serde_json::from_slice(&msg.payload)?))
            }
            topic::ROLLBACK_PAYMENT_HANDLER => Ok(Reply::RollbackPayment(
                serde_json::from_slice(&msg.payload)?,
            )),
            other => Err(ServiceError::UnknownHandler(other.to_string())),
        }
    }
}

/// OrchestratorService interface.
#[async_trait]
pub trait OrchestratorService: Send + Sync {
    /// Starts a saga: assigns the shared purchase id and publishes the
    /// first step command.
    async fn start_transaction(
        &self,
        purchase: Purchase,
        correlation_id: &str,
        traceparent: Option<TraceParent>,
    ) -> Result<(), ServiceError>;

    /// Advances or unwinds a saga from one participant reply.
    async fn handle_reply(&self, msg: &Message) -> Result<(), ServiceError>;
}

/// OrchestratorService implementation over the two publishers.
pub struct OrchestratorServiceImpl {
    idgen: Arc<dyn IdGenerator>,
    /// Step and rollback commands: durable at-least-once broker.
    tx_publisher: Arc<dyn Publisher>,
    /// Progress events: append-only result stream, fire-and-forget.
    result_publisher: Arc<dyn Publisher>,
}

impl OrchestratorServiceImpl {
    pub fn new(
        idgen: Arc<dyn IdGenerator>,
        tx_publisher: Arc<dyn Publisher>,
        result_publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            idgen,
            tx_publisher,
            result_publisher,
        }
    }

    fn command_message<T: Serialize>(
        &self,
        cmd: &T,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<Message, ServiceError> {
        let mut msg = Message::new(serde_json::to_vec(cmd)?);
        msg.set_correlation_id(correlation_id);
        let span = match traceparent {
            Some(parent) => parent.child(),
            None => TraceParent::generate(),
        };
        msg.set_traceparent(&span);
        Ok(msg)
    }

    /// Publishes a progress event. Failures are logged and swallowed:
    /// progress events are observability, not control flow.
    async fn emit(
        &self,
        customer_id: u64,
        purchase_id: u64,
        step: PurchaseStep,
        status: PurchaseStatus,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) {
        let result = PurchaseResult::new(customer_id, purchase_id, step, status);
        let msg = match self.command_message(&result, correlation_id, traceparent) {
            Ok(msg) => msg,
            Err(e) => {
                error!("encode purchase result: {e}");
                return;
            }
        };
        if let Err(e) = self
            .result_publisher
            .publish(topic::PURCHASE_RESULT, msg)
            .await
        {
            error!("publish purchase result: {e}");
        }
    }

    async fn publish_command<T: Serialize>(
        &self,
        topic: &str,
        cmd: &T,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        let msg = self.command_message(cmd, correlation_id, traceparent)?;
        self.tx_publisher.publish(topic, msg).await?;
        Ok(())
    }

    async fn create_order(
        &self,
        purchase: &Purchase,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        info!("create order {}", purchase.id);
        let customer_id = purchase.order.customer_id;
        self.emit(
            customer_id,
            purchase.id,
            PurchaseStep::UpdateProductInventory,
            PurchaseStatus::Success,
            correlation_id,
            traceparent,
        )
        .await;
        self.emit(
            customer_id,
            purchase.id,
            PurchaseStep::CreateOrder,
            PurchaseStatus::Execute,
            correlation_id,
            traceparent,
        )
        .await;
        self.publish_command(
            topic::CREATE_ORDER,
            &CreatePurchaseCmd::from_purchase(purchase),
            correlation_id,
            traceparent,
        )
        .await
    }

    async fn create_payment(
        &self,
        purchase: &Purchase,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        info!("create payment {}", purchase.id);
        let customer_id = purchase.order.customer_id;
        self.emit(
            customer_id,
            purchase.id,
            PurchaseStep::CreateOrder,
            PurchaseStatus::Success,
            correlation_id,
            traceparent,
        )
        .await;
        self.emit(
            customer_id,
            purchase.id,
            PurchaseStep::CreatePayment,
            PurchaseStatus::Execute,
            correlation_id,
            traceparent,
        )
        .await;
        self.publish_command(
            topic::CREATE_PAYMENT,
            &CreatePurchaseCmd::from_purchase(purchase),
            correlation_id,
            traceparent,
        )
        .await
    }

    async fn rollback_inventory(
        &self,
        customer_id: u64,
        purchase_id: u64,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        info!("rollback product inventory {purchase_id}");
        self.publish_command(
            topic::ROLLBACK_PRODUCT_INVENTORY,
            &RollbackCmd::new(purchase_id, customer_id),
            correlation_id,
            traceparent,
        )
        .await
    }

    async fn rollback_order(
        &self,
        customer_id: u64,
        purchase_id: u64,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        info!("rollback order {purchase_id}");
        self.publish_command(
            topic::ROLLBACK_ORDER,
            &RollbackCmd::new(purchase_id, customer_id),
            correlation_id,
            traceparent,
        )
        .await
    }

    async fn rollback_payment(
        &self,
        customer_id: u64,
        purchase_id: u64,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        info!("rollback payment {purchase_id}");
        self.publish_command(
            topic::ROLLBACK_PAYMENT,
            &RollbackCmd::new(purchase_id, customer_id),
            correlation_id,
            traceparent,
        )
        .await
    }

    /// Confirms a compensation from its reply: `ROLLBACKED` on success,
    /// `ROLLBACK_FAIL` otherwise. The terminal rollback event is emitted
    /// here, on receipt of the reply, never pre-emptively.
    async fn confirm_rollback(
        &self,
        step: PurchaseStep,
        resp: &RollbackResponse,
        correlation_id: &str,
        traceparent: &Option<TraceParent>,
    ) {
        let status = if resp.success {
            PurchaseStatus::Rollbacked
        } else {
            error!("rollback of {step:?} failed for {}: {}", resp.purchase_id, resp.error);
            PurchaseStatus::RollbackFailed
        };
        self.emit(
            resp.customer_id,
            resp.purchase_id,
            step,
            status,
            correlation_id,
            traceparent,
        )
        .await;
    }
}

#[async_trait]
impl OrchestratorService for OrchestratorServiceImpl {
    #[instrument(skip(self, purchase, traceparent))]
    async fn start_transaction(
        &self,
        mut purchase: Purchase,
        correlation_id: &str,
        traceparent: Option<TraceParent>,
    ) -> Result<(), ServiceError> {
        purchase.assign_id(self.idgen.next_id());
        info!("update product inventory {}", purchase.id);
        self.emit(
            purchase.order.customer_id,
            purchase.id,
            PurchaseStep::UpdateProductInventory,
            PurchaseStatus::Execute,
            correlation_id,
            &traceparent,
        )
        .await;
        self.publish_command(
            topic::UPDATE_PRODUCT_INVENTORY,
            &CreatePurchaseCmd::from_purchase(&purchase),
            correlation_id,
            &traceparent,
        )
        .await
    }

    #[instrument(skip(self, msg))]
    async fn handle_reply(&self, msg: &Message) -> Result<(), ServiceError> {
        let correlation_id = msg.correlation_id().unwrap_or_default().to_string();
        let traceparent = msg.traceparent();

        match Reply::decode(msg)? {
            Reply::UpdateInventory(resp) => {
                if resp.success {
                    let purchase = resp.into_purchase();
                    return self
                        .create_order(&purchase, &correlation_id, &traceparent)
                        .await;
                }
                error!("update inventory failed: {}", resp.error);
                let purchase = resp.into_purchase();
                let customer_id = purchase.order.customer_id;
                self.emit(
                    customer_id,
                    purchase.id,
                    PurchaseStep::UpdateProductInventory,
                    PurchaseStatus::Failed,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                self.rollback_inventory(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await
            }
            Reply::RollbackInventory(resp) => {
                self.confirm_rollback(
                    PurchaseStep::UpdateProductInventory,
                    &resp,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                Ok(())
            }
            Reply::CreateOrder(resp) => {
                if resp.success {
                    let purchase = resp.into_purchase();
                    return self
                        .create_payment(&purchase, &correlation_id, &traceparent)
                        .await;
                }
                error!("create order failed: {}", resp.error);
                let purchase = resp.into_purchase();
                let customer_id = purchase.order.customer_id;
                self.emit(
                    customer_id,
                    purchase.id,
                    PurchaseStep::CreateOrder,
                    PurchaseStatus::Failed,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                // Unwind in reverse order; each ROLLBACKED arrives with
                // its own rollback reply.
                self.rollback_order(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await?;
                self.rollback_inventory(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await
            }
            Reply::RollbackOrder(resp) => {
                self.confirm_rollback(
                    PurchaseStep::CreateOrder,
                    &resp,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                Ok(())
            }
            Reply::CreatePayment(resp) => {
                if resp.success {
                    let purchase = resp.into_purchase();
                    self.emit(
                        purchase.order.customer_id,
                        purchase.id,
                        PurchaseStep::CreatePayment,
                        PurchaseStatus::Success,
                        &correlation_id,
                        &traceparent,
                    )
                    .await;
                    return Ok(());
                }
                error!("create payment failed: {}", resp.error);
                let purchase = resp.into_purchase();
                let customer_id = purchase.order.customer_id;
                self.emit(
                    customer_id,
                    purchase.id,
                    PurchaseStep::CreatePayment,
                    PurchaseStatus::Failed,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                self.rollback_payment(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await?;
                self.rollback_order(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await?;
                self.rollback_inventory(customer_id, purchase.id, &correlation_id, &traceparent)
                    .await
            }
            Reply::RollbackPayment(resp) => {
                self.confirm_rollback(
                    PurchaseStep::CreatePayment,
                    &resp,
                    &correlation_id,
                    &traceparent,
                )
                .await;
                Ok(())
            }
        }
    }
}
