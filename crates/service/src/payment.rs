//! Payment services: customer-scoped reads and the saga-facing
//! create/rollback pair.

use std::sync::Arc;

use async_trait::async_trait;
use model::Payment;
use repository::PaymentRepository;
use tracing::{error, instrument};

use crate::ServiceError;

/// Read-side payment operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Fails with `Unauthorized` if the record belongs to a different
    /// customer.
    async fn get_payment(
        &self,
        customer_id: u64,
        payment_id: u64,
    ) -> Result<Payment, ServiceError>;
}

/// Saga-facing payment operations.
#[async_trait]
pub trait SagaPaymentService: Send + Sync {
    async fn create_payment(&self, payment: &Payment) -> Result<(), ServiceError>;

    /// Deletes the payment row. A payment that was never created is
    /// removed silently.
    async fn rollback_payment(&self, payment_id: u64) -> Result<(), ServiceError>;
}

pub struct PaymentServiceImpl {
    payment_repo: Arc<dyn PaymentRepository>,
}

impl PaymentServiceImpl {
    pub fn new(payment_repo: Arc<dyn PaymentRepository>) -> Self {
        Self { payment_repo }
    }
}

#[async_trait]
impl PaymentService for PaymentServiceImpl {
    #[instrument(skip(self))]
    async fn get_payment(
        &self,
        customer_id: u64,
        payment_id: u64,
    ) -> Result<Payment, ServiceError> {
        let payment = self.payment_repo.get_payment(payment_id).await?;
        if payment.customer_id != customer_id {
            return Err(ServiceError::Unauthorized);
        }
        Ok(payment)
    }
}

pub struct SagaPaymentServiceImpl {
    payment_repo: Arc<dyn PaymentRepository>,
}

impl SagaPaymentServiceImpl {
    pub fn new(payment_repo: Arc<dyn PaymentRepository>) -> Self {
        Self { payment_repo }
    }
}

#[async_trait]
impl SagaPaymentService for SagaPaymentServiceImpl {
    #[instrument(skip(self, payment), fields(payment_id = payment.id))]
    async fn create_payment(&self, payment: &Payment) -> Result<(), ServiceError> {
        if payment.amount < 0 {
            return Err(ServiceError::InvalidPurchase(
                "payment amount must not be negative".into(),
            ));
        }
        self.payment_repo.create_payment(payment).await.map_err(|e| {
            error!("create payment {}: {e}", payment.id);
            ServiceError::from(e)
        })
    }

    #[instrument(skip(self))]
    async fn rollback_payment(&self, payment_id: u64) -> Result<(), ServiceError> {
        self.payment_repo.delete_payment(payment_id).await.map_err(|e| {
            error!("rollback payment {payment_id}: {e}");
            ServiceError::from(e)
        })
    }
}
