//! Business logic layer of the purchase saga.
//!
//! Participant services own the forward/compensating operations over their
//! stores; the orchestrator drives the saga state machine from broker
//! replies. Handlers adapting these services to the event router live in
//! [`handlers`].

pub mod handlers;
pub mod idgen;
pub mod order;
pub mod orchestrator;
pub mod payment;
pub mod product;
pub mod rpc;

pub use idgen::{IdGenerator, SnowflakeGenerator};
pub use order::{OrderService, OrderServiceImpl, SagaOrderService, SagaOrderServiceImpl};
pub use orchestrator::{OrchestratorService, OrchestratorServiceImpl, Reply};
pub use payment::{
    PaymentService, PaymentServiceImpl, SagaPaymentService, SagaPaymentServiceImpl,
};
pub use product::{
    ProductService, ProductServiceImpl, SagaProductService, SagaProductServiceImpl,
};
pub use rpc::{CircuitBreaker, ProductClient, ResilientProductClient};

use broker::BrokerError;
use repository::RepositoryError;
use thiserror::Error;

/// The main error type of the service layer.
///
/// Business failures carry stable strings because they travel in reply
/// payloads and the orchestrator reacts to them deterministically.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A product row has fewer units than requested.
    #[error("insufficient inventory")]
    InsufficientInventory,
    /// The idempotency key was already used for a reservation.
    #[error("duplicate reservation")]
    DuplicateReservation,
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// The requesting customer does not own the record.
    #[error("unauthorized")]
    Unauthorized,
    /// The purchase payload is structurally invalid.
    #[error("invalid purchase: {0}")]
    InvalidPurchase(String),
    /// The outbound RPC circuit breaker is open.
    #[error("circuit breaker open")]
    CircuitOpen,
    /// An outbound RPC failed in transport.
    #[error("RPC error: {0}")]
    Rpc(String),
    /// A reply carried a handler tag outside the closed set.
    #[error("unknown handler tag: {0}")]
    UnknownHandler(String),
    /// A storage error that is not a business failure.
    #[error("Repository error: {0}")]
    Repo(RepositoryError),
    /// A broker publish failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    /// Payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound,
            RepositoryError::InsufficientInventory => ServiceError::InsufficientInventory,
            RepositoryError::DuplicateReservation => ServiceError::DuplicateReservation,
            other => ServiceError::Repo(other),
        }
    }
}

impl ServiceError {
    /// Business failures are surfaced in replies with `success=false`;
    /// everything else is transient and leads to redelivery.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ServiceError::InsufficientInventory
                | ServiceError::DuplicateReservation
                | ServiceError::NotFound
                | ServiceError::Unauthorized
                | ServiceError::InvalidPurchase(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_errors_map_from_repository() {
        assert!(matches!(
            ServiceError::from(RepositoryError::InsufficientInventory),
            ServiceError::InsufficientInventory
        ));
        assert!(matches!(
            ServiceError::from(RepositoryError::DuplicateReservation),
            ServiceError::DuplicateReservation
        ));
        assert!(matches!(
            ServiceError::from(RepositoryError::NotFound),
            ServiceError::NotFound
        ));
    }

    #[test]
    fn test_business_classification() {
        assert!(ServiceError::InsufficientInventory.is_business());
        assert!(ServiceError::Unauthorized.is_business());
        assert!(!ServiceError::CircuitOpen.is_business());
        assert!(!ServiceError::UnknownHandler("x".into()).is_business());
    }
}
