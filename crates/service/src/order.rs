//! Order services: customer-scoped detailed reads and the saga-facing
//! create/rollback pair.

use std::sync::Arc;

use async_trait::async_trait;
use model::{DetailedOrder, DetailedPurchasedItem, Order};
use repository::OrderRepository;
use tracing::{error, instrument};

use crate::rpc::ProductClient;
use crate::ServiceError;

/// Read-side order operations.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Loads the order and joins product details through the product
    /// service RPC. Fails with `Unauthorized` if the record belongs to a
    /// different customer.
    async fn get_detailed_order(
        &self,
        customer_id: u64,
        order_id: u64,
    ) -> Result<DetailedOrder, ServiceError>;
}

/// Saga-facing order operations.
#[async_trait]
pub trait SagaOrderService: Send + Sync {
    async fn create_order(&self, order: &Order) -> Result<(), ServiceError>;

    /// Deletes the order rows. An order that was never created (the saga
    /// aborted earlier) is removed silently.
    async fn rollback_order(&self, order_id: u64) -> Result<(), ServiceError>;
}

pub struct OrderServiceImpl {
    order_repo: Arc<dyn OrderRepository>,
    product_client: Arc<dyn ProductClient>,
}

impl OrderServiceImpl {
    pub fn new(
        order_repo: Arc<dyn OrderRepository>,
        product_client: Arc<dyn ProductClient>,
    ) -> Self {
        Self {
            order_repo,
            product_client,
        }
    }
}

#[async_trait]
impl OrderService for OrderServiceImpl {
    #[instrument(skip(self))]
    async fn get_detailed_order(
        &self,
        customer_id: u64,
        order_id: u64,
    ) -> Result<DetailedOrder, ServiceError> {
        let order = self.order_repo.get_order(order_id).await?;
        if order.customer_id != customer_id {
            return Err(ServiceError::Unauthorized);
        }
        let mut detailed_items = Vec::with_capacity(order.purchased_items.len());
        for item in &order.purchased_items {
            let detail = self.product_client.get_product_detail(item.product_id).await?;
            detailed_items.push(DetailedPurchasedItem {
                product_id: item.product_id,
                name: detail.name,
                description: detail.description,
                brand_name: detail.brand_name,
                price: detail.price,
                amount: item.amount,
            });
        }
        Ok(DetailedOrder {
            id: order.id,
            customer_id: order.customer_id,
            purchased_items: detailed_items,
        })
    }
}

pub struct SagaOrderServiceImpl {
    order_repo: Arc<dyn OrderRepository>,
}

impl SagaOrderServiceImpl {
    pub fn new(order_repo: Arc<dyn OrderRepository>) -> Self {
        Self { order_repo }
    }
}

#[async_trait]
impl SagaOrderService for SagaOrderServiceImpl {
    #[instrument(skip(self, order), fields(order_id = order.id))]
    async fn create_order(&self, order: &Order) -> Result<(), ServiceError> {
        if order.purchased_items.is_empty() {
            return Err(ServiceError::InvalidPurchase("order has no items".into()));
        }
        self.order_repo.create_order(order).await.map_err(|e| {
            error!("create order {}: {e}", order.id);
            ServiceError::from(e)
        })
    }

    #[instrument(skip(self))]
    async fn rollback_order(&self, order_id: u64) -> Result<(), ServiceError> {
        self.order_repo.delete_order(order_id).await.map_err(|e| {
            error!("rollback order {order_id}: {e}");
            ServiceError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{ProductDetail, PurchasedItem};
    use repository::RepositoryError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubOrderRepo {
        orders: Mutex<HashMap<u64, Order>>,
    }

    #[async_trait]
    impl OrderRepository for StubOrderRepo {
        async fn get_order(&self, order_id: u64) -> Result<Order, RepositoryError> {
            self.orders
                .lock()
                .unwrap()
                .get(&order_id)
                .cloned()
                .ok_or(RepositoryError::NotFound)
        }

        async fn exist_order(&self, order_id: u64) -> Result<bool, RepositoryError> {
            Ok(self.orders.lock().unwrap().contains_key(&order_id))
        }

        async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
            self.orders.lock().unwrap().insert(order.id, order.clone());
            Ok(())
        }

        async fn delete_order(&self, order_id: u64) -> Result<(), RepositoryError> {
            self.orders.lock().unwrap().remove(&order_id);
            Ok(())
        }
    }

    struct StubProductClient;

    #[async_trait]
    impl ProductClient for StubProductClient {
        async fn get_product_detail(
            &self,
            product_id: u64,
        ) -> Result<ProductDetail, ServiceError> {
            Ok(ProductDetail {
                name: format!("product-{product_id}"),
                description: "desc".to_string(),
                brand_name: "brand".to_string(),
                price: 10,
            })
        }
    }

    fn sample_order() -> Order {
        Order {
            id: 9,
            customer_id: 42,
            purchased_items: vec![PurchasedItem {
                product_id: 1,
                amount: 2,
            }],
        }
    }

    #[tokio::test]
    async fn test_detailed_order_joins_product_details() {
        let repo = Arc::new(StubOrderRepo::default());
        repo.create_order(&sample_order()).await.unwrap();
        let svc = OrderServiceImpl::new(Arc::clone(&repo) as _, Arc::new(StubProductClient));

        let detailed = svc.get_detailed_order(42, 9).await.unwrap();
        assert_eq!(detailed.id, 9);
        assert_eq!(detailed.purchased_items.len(), 1);
        assert_eq!(detailed.purchased_items[0].name, "product-1");
        assert_eq!(detailed.purchased_items[0].amount, 2);
    }

    #[tokio::test]
    async fn test_foreign_customer_is_unauthorized() {
        let repo = Arc::new(StubOrderRepo::default());
        repo.create_order(&sample_order()).await.unwrap();
        let svc = OrderServiceImpl::new(Arc::clone(&repo) as _, Arc::new(StubProductClient));

        let err = svc.get_detailed_order(1, 9).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn test_rollback_of_missing_order_is_silent() {
        let svc = SagaOrderServiceImpl::new(Arc::new(StubOrderRepo::default()));
        svc.rollback_order(404).await.unwrap();
    }
}
