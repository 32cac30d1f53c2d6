//! Product services: catalog reads and the saga-facing inventory pair.

use std::sync::Arc;

use async_trait::async_trait;
use model::{CartItem, Product, ProductCatalog, ProductDetail, ProductStatus, PurchasedItem};
use repository::{ProductRepository, ReleaseOutcome, RepositoryError};
use tracing::{error, instrument};

use crate::{IdGenerator, ServiceError};

/// Per-product probe result of a cart check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductCheck {
    pub product_id: u64,
    pub status: ProductStatus,
}

/// Read-side product operations.
#[async_trait]
pub trait ProductService: Send + Sync {
    async fn check_products(
        &self,
        cart_items: &[CartItem],
    ) -> Result<Vec<ProductCheck>, ServiceError>;

    async fn list_products(
        &self,
        offset: i64,
        size: i64,
    ) -> Result<Vec<ProductCatalog>, ServiceError>;

    async fn get_products(&self, product_ids: &[u64]) -> Result<Vec<Product>, ServiceError>;

    /// Creates a product and returns its generated id.
    async fn create_product(
        &self,
        detail: ProductDetail,
        inventory: i64,
    ) -> Result<u64, ServiceError>;
}

/// Saga-facing inventory operations.
#[async_trait]
pub trait SagaProductService: Send + Sync {
    /// Forward operation of step 1.
    async fn update_product_inventory(
        &self,
        idempotency_key: u64,
        purchased_items: &[PurchasedItem],
    ) -> Result<(), ServiceError>;

    /// Compensation of step 1. Compensating a reservation that never
    /// committed (or was already compensated) succeeds silently.
    async fn rollback_product_inventory(&self, idempotency_key: u64)
        -> Result<(), ServiceError>;
}

/// ProductService over the (cached) product repository.
pub struct ProductServiceImpl {
    product_repo: Arc<dyn ProductRepository>,
    idgen: Arc<dyn IdGenerator>,
}

impl ProductServiceImpl {
    pub fn new(product_repo: Arc<dyn ProductRepository>, idgen: Arc<dyn IdGenerator>) -> Self {
        Self { product_repo, idgen }
    }
}

#[async_trait]
impl ProductService for ProductServiceImpl {
    #[instrument(skip(self, cart_items))]
    async fn check_products(
        &self,
        cart_items: &[CartItem],
    ) -> Result<Vec<ProductCheck>, ServiceError> {
        let mut checks = Vec::with_capacity(cart_items.len());
        for item in cart_items {
            let status = self.product_repo.check_product(item.product_id).await?;
            checks.push(ProductCheck {
                product_id: item.product_id,
                status,
            });
        }
        Ok(checks)
    }

    #[instrument(skip(self))]
    async fn list_products(
        &self,
        offset: i64,
        size: i64,
    ) -> Result<Vec<ProductCatalog>, ServiceError> {
        Ok(self.product_repo.list_products(offset, size).await?)
    }

    #[instrument(skip(self, product_ids))]
    async fn get_products(&self, product_ids: &[u64]) -> Result<Vec<Product>, ServiceError> {
        let mut products = Vec::with_capacity(product_ids.len());
        for &product_id in product_ids {
            let detail = self.product_repo.get_product_detail(product_id).await?;
            let inventory = self.product_repo.get_product_inventory(product_id).await?;
            products.push(Product {
                id: product_id,
                detail,
                inventory,
            });
        }
        Ok(products)
    }

    #[instrument(skip(self, detail))]
    async fn create_product(
        &self,
        detail: ProductDetail,
        inventory: i64,
    ) -> Result<u64, ServiceError> {
        if inventory < 0 {
            return Err(ServiceError::InvalidPurchase(
                "inventory must not be negative".into(),
            ));
        }
        let product = Product {
            id: self.idgen.next_id(),
            detail,
            inventory,
        };
        self.product_repo.create_product(&product).await?;
        Ok(product.id)
    }
}

/// SagaProductService over the (cached) product repository.
pub struct SagaProductServiceImpl {
    product_repo: Arc<dyn ProductRepository>,
}

impl SagaProductServiceImpl {
    pub fn new(product_repo: Arc<dyn ProductRepository>) -> Self {
        Self { product_repo }
    }
}

#[async_trait]
impl SagaProductService for SagaProductServiceImpl {
    #[instrument(skip(self, purchased_items), fields(key = idempotency_key))]
    async fn update_product_inventory(
        &self,
        idempotency_key: u64,
        purchased_items: &[PurchasedItem],
    ) -> Result<(), ServiceError> {
        if purchased_items.is_empty() {
            return Err(ServiceError::InvalidPurchase("no purchased items".into()));
        }
        if purchased_items.iter().any(|item| item.amount <= 0) {
            return Err(ServiceError::InvalidPurchase(
                "item amount must be positive".into(),
            ));
        }
        self.product_repo
            .update_product_inventory(idempotency_key, purchased_items)
            .await
            .map_err(|e| {
                error!("update product inventory {idempotency_key}: {e}");
                ServiceError::from(e)
            })
    }

    #[instrument(skip(self), fields(key = idempotency_key))]
    async fn rollback_product_inventory(
        &self,
        idempotency_key: u64,
    ) -> Result<(), ServiceError> {
        match self.product_repo.rollback_product_inventory(idempotency_key).await {
            // Nothing was reserved (the forward step never committed) or
            // the key was compensated before: both are a successful no-op.
            Ok(ReleaseOutcome::RolledBack(_)) | Ok(ReleaseOutcome::AlreadyRolledBack) => Ok(()),
            Err(RepositoryError::NotFound) => Ok(()),
            Err(e) => {
                error!("rollback product inventory {idempotency_key}: {e}");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::IdempotencyEntry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubProductRepo {
        inventory: Mutex<HashMap<u64, i64>>,
        reservations: Mutex<HashMap<u64, bool>>,
    }

    impl StubProductRepo {
        fn new(pairs: &[(u64, i64)]) -> Self {
            Self {
                inventory: Mutex::new(pairs.iter().copied().collect()),
                reservations: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ProductRepository for StubProductRepo {
        async fn check_product(&self, product_id: u64) -> Result<ProductStatus, RepositoryError> {
            Ok(if self.inventory.lock().unwrap().contains_key(&product_id) {
                ProductStatus::Exists
            } else {
                ProductStatus::NotExists
            })
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

        async fn get_product_inventory(&self, product_id: u64) -> Result<i64, RepositoryError> {
            self.inventory
                .lock()
                .unwrap()
                .get(&product_id)
                .copied()
                .ok_or(RepositoryError::NotFound)
        }

        async fn create_product(&self, product: &Product) -> Result<(), RepositoryError> {
            self.inventory
                .lock()
                .unwrap()
                .insert(product.id, product.inventory);
            Ok(())
        }

        async fn update_product_inventory(
            &self,
            idempotency_key: u64,
            purchased_items: &[PurchasedItem],
        ) -> Result<(), RepositoryError> {
            let mut reservations = self.reservations.lock().unwrap();
            if reservations.contains_key(&idempotency_key) {
                return Err(RepositoryError::DuplicateReservation);
            }
            let inventory = self.inventory.lock().unwrap();
            for item in purchased_items {
                let stock = inventory
                    .get(&item.product_id)
                    .copied()
                    .ok_or(RepositoryError::NotFound)?;
                if stock < item.amount {
                    return Err(RepositoryError::InsufficientInventory);
                }
            }
            reservations.insert(idempotency_key, false);
            Ok(())
        }

        async fn rollback_product_inventory(
            &self,
            idempotency_key: u64,
        ) -> Result<ReleaseOutcome, RepositoryError> {
            let mut reservations = self.reservations.lock().unwrap();
            match reservations.get_mut(&idempotency_key) {
                None => Err(RepositoryError::NotFound),
                Some(rolled_back) if *rolled_back => Ok(ReleaseOutcome::AlreadyRolledBack),
                Some(rolled_back) => {
                    *rolled_back = true;
                    Ok(ReleaseOutcome::RolledBack(vec![IdempotencyEntry {
                        key: idempotency_key,
                        product_id: 1,
                        amount: 1,
                        rolled_back: true,
                    }]))
                }
            }
        }
    }

    fn saga_service(repo: StubProductRepo) -> SagaProductServiceImpl {
        SagaProductServiceImpl::new(Arc::new(repo))
    }

    #[tokio::test]
    async fn test_rollback_of_absent_key_is_silent() {
        let svc = saga_service(StubProductRepo::new(&[(1, 5)]));
        svc.rollback_product_inventory(404).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let svc = saga_service(StubProductRepo::new(&[(1, 5)]));
        svc.update_product_inventory(
            7,
            &[PurchasedItem {
                product_id: 1,
                amount: 1,
            }],
        )
        .await
        .unwrap();
        svc.rollback_product_inventory(7).await.unwrap();
        svc.rollback_product_inventory(7).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_rejects_non_positive_amounts() {
        let svc = saga_service(StubProductRepo::new(&[(1, 5)]));
        let err = svc
            .update_product_inventory(
                7,
                &[PurchasedItem {
                    product_id: 1,
                    amount: 0,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPurchase(_)));
        let err = svc.update_product_inventory(8, &[]).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidPurchase(_)));
    }

    #[tokio::test]
    async fn test_insufficient_inventory_surfaces_as_business_error() {
        let svc = saga_service(StubProductRepo::new(&[(1, 1)]));
        let err = svc
            .update_product_inventory(
                7,
                &[PurchasedItem {
                    product_id: 1,
                    amount: 2,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientInventory));
        assert!(err.is_business());
    }
}
