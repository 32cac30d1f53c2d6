//! # Data Repository Layer
//!
//! Repository traits and PostgreSQL implementations for the three
//! participant stores: products (with the reservation idempotency log),
//! orders, and payments. Each store is exclusively owned by one service;
//! cross-service reads never touch a foreign table.

use async_trait::async_trait;
use deadpool_postgres::{Pool, PoolError};
use model::{
    IdempotencyEntry, Order, Payment, Product, ProductCatalog, ProductDetail, ProductStatus,
    PurchasedItem,
};
use thiserror::Error;
use tokio_postgres::IsolationLevel;

/// Upper bound on a single listing page.
const MAX_PAGE_SIZE: i64 = 500;

/// # RepositoryError
///
/// Error types that can occur during repository operations. Business
/// failures (`InsufficientInventory`, `DuplicateReservation`, `NotFound`)
/// are distinct from storage errors so the saga layer can compensate
/// instead of retrying.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No result found.
    #[error("not found")]
    NotFound,
    /// A product row has fewer units than the reservation asks for.
    #[error("insufficient inventory")]
    InsufficientInventory,
    /// The idempotency key has already committed a reservation.
    #[error("duplicate reservation")]
    DuplicateReservation,
}

/// Outcome of releasing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Inventory restored; the entries now flagged `rolled_back`.
    RolledBack(Vec<IdempotencyEntry>),
    /// The key was already compensated; nothing changed.
    AlreadyRolledBack,
}

/// # ProductRepository
///
/// Store interface of the product participant: catalog reads plus the
/// row-locked reserve/release pair driven by the saga.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Cheap existence probe by product id.
    async fn check_product(&self, product_id: u64) -> Result<ProductStatus, RepositoryError>;

    /// Lists catalog projections; `offset` is clamped to ≥ 0 and `size`
    /// to `[0, 500]`.
    async fn list_products(
        &self,
        offset: i64,
        size: i64,
    ) -> Result<Vec<ProductCatalog>, RepositoryError>;

    /// Descriptive fields of one product.
    async fn get_product_detail(&self, product_id: u64)
        -> Result<ProductDetail, RepositoryError>;

    /// Live inventory of one product.
    async fn get_product_inventory(&self, product_id: u64) -> Result<i64, RepositoryError>;

    async fn create_product(&self, product: &Product) -> Result<(), RepositoryError>;

    /// Reserves inventory under `idempotency_key` in one read-committed
    /// transaction. Rows are locked in ascending `product_id` order; this
    /// total order on lock acquisition is what rules out deadlock between
    /// concurrent reservations.
    async fn update_product_inventory(
        &self,
        idempotency_key: u64,
        purchased_items: &[PurchasedItem],
    ) -> Result<(), RepositoryError>;

    /// Restores inventory reserved under `idempotency_key` and flags the
    /// entries `rolled_back`. Safe to call repeatedly.
    async fn rollback_product_inventory(
        &self,
        idempotency_key: u64,
    ) -> Result<ReleaseOutcome, RepositoryError>;
}

/// # OrderRepository
///
/// Keyed order store; one row per purchased item under the shared id.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn get_order(&self, order_id: u64) -> Result<Order, RepositoryError>;
    async fn exist_order(&self, order_id: u64) -> Result<bool, RepositoryError>;
    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError>;
    /// Unconditional hard delete; removing a missing order is not an error.
    async fn delete_order(&self, order_id: u64) -> Result<(), RepositoryError>;
}

/// # PaymentRepository
///
/// Keyed payment store.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn get_payment(&self, payment_id: u64) -> Result<Payment, RepositoryError>;
    async fn exist_payment(&self, payment_id: u64) -> Result<bool, RepositoryError>;
    async fn create_payment(&self, payment: &Payment) -> Result<(), RepositoryError>;
    /// Unconditional hard delete; removing a missing payment is not an error.
    async fn delete_payment(&self, payment_id: u64) -> Result<(), RepositoryError>;
}

fn clamp_page(offset: i64, size: i64) -> (i64, i64) {
    (offset.max(0), size.clamp(0, MAX_PAGE_SIZE))
}

/// PostgreSQL implementation of the ProductRepository trait.
pub struct PgProductRepository {
    pool: Pool,
}

impl PgProductRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductRepository for PgProductRepository {
    async fn check_product(&self, product_id: u64) -> Result<ProductStatus, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM products WHERE id = $1",
                &[&(product_id as i64)],
            )
            .await?;
        Ok(if row.is_some() {
            ProductStatus::Exists
        } else {
            ProductStatus::NotExists
        })
    }

    async fn list_products(
        &self,
        offset: i64,
        size: i64,
    ) -> Result<Vec<ProductCatalog>, RepositoryError> {
        let (offset, size) = clamp_page(offset, size);
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT id, name, inventory, price
                FROM products ORDER BY id OFFSET $1 LIMIT $2
                "#,
                &[&offset, &size],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ProductCatalog {
                id: row.get::<_, i64>("id") as u64,
                name: row.get("name"),
                inventory: row.get("inventory"),
                price: row.get("price"),
            })
            .collect())
    }

    async fn get_product_detail(
        &self,
        product_id: u64,
    ) -> Result<ProductDetail, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT name, description, brand_name, price FROM products WHERE id = $1",
                &[&(product_id as i64)],
            )
            .await?;
        match row {
            Some(row) => Ok(ProductDetail {
                name: row.get("name"),
                description: row.get("description"),
                brand_name: row.get("brand_name"),
                price: row.get("price"),
            }),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_product_inventory(&self, product_id: u64) -> Result<i64, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT inventory FROM products WHERE id = $1",
                &[&(product_id as i64)],
            )
            .await?;
        match row {
            Some(row) => Ok(row.get("inventory")),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn create_product(&self, product: &Product) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO products (id, name, description, brand_name, inventory, price)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                &[
                    &(product.id as i64),
                    &product.detail.name,
                    &product.detail.description,
                    &product.detail.brand_name,
                    &product.inventory,
                    &product.detail.price,
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_product_inventory(
        &self,
        idempotency_key: u64,
        purchased_items: &[PurchasedItem],
    ) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        // Dropping the transaction on any early return rolls it back.
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::ReadCommitted)
            .start()
            .await?;

        let existing = tx
            .query_opt(
                "SELECT 1 FROM idempotencies WHERE id = $1 LIMIT 1",
                &[&(idempotency_key as i64)],
            )
            .await?;
        if existing.is_some() {
            return Err(RepositoryError::DuplicateReservation);
        }

        // Lock-order invariant: ascending product_id.
        let mut items: Vec<PurchasedItem> = purchased_items.to_vec();
        items.sort_by_key(|item| item.product_id);

        for item in &items {
            let row = tx
                .query_opt(
                    "SELECT inventory FROM products WHERE id = $1 FOR UPDATE",
                    &[&(item.product_id as i64)],
                )
                .await?;
            let inventory: i64 = match row {
                Some(row) => row.get("inventory"),
                None => return Err(RepositoryError::NotFound),
            };
            if inventory < item.amount {
                return Err(RepositoryError::InsufficientInventory);
            }
            tx.execute(
                "UPDATE products SET inventory = inventory - $2, updated_at = now() WHERE id = $1",
                &[&(item.product_id as i64), &item.amount],
            )
            .await?;
            tx.execute(
                r#"
                INSERT INTO idempotencies (id, product_id, amount, rolled_back)
                VALUES ($1, $2, $3, FALSE)
                "#,
                &[
                    &(idempotency_key as i64),
                    &(item.product_id as i64),
                    &item.amount,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn rollback_product_inventory(
        &self,
        idempotency_key: u64,
    ) -> Result<ReleaseOutcome, RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::ReadCommitted)
            .start()
            .await?;

        let rows = tx
            .query(
                r#"
                SELECT product_id, amount, rolled_back
                FROM idempotencies WHERE id = $1 ORDER BY product_id ASC
                "#,
                &[&(idempotency_key as i64)],
            )
            .await?;
        if rows.is_empty() {
            return Err(RepositoryError::NotFound);
        }
        if rows[0].get::<_, bool>("rolled_back") {
            return Ok(ReleaseOutcome::AlreadyRolledBack);
        }

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let product_id: i64 = row.get("product_id");
            let amount: i64 = row.get("amount");
            tx.query_opt(
                "SELECT inventory FROM products WHERE id = $1 FOR UPDATE",
                &[&product_id],
            )
            .await?;
            tx.execute(
                "UPDATE products SET inventory = inventory + $2, updated_at = now() WHERE id = $1",
                &[&product_id, &amount],
            )
            .await?;
            entries.push(IdempotencyEntry {
                key: idempotency_key,
                product_id: product_id as u64,
                amount,
                rolled_back: true,
            });
        }
        tx.execute(
            "UPDATE idempotencies SET rolled_back = TRUE WHERE id = $1",
            &[&(idempotency_key as i64)],
        )
        .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::RolledBack(entries))
    }
}

/// PostgreSQL implementation of the OrderRepository trait.
pub struct PgOrderRepository {
    pool: Pool,
}

impl PgOrderRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn get_order(&self, order_id: u64) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT product_id, amount, customer_id
                FROM orders WHERE id = $1 ORDER BY product_id
                "#,
                &[&(order_id as i64)],
            )
            .await?;
        if rows.is_empty() {
            return Err(RepositoryError::NotFound);
        }
        let customer_id: i64 = rows[0].get("customer_id");
        Ok(Order {
            id: order_id,
            customer_id: customer_id as u64,
            purchased_items: rows
                .into_iter()
                .map(|row| PurchasedItem {
                    product_id: row.get::<_, i64>("product_id") as u64,
                    amount: row.get("amount"),
                })
                .collect(),
        })
    }

    async fn exist_order(&self, order_id: u64) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM orders WHERE id = $1 LIMIT 1",
                &[&(order_id as i64)],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        // ON CONFLICT keeps re-delivery of the same purchase id safe.
        let query = r#"
            INSERT INTO orders (id, product_id, amount, customer_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id, product_id) DO NOTHING
        "#;
        for item in &order.purchased_items {
            tx.execute(
                query,
                &[
                    &(order.id as i64),
                    &(item.product_id as i64),
                    &item.amount,
                    &(order.customer_id as i64),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_order(&self, order_id: u64) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM orders WHERE id = $1", &[&(order_id as i64)])
            .await?;
        Ok(())
    }
}

/// PostgreSQL implementation of the PaymentRepository trait.
pub struct PgPaymentRepository {
    pool: Pool,
}

impl PgPaymentRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn get_payment(&self, payment_id: u64) -> Result<Payment, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT customer_id, currency_code, amount FROM payments WHERE id = $1",
                &[&(payment_id as i64)],
            )
            .await?;
        match row {
            Some(row) => Ok(Payment {
                id: payment_id,
                customer_id: row.get::<_, i64>("customer_id") as u64,
                currency_code: row.get("currency_code"),
                amount: row.get("amount"),
            }),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn exist_payment(&self, payment_id: u64) -> Result<bool, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM payments WHERE id = $1",
                &[&(payment_id as i64)],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn create_payment(&self, payment: &Payment) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO payments (id, customer_id, currency_code, amount)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
                &[
                    &(payment.id as i64),
                    &(payment.customer_id as i64),
                    &payment.currency_code,
                    &payment.amount,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_payment(&self, payment_id: u64) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM payments WHERE id = $1", &[&(payment_id as i64)])
            .await?;
        Ok(())
    }
}
