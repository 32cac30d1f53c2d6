//! Cache proxies layered over the store repositories.
//!
//! Each proxy implements the same repository trait as the store it fronts,
//! so the service layer cannot tell them apart. Cache failures on the read
//! path are logged and fall through to the store; loader errors propagate
//! untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use model::{Order, Payment, Product, ProductCatalog, ProductDetail, ProductStatus, PurchasedItem};
use repository::{
    OrderRepository, PaymentRepository, ProductRepository, ReleaseOutcome, RepositoryError,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::filter::ExistenceFilter;
use crate::key;
use crate::local::LocalCache;
use crate::redis_cache::{CounterOp, SharedCache};

/// Lock retry cadence: 50 × 100 ms covers one full 5 s mutex lease, so a
/// waiter outlives a crashed holder.
const LOCK_RETRIES: usize = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

struct FilterGate<'a> {
    filter: &'a dyn ExistenceFilter,
    member: u64,
}

/// Tier-1 → filter → tier-2 → single-flight loader.
///
/// Any number of concurrent callers for the same cold key collapse into
/// one loader call; the mutex is distributed because the callers may not
/// share a process.
async fn read_through<T, F, Fut>(
    local: &dyn LocalCache,
    shared: &dyn SharedCache,
    gate: Option<FilterGate<'_>>,
    cache_key: &str,
    loader: F,
) -> Result<T, RepositoryError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    if let Some(json) = local.get(cache_key).await {
        match serde_json::from_str(&json) {
            Ok(val) => return Ok(val),
            Err(e) => warn!(key = cache_key, error = %e, "corrupt local cache entry"),
        }
    }

    if let Some(gate) = gate {
        match gate.filter.might_contain(gate.member).await {
            Ok(false) => return Err(RepositoryError::NotFound),
            Ok(true) => {}
            Err(e) => warn!(key = cache_key, error = %e, "existence filter probe failed"),
        }
    }

    match shared.get(cache_key).await {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(val) => {
                local.set(cache_key, json).await;
                return Ok(val);
            }
            Err(e) => warn!(key = cache_key, error = %e, "corrupt shared cache entry"),
        },
        Ok(None) => {}
        Err(e) => {
            warn!(key = cache_key, error = %e, "shared cache read failed, using store");
            return loader().await;
        }
    }

    let mutex_name = key::mutex(cache_key);
    let token = 'acquire: {
        for _ in 0..LOCK_RETRIES {
            match shared.try_lock(&mutex_name).await {
                Ok(Some(token)) => break 'acquire Some(token),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = cache_key, error = %e, "mutex unavailable, using store");
                    break 'acquire None;
                }
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
            // The current holder may have populated tier-2 meanwhile.
            if let Ok(Some(json)) = shared.get(cache_key).await {
                if let Ok(val) = serde_json::from_str::<T>(&json) {
                    local.set(cache_key, json).await;
                    return Ok(val);
                }
            }
        }
        None
    };

    if token.is_some() {
        // Double-checked read now that the lock is held.
        if let Ok(Some(json)) = shared.get(cache_key).await {
            if let Ok(val) = serde_json::from_str::<T>(&json) {
                local.set(cache_key, json).await;
                if let Some(token) = &token {
                    if let Err(e) = shared.unlock(&mutex_name, token).await {
                        warn!(key = cache_key, error = %e, "mutex unlock failed");
                    }
                }
                return Ok(val);
            }
        }
    }

    let loaded = loader().await;
    if let Ok(val) = &loaded {
        match serde_json::to_string(val) {
            Ok(json) => {
                if let Err(e) = shared.set(cache_key, json.clone()).await {
                    warn!(key = cache_key, error = %e, "shared cache populate failed");
                }
                local.set(cache_key, json).await;
            }
            Err(e) => warn!(key = cache_key, error = %e, "cache serialization failed"),
        }
    }
    if let Some(token) = &token {
        if let Err(e) = shared.unlock(&mutex_name, token).await {
            warn!(key = cache_key, error = %e, "mutex unlock failed");
        }
    }
    loaded
}

/// ProductRepoCache - cache proxy of the product store.
pub struct ProductRepoCache {
    repo: Arc<dyn ProductRepository>,
    local: Arc<dyn LocalCache>,
    shared: Arc<dyn SharedCache>,
    filter: Option<Arc<dyn ExistenceFilter>>,
}

impl ProductRepoCache {
    pub fn new(
        repo: Arc<dyn ProductRepository>,
        local: Arc<dyn LocalCache>,
        shared: Arc<dyn SharedCache>,
        filter: Option<Arc<dyn ExistenceFilter>>,
    ) -> Self {
        Self {
            repo,
            local,
            shared,
            filter,
        }
    }

    fn gate(&self, member: u64) -> Option<FilterGate<'_>> {
        self.filter.as_deref().map(|filter| FilterGate { filter, member })
    }

    async fn apply_counter_ops(&self, ops: Vec<CounterOp>) {
        match self.shared.adjust_counters(&ops).await {
            Ok(results) => {
                for (op, result) in ops.iter().zip(results) {
                    if result.is_none() {
                        debug!(key = %op.key, "counter absent in shared cache, skipped");
                    }
                }
            }
            Err(e) => warn!(error = %e, "pipelined counter adjustment failed"),
        }
        for op in &ops {
            self.local.delete(&op.key).await;
        }
    }
}

#[async_trait]
impl ProductRepository for ProductRepoCache {
    async fn check_product(&self, product_id: u64) -> Result<ProductStatus, RepositoryError> {
        let repo = Arc::clone(&self.repo);
        let result = read_through(
            self.local.as_ref(),
            self.shared.as_ref(),
            self.gate(product_id),
            &key::product_check(product_id),
            move || async move { repo.check_product(product_id).await },
        )
        .await;
        match result {
            // A negative filter answer means the product cannot exist.
            Err(RepositoryError::NotFound) => Ok(ProductStatus::NotExists),
            other => other,
        }
    }

    async fn list_products(
        &self,
        offset: i64,
        size: i64,
    ) -> Result<Vec<ProductCatalog>, RepositoryError> {
        self.repo.list_products(offset, size).await
    }

    async fn get_product_detail(
        &self,
        product_id: u64,
    ) -> Result<ProductDetail, RepositoryError> {
        let repo = Arc::clone(&self.repo);
        read_through(
            self.local.as_ref(),
            self.shared.as_ref(),
            self.gate(product_id),
            &key::product_detail(product_id),
            move || async move { repo.get_product_detail(product_id).await },
        )
        .await
    }

    async fn get_product_inventory(&self, product_id: u64) -> Result<i64, RepositoryError> {
        let repo = Arc::clone(&self.repo);
        read_through(
            self.local.as_ref(),
            self.shared.as_ref(),
            self.gate(product_id),
            &key::product_inventory(product_id),
            move || async move { repo.get_product_inventory(product_id).await },
        )
        .await
    }

    async fn create_product(&self, product: &Product) -> Result<(), RepositoryError> {
        self.repo.create_product(product).await?;
        if let Some(filter) = &self.filter {
            if let Err(e) = filter.insert(product.id).await {
                warn!(product_id = product.id, error = %e, "filter insert failed");
            }
        }
        Ok(())
    }

    async fn update_product_inventory(
        &self,
        idempotency_key: u64,
        purchased_items: &[PurchasedItem],
    ) -> Result<(), RepositoryError> {
        self.repo
            .update_product_inventory(idempotency_key, purchased_items)
            .await?;
        let ops = purchased_items
            .iter()
            .map(|item| CounterOp {
                key: key::product_inventory(item.product_id),
                delta: -item.amount,
            })
            .collect();
        self.apply_counter_ops(ops).await;
        Ok(())
    }

    async fn rollback_product_inventory(
        &self,
        idempotency_key: u64,
    ) -> Result<ReleaseOutcome, RepositoryError> {
        let outcome = self.repo.rollback_product_inventory(idempotency_key).await?;
        if let ReleaseOutcome::RolledBack(entries) = &outcome {
            let ops = entries
                .iter()
                .map(|entry| CounterOp {
                    key: key::product_inventory(entry.product_id),
                    delta: entry.amount,
                })
                .collect();
            self.apply_counter_ops(ops).await;
        }
        Ok(outcome)
    }
}

/// OrderRepoCache - cache proxy of the order store.
pub struct OrderRepoCache {
    repo: Arc<dyn OrderRepository>,
    local: Arc<dyn LocalCache>,
    shared: Arc<dyn SharedCache>,
}

impl OrderRepoCache {
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        local: Arc<dyn LocalCache>,
        shared: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            repo,
            local,
            shared,
        }
    }
}

#[async_trait]
impl OrderRepository for OrderRepoCache {
    async fn get_order(&self, order_id: u64) -> Result<Order, RepositoryError> {
        let repo = Arc::clone(&self.repo);
        read_through(
            self.local.as_ref(),
            self.shared.as_ref(),
            None,
            &key::order(order_id),
            move || async move { repo.get_order(order_id).await },
        )
        .await
    }

    async fn exist_order(&self, order_id: u64) -> Result<bool, RepositoryError> {
        self.repo.exist_order(order_id).await
    }

    async fn create_order(&self, order: &Order) -> Result<(), RepositoryError> {
        self.repo.create_order(order).await?;
        match serde_json::to_string(order) {
            Ok(json) => {
                if let Err(e) = self.shared.set(&key::order(order.id), json).await {
                    warn!(order_id = order.id, error = %e, "order write-through failed");
                }
            }
            Err(e) => warn!(order_id = order.id, error = %e, "order serialization failed"),
        }
        Ok(())
    }

    async fn delete_order(&self, order_id: u64) -> Result<(), RepositoryError> {
        self.repo.delete_order(order_id).await?;
        let cache_key = key::order(order_id);
        if let Err(e) = self.shared.delete(&cache_key).await {
            warn!(order_id, error = %e, "order cache invalidation failed");
        }
        self.local.delete(&cache_key).await;
        Ok(())
    }
}

/// PaymentRepoCache - cache proxy of the payment store.
pub struct PaymentRepoCache {
    repo: Arc<dyn PaymentRepository>,
    local: Arc<dyn LocalCache>,
    shared: Arc<dyn SharedCache>,
}

impl PaymentRepoCache {
    pub fn new(
        repo: Arc<dyn PaymentRepository>,
        local: Arc<dyn LocalCache>,
        shared: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            repo,
            local,
            shared,
        }
    }
}

#[async_trait]
impl PaymentRepository for PaymentRepoCache {
    async fn get_payment(&self, payment_id: u64) -> Result<Payment, RepositoryError> {
        let repo = Arc::clone(&self.repo);
        read_through(
            self.local.as_ref(),
            self.shared.as_ref(),
            None,
            &key::payment(payment_id),
            move || async move { repo.get_payment(payment_id).await },
        )
        .await
    }

    async fn exist_payment(&self, payment_id: u64) -> Result<bool, RepositoryError> {
        self.repo.exist_payment(payment_id).await
    }

    async fn create_payment(&self, payment: &Payment) -> Result<(), RepositoryError> {
        self.repo.create_payment(payment).await?;
        match serde_json::to_string(payment) {
            Ok(json) => {
                if let Err(e) = self.shared.set(&key::payment(payment.id), json).await {
                    warn!(payment_id = payment.id, error = %e, "payment write-through failed");
                }
            }
            Err(e) => {
                warn!(payment_id = payment.id, error = %e, "payment serialization failed")
            }
        }
        Ok(())
    }

    async fn delete_payment(&self, payment_id: u64) -> Result<(), RepositoryError> {
        self.repo.delete_payment(payment_id).await?;
        let cache_key = key::payment(payment_id);
        if let Err(e) = self.shared.delete(&cache_key).await {
            warn!(payment_id, error = %e, "payment cache invalidation failed");
        }
        self.local.delete(&cache_key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;
    use model::IdempotencyEntry;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLocal {
        map: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl LocalCache for FakeLocal {
        async fn get(&self, key: &str) -> Option<String> {
            self.map.lock().unwrap().get(key).cloned()
        }

        async fn set(&self, key: &str, val: String) {
            self.map.lock().unwrap().insert(key.to_string(), val);
        }

        async fn delete(&self, key: &str) {
            self.map.lock().unwrap().remove(key);
        }
    }

    #[derive(Default)]
    struct FakeShared {
        map: Mutex<HashMap<String, String>>,
        locks: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl SharedCache for FakeShared {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            Ok(self.map.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, val: String) -> Result<(), CacheError> {
            self.map.lock().unwrap().insert(key.to_string(), val);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.map.lock().unwrap().remove(key);
            Ok(())
        }

        async fn adjust_counters(
            &self,
            ops: &[CounterOp],
        ) -> Result<Vec<Option<i64>>, CacheError> {
            let mut map = self.map.lock().unwrap();
            let mut results = Vec::with_capacity(ops.len());
            for op in ops {
                match map.get_mut(&op.key) {
                    Some(val) => {
                        let current: i64 = val.parse().unwrap();
                        let next = current + op.delta;
                        *val = next.to_string();
                        results.push(Some(next));
                    }
                    None => results.push(None),
                }
            }
            Ok(results)
        }

        async fn try_lock(&self, name: &str) -> Result<Option<String>, CacheError> {
            let mut locks = self.locks.lock().unwrap();
            if locks.insert(name.to_string()) {
                Ok(Some("token".to_string()))
            } else {
                Ok(None)
            }
        }

        async fn unlock(&self, name: &str, _token: &str) -> Result<(), CacheError> {
            self.locks.lock().unwrap().remove(name);
            Ok(())
        }
    }

    struct FakeFilter {
        members: Mutex<HashSet<u64>>,
        deletable: bool,
    }

    impl FakeFilter {
        fn with_members(members: &[u64], deletable: bool) -> Self {
            Self {
                members: Mutex::new(members.iter().copied().collect()),
                deletable,
            }
        }
    }

    #[async_trait]
    impl ExistenceFilter for FakeFilter {
        async fn init(&self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn might_contain(&self, member: u64) -> Result<bool, CacheError> {
            Ok(self.members.lock().unwrap().contains(&member))
        }

        async fn insert(&self, member: u64) -> Result<(), CacheError> {
            self.members.lock().unwrap().insert(member);
            Ok(())
        }

        async fn remove(&self, member: u64) -> Result<(), CacheError> {
            if self.deletable {
                self.members.lock().unwrap().remove(&member);
            }
            Ok(())
        }
    }

    /// In-memory product store with the same reserve/release semantics as
    /// the Postgres implementation.
    struct FakeProductRepo {
        inventory: Mutex<HashMap<u64, i64>>,
        reservations: Mutex<HashMap<u64, Vec<IdempotencyEntry>>>,
        loads: AtomicUsize,
        load_delay: Duration,
    }

    impl FakeProductRepo {
        fn with_inventory(pairs: &[(u64, i64)]) -> Self {
            Self {
                inventory: Mutex::new(pairs.iter().copied().collect()),
                reservations: Mutex::new(HashMap::new()),
                loads: AtomicUsize::new(0),
                load_delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.load_delay = delay;
            self
        }
    }

    #[async_trait]
    impl ProductRepository for FakeProductRepo {
        async fn check_product(&self, product_id: u64) -> Result<ProductStatus, RepositoryError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
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
            product_id: u64,
        ) -> Result<ProductDetail, RepositoryError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.inventory.lock().unwrap().contains_key(&product_id) {
                Ok(ProductDetail {
                    name: format!("product-{product_id}"),
                    description: String::new(),
                    brand_name: "brand".to_string(),
                    price: 10,
                })
            } else {
                Err(RepositoryError::NotFound)
            }
        }

        async fn get_product_inventory(&self, product_id: u64) -> Result<i64, RepositoryError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.load_delay).await;
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
            let mut inventory = self.inventory.lock().unwrap();
            let mut items: Vec<PurchasedItem> = purchased_items.to_vec();
            items.sort_by_key(|item| item.product_id);
            for item in &items {
                let stock = inventory
                    .get(&item.product_id)
                    .copied()
                    .ok_or(RepositoryError::NotFound)?;
                if stock < item.amount {
                    return Err(RepositoryError::InsufficientInventory);
                }
            }
            let mut entries = Vec::new();
            for item in &items {
                *inventory.get_mut(&item.product_id).unwrap() -= item.amount;
                entries.push(IdempotencyEntry {
                    key: idempotency_key,
                    product_id: item.product_id,
                    amount: item.amount,
                    rolled_back: false,
                });
            }
            reservations.insert(idempotency_key, entries);
            Ok(())
        }

        async fn rollback_product_inventory(
            &self,
            idempotency_key: u64,
        ) -> Result<ReleaseOutcome, RepositoryError> {
            let mut reservations = self.reservations.lock().unwrap();
            let entries = reservations
                .get_mut(&idempotency_key)
                .ok_or(RepositoryError::NotFound)?;
            if entries[0].rolled_back {
                return Ok(ReleaseOutcome::AlreadyRolledBack);
            }
            let mut inventory = self.inventory.lock().unwrap();
            for entry in entries.iter_mut() {
                *inventory.get_mut(&entry.product_id).unwrap() += entry.amount;
                entry.rolled_back = true;
            }
            Ok(ReleaseOutcome::RolledBack(entries.clone()))
        }
    }

    fn proxy_over(
        repo: Arc<FakeProductRepo>,
        shared: Arc<FakeShared>,
        filter: Option<Arc<dyn ExistenceFilter>>,
    ) -> ProductRepoCache {
        ProductRepoCache::new(repo, Arc::new(FakeLocal::default()), shared, filter)
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_loads() {
        let repo = Arc::new(
            FakeProductRepo::with_inventory(&[(1, 5)]).slow(Duration::from_millis(50)),
        );
        let shared = Arc::new(FakeShared::default());
        let proxy = Arc::new(proxy_over(Arc::clone(&repo), shared, None));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move {
                proxy.get_product_inventory(1).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 5);
        }
        assert_eq!(repo.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filter_negative_short_circuits() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 5)]));
        let shared = Arc::new(FakeShared::default());
        let filter: Arc<dyn ExistenceFilter> =
            Arc::new(FakeFilter::with_members(&[1], true));
        let proxy = proxy_over(Arc::clone(&repo), shared, Some(filter));

        let err = proxy.get_product_detail(99).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert_eq!(proxy.check_product(99).await.unwrap(), ProductStatus::NotExists);
        // The store was never consulted for the missing id.
        assert_eq!(repo.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_populates_both_tiers() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 7)]));
        let shared = Arc::new(FakeShared::default());
        let proxy = proxy_over(Arc::clone(&repo), Arc::clone(&shared), None);

        assert_eq!(proxy.get_product_inventory(1).await.unwrap(), 7);
        assert_eq!(
            shared.map.lock().unwrap().get("productinventory:1").unwrap(),
            "7"
        );
        // Second read is served from tier-1.
        assert_eq!(proxy.get_product_inventory(1).await.unwrap(), 7);
        assert_eq!(repo.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counter_adjustment_skips_absent_keys() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 5), (2, 3)]));
        let shared = Arc::new(FakeShared::default());
        shared
            .map
            .lock()
            .unwrap()
            .insert("productinventory:1".to_string(), "5".to_string());
        let proxy = proxy_over(Arc::clone(&repo), Arc::clone(&shared), None);

        proxy
            .update_product_inventory(
                100,
                &[
                    PurchasedItem {
                        product_id: 1,
                        amount: 2,
                    },
                    PurchasedItem {
                        product_id: 2,
                        amount: 1,
                    },
                ],
            )
            .await
            .unwrap();

        let map = shared.map.lock().unwrap();
        assert_eq!(map.get("productinventory:1").unwrap(), "3");
        // Key 2 was never cached; the adjustment must not create it.
        assert!(!map.contains_key("productinventory:2"));
    }

    #[tokio::test]
    async fn test_duplicate_reservation_leaves_counters_untouched() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 5)]));
        let shared = Arc::new(FakeShared::default());
        shared
            .map
            .lock()
            .unwrap()
            .insert("productinventory:1".to_string(), "5".to_string());
        let proxy = proxy_over(Arc::clone(&repo), Arc::clone(&shared), None);
        let items = [PurchasedItem {
            product_id: 1,
            amount: 2,
        }];

        proxy.update_product_inventory(100, &items).await.unwrap();
        let err = proxy.update_product_inventory(100, &items).await.unwrap_err();
        assert!(matches!(err, RepositoryError::DuplicateReservation));
        assert_eq!(
            shared.map.lock().unwrap().get("productinventory:1").unwrap(),
            "3"
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_drain_inventory_exactly() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 10)]));
        let shared = Arc::new(FakeShared::default());
        shared
            .map
            .lock()
            .unwrap()
            .insert("productinventory:1".to_string(), "10".to_string());
        let proxy = Arc::new(proxy_over(Arc::clone(&repo), Arc::clone(&shared), None));

        let mut handles = Vec::new();
        for key in 0..10u64 {
            let proxy = Arc::clone(&proxy);
            handles.push(tokio::spawn(async move {
                proxy
                    .update_product_inventory(
                        1000 + key,
                        &[PurchasedItem {
                            product_id: 1,
                            amount: 1,
                        }],
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(repo.inventory.lock().unwrap()[&1], 0);
        assert_eq!(repo.reservations.lock().unwrap().len(), 10);
        assert_eq!(
            shared.map.lock().unwrap().get("productinventory:1").unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn test_release_restores_counters_once() {
        let repo = Arc::new(FakeProductRepo::with_inventory(&[(1, 5)]));
        let shared = Arc::new(FakeShared::default());
        shared
            .map
            .lock()
            .unwrap()
            .insert("productinventory:1".to_string(), "5".to_string());
        let proxy = proxy_over(Arc::clone(&repo), Arc::clone(&shared), None);
        let items = [PurchasedItem {
            product_id: 1,
            amount: 2,
        }];

        proxy.update_product_inventory(100, &items).await.unwrap();
        let outcome = proxy.rollback_product_inventory(100).await.unwrap();
        assert!(matches!(outcome, ReleaseOutcome::RolledBack(_)));
        // Second release is a no-op on both the store and the counters.
        let outcome = proxy.rollback_product_inventory(100).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::AlreadyRolledBack);
        assert_eq!(
            shared.map.lock().unwrap().get("productinventory:1").unwrap(),
            "5"
        );
        assert_eq!(repo.inventory.lock().unwrap()[&1], 5);
    }

    #[derive(Default)]
    struct FakeOrderRepo {
        orders: Mutex<HashMap<u64, Order>>,
    }

    #[async_trait]
    impl OrderRepository for FakeOrderRepo {
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

    #[tokio::test]
    async fn test_order_write_through_and_invalidation() {
        let repo = Arc::new(FakeOrderRepo::default());
        let shared = Arc::new(FakeShared::default());
        let proxy = OrderRepoCache::new(
            Arc::clone(&repo) as Arc<dyn OrderRepository>,
            Arc::new(FakeLocal::default()),
            Arc::clone(&shared) as Arc<dyn SharedCache>,
        );
        let order = Order {
            id: 9,
            customer_id: 42,
            purchased_items: vec![PurchasedItem {
                product_id: 1,
                amount: 2,
            }],
        };

        proxy.create_order(&order).await.unwrap();
        assert!(shared.map.lock().unwrap().contains_key("order:9"));
        assert_eq!(proxy.get_order(9).await.unwrap(), order);

        proxy.delete_order(9).await.unwrap();
        assert!(!shared.map.lock().unwrap().contains_key("order:9"));
        assert!(matches!(
            proxy.get_order(9).await.unwrap_err(),
            RepositoryError::NotFound
        ));
        // Deleting an already-missing order stays silent.
        proxy.delete_order(9).await.unwrap();
    }
}
