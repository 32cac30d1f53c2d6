//! HTTP client of the product service, consumed by order reads.
//!
//! Only the thin request/response mapping lives here; the rate limit and
//! circuit breaker are applied by wrapping this client in
//! `ResilientProductClient` at wiring time.

use async_trait::async_trait;
use model::{Product, ProductDetail};
use reqwest::StatusCode;
use service::{ProductClient, ServiceError};

pub struct HttpProductClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProductClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProductClient for HttpProductClient {
    async fn get_product_detail(&self, product_id: u64) -> Result<ProductDetail, ServiceError> {
        let url = format!("{}/api/product/{}", self.base_url, product_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError::Rpc(e.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound),
            status if status.is_success() => {
                let product: Product = response
                    .json()
                    .await
                    .map_err(|e| ServiceError::Rpc(e.to_string()))?;
                Ok(product.detail)
            }
            status => Err(ServiceError::Rpc(format!(
                "product service answered {status}"
            ))),
        }
    }
}
