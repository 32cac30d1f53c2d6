//! HTTP surface of the purchase system.
//!
//! One deployment runs one role, so every endpoint group is optional:
//! `POST /api/purchase` (orchestrator), product catalog reads (product),
//! and customer-scoped order/payment reads (order, payment). The purchase
//! endpoint stamps a correlation id, publishes the command to the
//! purchase topic, and answers 202 immediately; results arrive
//! asynchronously on the result stream. The validated customer id arrives
//! in the `X-Customer-ID` header (token validation happens upstream).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use broker::{Message, Publisher, TraceParent};
use model::wire::CreatePurchaseCmd;
use model::{topic, CartItem, Order, Payment, Purchase, PurchasedItem};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use service::{OrderService, PaymentService, ProductService, ServiceError};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Header populated by the upstream auth middleware.
const CUSTOMER_ID_HEADER: &str = "X-Customer-ID";

/// The services a given role exposes over HTTP. Unset groups answer 404.
#[derive(Default)]
pub struct ServerServices {
    pub purchase_publisher: Option<Arc<dyn Publisher>>,
    pub product_service: Option<Arc<dyn ProductService>>,
    pub order_service: Option<Arc<dyn OrderService>>,
    pub payment_service: Option<Arc<dyn PaymentService>>,
}

/// Server represents the HTTP server of one role's deployment.
pub struct Server {
    port: u16,
    state: AppState,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )
        .expect("Failed to create errors_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
        if status >= 400 {
            self.errors_total.with_label_values(&["http", endpoint]).inc();
        }
    }
}

/// Application state shared between request handlers.
#[derive(Clone)]
struct AppState {
    purchase_publisher: Option<Arc<dyn Publisher>>,
    product_service: Option<Arc<dyn ProductService>>,
    order_service: Option<Arc<dyn OrderService>>,
    payment_service: Option<Arc<dyn PaymentService>>,
    metrics: Arc<Metrics>,
}

/// `POST /api/purchase` request body.
#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    items: Vec<CartItem>,
    #[serde(rename = "currency_code")]
    currency_code: String,
    amount: i64,
}

#[derive(Debug, Serialize)]
struct PurchaseAccepted {
    #[serde(rename = "correlation_id")]
    correlation_id: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_page_size")]
    size: i64,
}

fn default_page_size() -> i64 {
    100
}

impl Server {
    pub fn new(port: u16, services: ServerServices) -> Self {
        info!("Initializing HTTP server on port {}", port);
        Self {
            port,
            state: AppState {
                purchase_publisher: services.purchase_publisher,
                product_service: services.product_service,
                order_service: services.order_service,
                payment_service: services.payment_service,
                metrics: Arc::new(Metrics::new()),
            },
        }
    }

    /// Starts the server and blocks until the shutdown signal fires.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let metrics = self.state.metrics.clone();
        let mut router = Router::new()
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics));
        if self.state.purchase_publisher.is_some() {
            router = router.route("/api/purchase", post(Self::handle_create_purchase));
        }
        if self.state.product_service.is_some() {
            router = router
                .route("/api/products", get(Self::handle_list_products))
                .route("/api/product/{id}", get(Self::handle_get_product));
        }
        if self.state.order_service.is_some() {
            router = router.route("/api/order/{id}", get(Self::handle_get_order));
        }
        if self.state.payment_service.is_some() {
            router = router.route("/api/payment/{id}", get(Self::handle_get_payment));
        }
        router
            .layer(axum::middleware::from_fn_with_state(
                metrics,
                Self::metrics_middleware,
            ))
            .with_state(self.state.clone())
    }

    /// Middleware for collecting metrics on HTTP requests.
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();

        let response = next.run(req).await;

        metrics.record_request(&method, &path, response.status().as_u16(), start.elapsed());
        response
    }

    async fn handle_create_purchase(
        State(state): State<AppState>,
        headers: HeaderMap,
        body: Result<Json<PurchaseRequest>, axum::extract::rejection::JsonRejection>,
    ) -> Response {
        let Some(publisher) = state.purchase_publisher.as_ref() else {
            return (StatusCode::NOT_FOUND, "not served here").into_response();
        };
        let customer_id = match customer_from_headers(&headers) {
            Some(customer_id) => customer_id,
            None => return (StatusCode::UNAUTHORIZED, "missing customer identity").into_response(),
        };
        let Json(request) = match body {
            Ok(body) => body,
            Err(rejection) => {
                warn!("bad purchase request: {rejection}");
                return (StatusCode::BAD_REQUEST, "invalid purchase body").into_response();
            }
        };
        if request.items.is_empty() {
            return (StatusCode::BAD_REQUEST, "purchase has no items").into_response();
        }
        if request.items.iter().any(|item| item.amount <= 0) {
            return (StatusCode::BAD_REQUEST, "item amount must be positive").into_response();
        }
        if request.currency_code.is_empty() {
            return (StatusCode::BAD_REQUEST, "currency code is required").into_response();
        }

        // The orchestrator assigns the shared purchase id; the command
        // leaves here with id zero.
        let purchase = Purchase::new(
            Order {
                id: 0,
                customer_id,
                purchased_items: request
                    .items
                    .iter()
                    .copied()
                    .map(PurchasedItem::from)
                    .collect(),
            },
            Payment {
                id: 0,
                customer_id,
                currency_code: request.currency_code,
                amount: request.amount,
            },
        );

        let correlation_id = Uuid::new_v4().to_string();
        let cmd = CreatePurchaseCmd::from_purchase(&purchase);
        let payload = match serde_json::to_vec(&cmd) {
            Ok(payload) => payload,
            Err(e) => {
                error!("encode purchase command: {e}");
                return (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed").into_response();
            }
        };
        let mut msg = Message::new(payload);
        msg.set_correlation_id(&correlation_id);
        msg.set_traceparent(&TraceParent::generate());

        match publisher.publish(topic::PURCHASE, msg).await {
            Ok(()) => {
                info!(correlation_id, "purchase request accepted");
                (
                    StatusCode::ACCEPTED,
                    Json(PurchaseAccepted { correlation_id }),
                )
                    .into_response()
            }
            Err(e) => {
                error!("publish purchase request: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to submit purchase").into_response()
            }
        }
    }

    async fn handle_list_products(
        State(state): State<AppState>,
        Query(params): Query<ListParams>,
    ) -> Response {
        let Some(product_service) = state.product_service.as_ref() else {
            return (StatusCode::NOT_FOUND, "not served here").into_response();
        };
        match product_service.list_products(params.offset, params.size).await {
            Ok(catalogs) => (StatusCode::OK, Json(catalogs)).into_response(),
            Err(e) => service_error_response(e, "products"),
        }
    }

    async fn handle_get_product(
        State(state): State<AppState>,
        AxumPath(product_id): AxumPath<u64>,
    ) -> Response {
        let Some(product_service) = state.product_service.as_ref() else {
            return (StatusCode::NOT_FOUND, "not served here").into_response();
        };
        match product_service.get_products(&[product_id]).await {
            Ok(mut products) if !products.is_empty() => {
                (StatusCode::OK, Json(products.remove(0))).into_response()
            }
            Ok(_) => (StatusCode::NOT_FOUND, "product not found").into_response(),
            Err(e) => service_error_response(e, "product"),
        }
    }

    async fn handle_get_order(
        State(state): State<AppState>,
        headers: HeaderMap,
        AxumPath(order_id): AxumPath<u64>,
    ) -> Response {
        let Some(order_service) = state.order_service.as_ref() else {
            return (StatusCode::NOT_FOUND, "not served here").into_response();
        };
        let customer_id = match customer_from_headers(&headers) {
            Some(customer_id) => customer_id,
            None => return (StatusCode::UNAUTHORIZED, "missing customer identity").into_response(),
        };
        match order_service.get_detailed_order(customer_id, order_id).await {
            Ok(order) => (StatusCode::OK, Json(order)).into_response(),
            Err(e) => service_error_response(e, "order"),
        }
    }

    async fn handle_get_payment(
        State(state): State<AppState>,
        headers: HeaderMap,
        AxumPath(payment_id): AxumPath<u64>,
    ) -> Response {
        let Some(payment_service) = state.payment_service.as_ref() else {
            return (StatusCode::NOT_FOUND, "not served here").into_response();
        };
        let customer_id = match customer_from_headers(&headers) {
            Some(customer_id) => customer_id,
            None => return (StatusCode::UNAUTHORIZED, "missing customer identity").into_response(),
        };
        match payment_service.get_payment(customer_id, payment_id).await {
            Ok(payment) => (StatusCode::OK, Json(payment)).into_response(),
            Err(e) => service_error_response(e, "payment"),
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                .into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

fn customer_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CUSTOMER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn service_error_response(err: ServiceError, entity: &str) -> Response {
    match err {
        ServiceError::NotFound => {
            (StatusCode::NOT_FOUND, format!("{entity} not found")).into_response()
        }
        ServiceError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized").into_response(),
        other => {
            error!("get {entity}: {other}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
