//! Purchase saga entry point.
//!
//! One binary, one role per process: the orchestrator or one of the three
//! participants. Each role builds its dependency graph leaves-first (pool
//! → caches → repositories → proxies → services → router/server) and runs
//! its event router and HTTP server until a shutdown signal arrives.

mod client;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use app_config::{AppConfig, FilterKind};
use broker::{EventRouter, KafkaPublisher, Publisher, RedisStreamPublisher};
use cache::{
    ExistenceFilter, LocalCache, MokaLocalCache, OrderRepoCache, PaymentRepoCache,
    ProductRepoCache, RedisExistenceFilter, RedisSharedCache, SharedCache,
};
use clap::{Parser, ValueEnum};
use client::HttpProductClient;
use model::topic;
use redis::aio::ConnectionManager;
use repository::{
    OrderRepository, PaymentRepository, PgOrderRepository, PgPaymentRepository,
    PgProductRepository, ProductRepository,
};
use server::{Server, ServerServices};
use service::handlers::{
    CreateOrderHandler, CreatePaymentHandler, ReplyHandler, RollbackOrderHandler,
    RollbackPaymentHandler, RollbackProductInventoryHandler, StartTransactionHandler,
    UpdateProductInventoryHandler,
};
use service::{
    IdGenerator, OrchestratorService, OrchestratorServiceImpl, OrderService, OrderServiceImpl,
    PaymentService, PaymentServiceImpl, ProductService, ProductServiceImpl,
    ResilientProductClient, SagaOrderServiceImpl, SagaPaymentServiceImpl,
    SagaProductServiceImpl, SnowflakeGenerator,
};
use tokio::signal;
use tokio::sync::Notify;
use tracing::info;

/// Which service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Orchestrator,
    Product,
    Order,
    Payment,
}

#[derive(Parser)]
#[command(name = "purchase-saga", about = "Distributed purchase transaction services")]
struct Args {
    #[arg(long, value_enum)]
    role: Role,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = AppConfig::load().context("load configuration")?;
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(watch_shutdown(Arc::clone(&shutdown), cfg.clone()));

    info!(role = ?args.role, "starting");
    match args.role {
        Role::Orchestrator => run_orchestrator(cfg, shutdown).await,
        Role::Product => run_product(cfg, shutdown).await,
        Role::Order => run_order(cfg, shutdown).await,
        Role::Payment => run_payment(cfg, shutdown).await,
    }
}

async fn watch_shutdown(shutdown: Arc<Notify>, cfg: AppConfig) {
    shutdown_signal().await;
    info!("Shutdown signal received");
    shutdown.notify_waiters();
    // Workers still busy after the grace period are abandoned.
    tokio::time::sleep(cfg.shutdown_timeout).await;
    std::process::exit(0);
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn redis_connection(cfg: &AppConfig) -> Result<ConnectionManager> {
    let client =
        redis::Client::open(cfg.redis_url.clone()).context("parse redis url")?;
    ConnectionManager::new(client)
        .await
        .context("connect to redis")
}

fn machine_id() -> u16 {
    (std::process::id() % 1024) as u16
}

fn group_for(cfg: &AppConfig, role: &str) -> String {
    format!("{}_{}", cfg.kafka_group_id, role)
}

/// Runs the router and the HTTP server side by side until shutdown.
async fn serve(router: EventRouter, server: Server, shutdown: Arc<Notify>) -> Result<()> {
    let router_shutdown = Arc::clone(&shutdown);
    let router_handle =
        tokio::spawn(async move { router.run(router_shutdown).await });
    server.start(shutdown).await?;
    router_handle.await?.context("event router failed")?;
    Ok(())
}

async fn run_orchestrator(cfg: AppConfig, shutdown: Arc<Notify>) -> Result<()> {
    let redis = redis_connection(&cfg).await?;
    let tx_publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&cfg.kafka_brokers)?);
    let result_publisher: Arc<dyn Publisher> = Arc::new(RedisStreamPublisher::new(
        redis,
        HashMap::from([(topic::PURCHASE_RESULT.to_string(), cfg.purchase_result_maxlen)]),
    ));
    let idgen: Arc<dyn IdGenerator> = Arc::new(SnowflakeGenerator::new(machine_id()));
    let orchestrator: Arc<dyn OrchestratorService> = Arc::new(OrchestratorServiceImpl::new(
        idgen,
        Arc::clone(&tx_publisher),
        result_publisher,
    ));

    let mut router = EventRouter::new(
        &cfg.kafka_brokers,
        &group_for(&cfg, "orchestrator"),
        cfg.kafka_workers,
    );
    router.add_no_publisher_handler(
        "sagaorchestrator_start_transaction_handler",
        topic::PURCHASE,
        Arc::new(StartTransactionHandler::new(Arc::clone(&orchestrator))),
    );
    router.add_no_publisher_handler(
        "sagaorchestrator_handle_reply_handler",
        topic::REPLY,
        Arc::new(ReplyHandler::new(orchestrator)),
    );

    let server = Server::new(
        cfg.http_port,
        ServerServices {
            purchase_publisher: Some(tx_publisher),
            ..Default::default()
        },
    );
    serve(router, server, shutdown).await
}

async fn run_product(cfg: AppConfig, shutdown: Arc<Notify>) -> Result<()> {
    let pool = db::init_db_pool(&cfg).await?;
    let redis = redis_connection(&cfg).await?;

    let local: Arc<dyn LocalCache> = Arc::new(MokaLocalCache::new(
        cfg.local_cache_expiration,
        cfg.local_cache_capacity,
    ));
    let shared: Arc<dyn SharedCache> =
        Arc::new(RedisSharedCache::new(redis.clone(), cfg.redis_expiration));
    let filter: Option<Arc<dyn ExistenceFilter>> = match cfg.filter_kind {
        FilterKind::None => None,
        kind => {
            let filter = RedisExistenceFilter::new(
                redis,
                kind,
                "products_filter",
                cfg.filter_capacity,
                cfg.filter_error_rate,
            );
            filter.init().await.context("init existence filter")?;
            Some(Arc::new(filter))
        }
    };

    let product_repo: Arc<dyn ProductRepository> = Arc::new(PgProductRepository::new(pool));
    let cached_repo: Arc<dyn ProductRepository> =
        Arc::new(ProductRepoCache::new(product_repo, local, shared, filter));

    let idgen: Arc<dyn IdGenerator> = Arc::new(SnowflakeGenerator::new(machine_id()));
    let product_service: Arc<dyn ProductService> = Arc::new(ProductServiceImpl::new(
        Arc::clone(&cached_repo),
        idgen,
    ));
    let saga_service = Arc::new(SagaProductServiceImpl::new(cached_repo));

    let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&cfg.kafka_brokers)?);
    let mut router = EventRouter::new(
        &cfg.kafka_brokers,
        &group_for(&cfg, "product"),
        cfg.kafka_workers,
    );
    router.add_handler(
        "sagaproduct_update_product_inventory_handler",
        topic::UPDATE_PRODUCT_INVENTORY,
        topic::REPLY,
        Arc::clone(&publisher),
        Arc::new(UpdateProductInventoryHandler::new(Arc::clone(&saga_service) as _)),
    );
    router.add_handler(
        "sagaproduct_rollback_product_inventory_handler",
        topic::ROLLBACK_PRODUCT_INVENTORY,
        topic::REPLY,
        publisher,
        Arc::new(RollbackProductInventoryHandler::new(saga_service)),
    );

    let server = Server::new(
        cfg.http_port,
        ServerServices {
            product_service: Some(product_service),
            ..Default::default()
        },
    );
    serve(router, server, shutdown).await
}

async fn run_order(cfg: AppConfig, shutdown: Arc<Notify>) -> Result<()> {
    let pool = db::init_db_pool(&cfg).await?;
    let redis = redis_connection(&cfg).await?;

    let local: Arc<dyn LocalCache> = Arc::new(MokaLocalCache::new(
        cfg.local_cache_expiration,
        cfg.local_cache_capacity,
    ));
    let shared: Arc<dyn SharedCache> =
        Arc::new(RedisSharedCache::new(redis, cfg.redis_expiration));

    let order_repo: Arc<dyn OrderRepository> = Arc::new(PgOrderRepository::new(pool));
    let cached_repo: Arc<dyn OrderRepository> =
        Arc::new(OrderRepoCache::new(order_repo, local, shared));

    let product_client = Arc::new(ResilientProductClient::new(
        Arc::new(HttpProductClient::new(&cfg.product_service_url)),
        cfg.rpc_rps,
        cfg.rpc_breaker_threshold,
        cfg.rpc_breaker_timeout,
    ));
    let order_service: Arc<dyn OrderService> = Arc::new(OrderServiceImpl::new(
        Arc::clone(&cached_repo),
        product_client,
    ));
    let saga_service = Arc::new(SagaOrderServiceImpl::new(cached_repo));

    let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&cfg.kafka_brokers)?);
    let mut router = EventRouter::new(
        &cfg.kafka_brokers,
        &group_for(&cfg, "order"),
        cfg.kafka_workers,
    );
    router.add_handler(
        "sagaorder_create_order_handler",
        topic::CREATE_ORDER,
        topic::REPLY,
        Arc::clone(&publisher),
        Arc::new(CreateOrderHandler::new(Arc::clone(&saga_service) as _)),
    );
    router.add_handler(
        "sagaorder_rollback_order_handler",
        topic::ROLLBACK_ORDER,
        topic::REPLY,
        publisher,
        Arc::new(RollbackOrderHandler::new(saga_service)),
    );

    let server = Server::new(
        cfg.http_port,
        ServerServices {
            order_service: Some(order_service),
            ..Default::default()
        },
    );
    serve(router, server, shutdown).await
}

async fn run_payment(cfg: AppConfig, shutdown: Arc<Notify>) -> Result<()> {
    let pool = db::init_db_pool(&cfg).await?;
    let redis = redis_connection(&cfg).await?;

    let local: Arc<dyn LocalCache> = Arc::new(MokaLocalCache::new(
        cfg.local_cache_expiration,
        cfg.local_cache_capacity,
    ));
    let shared: Arc<dyn SharedCache> =
        Arc::new(RedisSharedCache::new(redis, cfg.redis_expiration));

    let payment_repo: Arc<dyn PaymentRepository> = Arc::new(PgPaymentRepository::new(pool));
    let cached_repo: Arc<dyn PaymentRepository> =
        Arc::new(PaymentRepoCache::new(payment_repo, local, shared));

    let payment_service: Arc<dyn PaymentService> =
        Arc::new(PaymentServiceImpl::new(Arc::clone(&cached_repo)));
    let saga_service = Arc::new(SagaPaymentServiceImpl::new(cached_repo));

    let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(&cfg.kafka_brokers)?);
    let mut router = EventRouter::new(
        &cfg.kafka_brokers,
        &group_for(&cfg, "payment"),
        cfg.kafka_workers,
    );
    router.add_handler(
        "sagapayment_create_payment_handler",
        topic::CREATE_PAYMENT,
        topic::REPLY,
        Arc::clone(&publisher),
        Arc::new(CreatePaymentHandler::new(Arc::clone(&saga_service) as _)),
    );
    router.add_handler(
        "sagapayment_rollback_payment_handler",
        topic::ROLLBACK_PAYMENT,
        topic::REPLY,
        publisher,
        Arc::new(RollbackPaymentHandler::new(saga_service)),
    );

    let server = Server::new(
        cfg.http_port,
        ServerServices {
            payment_service: Some(payment_service),
            ..Default::default()
        },
    );
    serve(router, server, shutdown).await
}
