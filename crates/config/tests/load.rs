use app_config::{AppConfig, FilterKind};
use std::time::Duration;

#[test]
fn test_load_default_config() {
    let cfg = AppConfig::load().unwrap();
    assert_eq!(cfg.kafka_group_id, "purchase_saga");
    assert_eq!(cfg.filter_kind, FilterKind::None);
    assert_eq!(cfg.shutdown_timeout, Duration::from_secs(5));
    assert!(cfg.db_dsn().contains("sslmode=disable"));
}
