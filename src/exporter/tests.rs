use std::collections::BTreeSet;
use std::sync::Arc;

use super::*;
use crate::collector::sink::render;
use crate::server::testing::FakeConnector;
use crate::server::{SessionError, DATABASES_QUERY};
use crate::utils::log_capture;
use serial_test::serial;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn as_set(items: Vec<String>) -> BTreeSet<String> {
    items.into_iter().collect()
}

fn cache(connector: &FakeConnector) -> Arc<ServerCache> {
    Arc::new(ServerCache::new(Arc::new(connector.clone())))
}

#[tokio::test]
async fn test_discover_expands_keyword_and_uri_forms() {
    let connector = FakeConnector::new().with_databases(&["orders", "billing"]);
    let servers = cache(&connector);
    let dsns = strings(&["host=db user=u", "postgresql://u@db2:5432/postgres"]);

    let found = as_set(discover_databases(&servers, &dsns, &[], &[]).await);
    let expected = as_set(strings(&[
        "host=db user=u",
        "host=db user=u dbname=orders",
        "host=db user=u dbname=billing",
        "postgresql://u@db2:5432/postgres",
        "postgresql://u@db2:5432/orders",
        "postgresql://u@db2:5432/billing",
    ]));
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_discover_never_includes_excluded_databases() {
    let connector = FakeConnector::new().with_databases(&["orders", "billing", "secret"]);
    let servers = cache(&connector);
    let dsns = strings(&["host=db"]);
    let exclude = strings(&["secret", "billing"]);

    let found = discover_databases(&servers, &dsns, &exclude, &[]).await;
    assert_eq!(
        as_set(found),
        as_set(strings(&["host=db", "host=db dbname=orders"]))
    );
}

#[tokio::test]
async fn test_discover_include_applies_after_exclude() {
    let connector = FakeConnector::new().with_databases(&["orders", "billing", "secret"]);
    let servers = cache(&connector);
    let dsns = strings(&["host=db"]);
    let exclude = strings(&["secret"]);
    let include = strings(&["secret", "orders"]);

    let found = discover_databases(&servers, &dsns, &exclude, &include).await;
    assert_eq!(
        as_set(found),
        as_set(strings(&["host=db", "host=db dbname=orders"]))
    );
}

#[tokio::test]
async fn test_discover_is_idempotent() {
    let connector = FakeConnector::new().with_databases(&["a", "b", "c"]);
    let servers = cache(&connector);
    let dsns = strings(&["host=db", "host=db"]);

    let first = discover_databases(&servers, &dsns, &[], &[]).await;
    let second = discover_databases(&servers, &dsns, &[], &[]).await;
    assert_eq!(first.len(), 4);
    assert_eq!(as_set(first), as_set(second));
    assert_eq!(servers.len(), 1);
}

#[tokio::test]
async fn test_discover_skips_bad_and_unreachable_dsns() {
    let connector = FakeConnector::new()
        .with_databases(&["orders"])
        .fail_connect_to("host=down");
    let servers = cache(&connector);
    let dsns = strings(&["not a dsn", "host=down", "host=db"]);

    let found = discover_databases(&servers, &dsns, &[], &[]).await;
    assert_eq!(
        as_set(found),
        as_set(strings(&["host=db", "host=db dbname=orders"]))
    );
}

#[tokio::test]
#[serial(logs)]
async fn test_discover_warns_on_unparseable_dsn() {
    let logs = log_capture::capture();
    let connector = FakeConnector::new();
    let servers = cache(&connector);

    let found = discover_databases(&servers, &strings(&["not a dsn"]), &[], &[]).await;
    assert!(found.is_empty());
    assert_eq!(logs.matching(log::Level::Warn, "not a dsn").len(), 1);
    assert!(logs.matching(log::Level::Error, "not a dsn").is_empty());
}

#[tokio::test]
async fn test_discover_keeps_dsn_when_listing_fails() {
    let connector = FakeConnector::new().with_responder(|sql| {
        (sql == DATABASES_QUERY).then(|| Err(SessionError::Other("permission denied".to_string())))
    });
    let servers = cache(&connector);
    let found = discover_databases(&servers, &strings(&["host=db"]), &[], &[]).await;
    assert_eq!(found, strings(&["host=db"]));
}

#[tokio::test]
async fn test_discover_marks_input_entry_as_master() {
    let connector = FakeConnector::new().with_databases(&["orders"]);
    let servers = cache(&connector);
    discover_databases(&servers, &strings(&["host=db"]), &[], &[]).await;

    assert!(servers.get_or_create("host=db").is_master());
    assert!(!servers.get_or_create("host=db dbname=orders").is_master());
}

fn exporter(connector: &FakeConnector, dsns: &[&str], options: ExporterOptions) -> Exporter {
    Exporter::new(strings(dsns), options, cache(connector))
}

#[tokio::test]
async fn test_scrape_reports_health_metrics() {
    let connector = FakeConnector::new();
    let exporter = exporter(&connector, &["host=db"], ExporterOptions::default());

    let sink = MetricSink::new();
    exporter.scrape(&sink).await.unwrap();
    exporter.scrape(&sink).await.unwrap();

    let text = render(&sink.gather());
    assert!(text.contains("gs_up 1"));
    assert!(text.contains("gs_exporter_last_scrape_error 0"));
    assert!(text.contains("gs_exporter_scrapes_total 2"));
    assert!(text.contains("gs_exporter_last_scrape_duration_seconds "));
    assert!(text.contains("gs_static{"));
    assert!(exporter.servers().get_or_create("host=db").is_master());
}

#[tokio::test]
async fn test_scrape_marks_down_when_every_connection_fails() {
    let connector = FakeConnector::new().fail_connect_to("host=down");
    let exporter = exporter(&connector, &["host=down"], ExporterOptions::default());

    let sink = MetricSink::new();
    exporter.scrape(&sink).await.unwrap();

    let text = render(&sink.gather());
    assert!(text.contains("gs_up 0"));
    assert!(text.contains("gs_exporter_last_scrape_error 1"));
}

#[tokio::test]
async fn test_resolve_one_continues_without_version() {
    let connector = FakeConnector::new();
    connector.break_version();
    let exporter = exporter(&connector, &["host=db"], ExporterOptions::default());

    let sink = MetricSink::new();
    exporter.resolve_one("host=db", &sink).await.unwrap();
    // no version, so no static metric, but the scrape went ahead
    assert!(!render(&sink.gather()).contains("gs_static"));
}

#[tokio::test]
async fn test_resolve_one_reports_connection_errors() {
    let connector = FakeConnector::new().fail_connect_to("host=down");
    let exporter = exporter(&connector, &[], ExporterOptions::default());
    let other = exporter
        .resolve_one("host=down password=secret", &MetricSink::new())
        .await;
    // a differently written DSN is a different identity, and this one connects
    assert!(other.is_ok());

    let err = exporter
        .resolve_one("host=down", &MetricSink::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connect { .. }));
}

#[tokio::test]
async fn test_auto_discovery_scrapes_every_database() {
    let connector = FakeConnector::new().with_databases(&["orders", "billing"]);
    let options = ExporterOptions {
        auto_discover_databases: true,
        exclude_databases: strings(&["billing"]),
        ..ExporterOptions::default()
    };
    let exporter = exporter(&connector, &["host=db port=5432"], options);

    assert_eq!(
        as_set(exporter.targets().await),
        as_set(strings(&["host=db port=5432", "host=db port=5432 dbname=orders"]))
    );
    let sink = MetricSink::new();
    exporter.scrape(&sink).await.unwrap();
    assert!(render(&sink.gather()).contains("gs_up 1"));
    assert!(!exporter
        .servers()
        .get_or_create("host=db port=5432 dbname=orders")
        .is_master());
}
