//! Stats collection and the query surface across real requests

use fetchkit_core::{
    Client, ClientConfig, RequestOptions, RetrySettings, StatsDimension, StatsFilter, StatsMetric,
    StatsQuery, TimeWindow,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> Client {
    Client::new(ClientConfig::new().with_base_url(server.uri())).unwrap()
}

#[tokio::test]
async fn test_lifecycle_counters_for_a_retried_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_retry(RetrySettings {
                retry: 2,
                retry_delay_ms: 5,
                ..RetrySettings::none()
            }),
    )
    .unwrap();

    client.get("/flaky", RequestOptions::new()).await.unwrap();

    let counters = client.stats().counters();
    assert_eq!(counters.enqueued, 1);
    assert_eq!(counters.started, 3);
    assert_eq!(counters.retried, 2);
    assert_eq!(counters.succeeded, 1);
    assert_eq!(counters.failed, 0);
}

#[tokio::test]
async fn test_failure_counters_and_error_breakdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.get("/ok", RequestOptions::new()).await.unwrap();
    client.get("/bad", RequestOptions::new()).await.unwrap_err();
    client.get("/bad", RequestOptions::new()).await.unwrap_err();

    let counters = client.stats().counters();
    assert_eq!(counters.succeeded, 1);
    assert_eq!(counters.failed, 2);

    let breakdown = client
        .stats()
        .query(&StatsQuery::metric(StatsMetric::ErrorBreakdown));
    assert_eq!(breakdown.groups.get("HttpError"), Some(&2.0));
}

#[tokio::test]
async fn test_counts_grouped_by_endpoint_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.get("/a", RequestOptions::new()).await.unwrap();
    client.get("/a", RequestOptions::new()).await.unwrap();
    client.get("/b", RequestOptions::new()).await.unwrap();

    let by_endpoint = client
        .stats()
        .query(&StatsQuery::metric(StatsMetric::Count).group_by(StatsDimension::Endpoint));
    let a_count = by_endpoint
        .groups
        .iter()
        .find(|(endpoint, _)| endpoint.ends_with("/a"))
        .map(|(_, count)| *count);
    assert_eq!(a_count, Some(2.0));

    let by_status = client
        .stats()
        .query(&StatsQuery::metric(StatsMetric::Count).group_by(StatsDimension::Status));
    assert_eq!(by_status.groups.get("200"), Some(&3.0));
}

#[tokio::test]
async fn test_rolling_window_matches_since_start_for_fresh_traffic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    for _ in 0..4 {
        client.get("/x", RequestOptions::new()).await.unwrap();
    }

    let since_start = client.stats().query(&StatsQuery::metric(StatsMetric::Count));
    let rolling = client.stats().query(
        &StatsQuery::metric(StatsMetric::Count).window(TimeWindow::Rolling60s),
    );
    assert_eq!(since_start.value, Some(4.0));
    assert_eq!(rolling.value, since_start.value);
}

#[tokio::test]
async fn test_duration_percentiles_are_queryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    for _ in 0..5 {
        client.get("/x", RequestOptions::new()).await.unwrap();
    }

    let median = client
        .stats()
        .query(&StatsQuery::metric(StatsMetric::DurationMedian));
    let p99 = client
        .stats()
        .query(&StatsQuery::metric(StatsMetric::DurationP99));
    assert!(median.value.unwrap() <= p99.value.unwrap());
}

#[tokio::test]
async fn test_filtered_counts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.get("/ok", RequestOptions::new()).await.unwrap();
    client.get("/bad", RequestOptions::new()).await.unwrap_err();

    let failures_only = client.stats().query(&StatsQuery::metric(StatsMetric::Count).filter(
        StatsFilter {
            status: Some(503),
            ..StatsFilter::default()
        },
    ));
    assert_eq!(failures_only.value, Some(1.0));
}

#[tokio::test]
async fn test_reset_zeroes_all_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.get("/x", RequestOptions::new()).await.unwrap();

    let stats = client.stats();
    stats.reset();

    assert_eq!(stats.counters().succeeded, 0);
    assert_eq!(
        stats.query(&StatsQuery::metric(StatsMetric::Count)).value,
        Some(0.0)
    );
    assert!(stats
        .query(&StatsQuery::metric(StatsMetric::ErrorBreakdown))
        .groups
        .is_empty());
}

#[tokio::test]
async fn test_disabled_stats_record_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_stats_enabled(false),
    )
    .unwrap();

    client.get("/x", RequestOptions::new()).await.unwrap();
    assert_eq!(client.stats().counters().enqueued, 0);
    assert_eq!(client.stats().snapshot().counters.succeeded, 0);
}

#[tokio::test]
async fn test_snapshot_serializes_for_export() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.get("/x", RequestOptions::new()).await.unwrap();

    let exported = serde_json::to_value(client.stats().snapshot()).unwrap();
    assert_eq!(exported["counters"]["succeeded"], json!(1));
}
