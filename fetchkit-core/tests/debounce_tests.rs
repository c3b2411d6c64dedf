//! Trailing-edge debouncing, end to end

use fetchkit_core::{Client, ClientConfig, DebounceConfig, FetchError, RequestOptions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_rapid_search_burst_sends_only_the_last_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "react"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": 3})))
        .expect(1)
        .mount(&server)
        .await;

    // All /search requests share one debounce key regardless of the query.
    let debounce = DebounceConfig {
        delay_ms: 150,
        key_fn: Some(Arc::new(|req| {
            format!("{} search", req.method)
        })),
        ..DebounceConfig::default()
    };
    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_debounce(debounce),
    )
    .unwrap();

    let mut calls = Vec::new();
    for term in ["r", "re", "rea", "reac", "react"] {
        let client = client.clone();
        let term = term.to_string();
        calls.push(tokio::spawn(async move {
            client
                .get("/search", RequestOptions::new().with_query("q", term.as_str()))
                .await
        }));
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    let mut debounced = 0;
    let mut succeeded = 0;
    for call in calls {
        match call.await.unwrap() {
            Ok(res) => {
                succeeded += 1;
                assert_eq!(res.data.as_json(), Some(&json!({"hits": 3})));
            }
            Err(FetchError::Abort { reason, .. }) => {
                assert_eq!(reason.as_deref(), Some("debounced"));
                debounced += 1;
            }
            Err(other) => panic!("unexpected error {}", other.kind()),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(debounced, 4);
    assert_eq!(client.stats().counters().debounced, 4);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_debounced_request_never_enters_the_retry_loop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_debounce(DebounceConfig::with_delay_ms(100)),
    )
    .unwrap();

    let superseded = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/x", RequestOptions::new().with_retry(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let survivor = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/x", RequestOptions::new().with_retry(0)).await })
    };

    let err = superseded.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "AbortError");
    // A cancelled request made zero attempts.
    assert_eq!(err.attempt(), 0);

    let _ = survivor.await.unwrap();
    // Only the survivor reached the network; the superseded call's retry
    // budget was never consumed.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_distinct_endpoints_debounce_independently() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_debounce(DebounceConfig::with_delay_ms(50)),
    )
    .unwrap();

    let (a, b) = tokio::join!(
        client.get("/a", RequestOptions::new()),
        client.get("/b", RequestOptions::new()),
    );
    a.unwrap();
    b.unwrap();
}

#[tokio::test]
async fn test_excluded_method_bypasses_debounce() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let debounce = DebounceConfig {
        delay_ms: 10_000,
        exclude_methods: vec!["POST".to_string()],
        ..DebounceConfig::default()
    };
    let client = Client::new(
        ClientConfig::new()
            .with_base_url(server.uri())
            .with_debounce(debounce),
    )
    .unwrap();

    // Without the bypass these would wait 10 s on the debounce timer.
    client.post("/x", json!({}), RequestOptions::new()).await.unwrap();
    client.post("/x", json!({}), RequestOptions::new()).await.unwrap();
}
