//! HTTP failure classification against a mock tile server

use std::sync::Arc;
use std::time::Duration;

use maplink_common::testing::init_test_tracing;
use maplink_core::resilience::health::HealthMonitorConfig;
use maplink_core::resilience::provider::HttpProbe;
use maplink_core::{
    ErrorCategory, HealthMonitor, HealthStatus, ProviderFailure, ProviderId, ProviderRegistryEntry,
    RetryError, RetryExecutor, RetryPolicy,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
        .no_jitter()
        .per_attempt_timeout(Duration::from_secs(2))
        .build()
        .expect("valid policy")
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<String, ProviderFailure> {
    let response = client.get(url).send().await?;
    let response = ProviderFailure::check_response(response).await?;
    Ok(response.text().await?)
}

/// Validates that a 429 with `Retry-After` is classified as a rate limit
/// carrying the hint, and that the retry then succeeds.
#[tokio::test]
async fn test_rate_limited_then_ok() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tiles/3/4/2.png"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tiles/3/4/2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tile-bytes"))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/tiles/3/4/2.png", server.uri());
    let outcome = RetryExecutor::new()
        .execute_with_outcome(&policy(), None, || fetch(&client, &url))
        .await
        .expect("second attempt succeeds");

    assert_eq!(outcome.value, "tile-bytes");
    assert_eq!(outcome.attempts.len(), 2);
    let first = outcome.attempts[0].error.as_ref().expect("first attempt failed");
    assert_eq!(first.category, ErrorCategory::RateLimit);
    assert_eq!(first.status, Some(429));
    assert_eq!(first.retry_after, Some(Duration::from_secs(1)));
    assert_eq!(outcome.attempts[1].delay_before_attempt, Duration::from_millis(50));
}

/// Validates that a 401 is not retried.
#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/geocode", server.uri());
    let result = RetryExecutor::new().execute(&policy(), || fetch(&client, &url)).await;

    match result {
        Err(RetryError::NonRetryable { error, attempts }) => {
            assert_eq!(error.category, ErrorCategory::Authentication);
            assert!(error.raw_message.contains("invalid api key"));
            assert_eq!(attempts.len(), 1);
        }
        other => panic!("expected non-retryable, got {other:?}"),
    }
}

/// Validates that 5xx responses use the whole budget.
#[tokio::test]
async fn test_server_errors_exhaust_budget() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/route", server.uri());
    let result = RetryExecutor::new().execute(&policy(), || fetch(&client, &url)).await;

    match result {
        Err(RetryError::Exhausted(aggregated)) => {
            assert_eq!(aggregated.attempts.len(), 3);
            assert!(aggregated.errors().all(|e| e.category == ErrorCategory::ApiError));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

/// Validates that a refused connection is a network failure.
#[tokio::test]
async fn test_connection_refused_is_network() {
    init_test_tracing();
    let client = reqwest::Client::new();
    let single = RetryPolicy::builder().max_attempts(1).build().expect("valid policy");

    let result = RetryExecutor::new()
        .execute(&single, || fetch(&client, "http://127.0.0.1:1/tiles"))
        .await;

    let last = result.as_ref().err().and_then(RetryError::last_error).expect("failure recorded");
    assert_eq!(last.category, ErrorCategory::Network);
    assert!(last.retryable);
}

/// Validates `HttpProbe` feeding the health monitor.
///
/// Assertions:
/// - Confirms a 200 endpoint stays `HEALTHY`.
/// - Confirms a 503 endpoint becomes `UNHEALTHY` after one failed probe.
#[tokio::test]
async fn test_http_probe_drives_health() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let up = HttpProbe::new(client.clone(), format!("{}/up", server.uri()));
    let down = HttpProbe::new(client, format!("{}/down", server.uri()));
    let monitor = HealthMonitor::new(HealthMonitorConfig::default()).expect("valid config");
    monitor.register([
        ProviderRegistryEntry::new("osm", Arc::new(up), 1),
        ProviderRegistryEntry::new("mapbox", Arc::new(down), 2),
    ]);

    let snapshots = monitor.probe_all().await;

    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].status, HealthStatus::Healthy);
    assert_eq!(snapshots[0].rolling_success_count, 1);
    assert_eq!(snapshots[1].status, HealthStatus::Unhealthy);
    assert_eq!(snapshots[1].consecutive_failures, 1);
    assert_eq!(
        monitor.recommended_provider(|_| false),
        Some(ProviderId::new("osm"))
    );
}
