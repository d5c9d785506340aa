//! HTTP-level tests for the racing API client: authentication, the
//! 429/5xx retry policy, error mapping, and transparent pagination.
//!
//! The client is built with a millisecond retry base delay so the backoff
//! paths run quickly; the production schedule (5, 10, 20, 40, 80 seconds)
//! is the same code with the default base delay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use wiremock::matchers::{basic_auth, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use racing_warehouse::errors::AppError;
use racing_warehouse::services::limiter::ApiRateLimiter;
use racing_warehouse::services::racing_api::{RacingApi, RacingApiClient};

fn regions() -> Vec<String> {
    vec!["gb".to_string(), "ire".to_string()]
}

fn client(server: &MockServer) -> RacingApiClient {
    RacingApiClient::new(
        &server.uri(),
        "api-user",
        "api-pass",
        Arc::new(ApiRateLimiter::new()),
    )
    .unwrap()
    .with_retry_base_delay(Duration::from_millis(20))
}

#[tokio::test]
async fn sends_basic_auth_and_region_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/courses"))
        .and(basic_auth("api-user", "api-pass"))
        .and(query_param("region", "gb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "courses": [
                { "id": "crs_1", "course": "Ascot", "region_code": "gb", "region": "Great Britain" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let courses = client(&server).get_courses(&regions()).await.unwrap();
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0].course, "Ascot");
}

#[tokio::test]
async fn rate_limited_request_recovers_after_retry() {
    // First call returns 429 with a short provider-advised delay, second
    // returns the documents: the fetch completes with no data loss and the
    // advised delay is observed.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/racecards/pro"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("Retry-After", "1"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/racecards/pro"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "racecards": [
                { "race_id": "rac_1", "date": "2025-10-23" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let started = Instant::now();
    let docs = client(&server)
        .get_racecards_pro(
            "2025-10-20".parse().unwrap(),
            "2025-10-23".parse().unwrap(),
            &regions(),
        )
        .await
        .unwrap();

    assert_eq!(docs.len(), 1);
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "the Retry-After delay must be observed"
    );
}

#[tokio::test]
async fn server_errors_retry_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/bookmakers"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/bookmakers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "bookmakers": [ { "id": "bkm_1", "name": "Bet365" } ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bookmakers = client(&server).get_bookmakers().await.unwrap();
    assert_eq!(bookmakers.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_as_fetch_error() {
    // First try plus five retries, one per step of the backoff schedule.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/bookmakers"))
        .respond_with(ResponseTemplate::new(500))
        .expect(6)
        .mount(&server)
        .await;

    let err = client(&server).get_bookmakers().await.unwrap_err();
    assert!(matches!(err, AppError::Fetch(_)), "got {err:?}");
}

#[tokio::test]
async fn unauthorized_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/courses"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).get_courses(&regions()).await.unwrap_err();
    assert!(matches!(err, AppError::Authentication(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn other_client_errors_do_not_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/horses/hrs_missing/pro"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).get_horse_pro("hrs_missing").await.unwrap_err();
    assert!(matches!(err, AppError::Fetch(_)), "got {err:?}");
}

#[tokio::test]
async fn people_pagination_is_walked_transparently() {
    // Page one is full (500 rows), page two is short: the client walks
    // both and returns the concatenated list.
    let server = MockServer::start().await;

    let full_page: Vec<serde_json::Value> = (0..500)
        .map(|i| serde_json::json!({ "id": format!("jky_{i:04}"), "name": format!("Jockey {i}") }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/v1/jockeys"))
        .and(query_param("skip", "0"))
        .and(query_param("limit", "500"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "jockeys": full_page })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jockeys"))
        .and(query_param("skip", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jockeys": [ { "id": "jky_0500", "name": "Jockey 500" } ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let jockeys = client(&server).get_jockeys(&regions()).await.unwrap();
    assert_eq!(jockeys.len(), 501);
    assert_eq!(jockeys[500].id, "jky_0500");
}

#[tokio::test]
async fn page_cap_stops_the_walk() {
    // With a full first page and a cap of one page, the client stops
    // without requesting page two.
    let server = MockServer::start().await;

    let full_page: Vec<serde_json::Value> = (0..500)
        .map(|i| serde_json::json!({ "id": format!("own_{i:04}"), "name": format!("Owner {i}") }))
        .collect();
    Mock::given(method("GET"))
        .and(path("/v1/owners"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "owners": full_page })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let owners = client(&server)
        .with_page_cap(1)
        .get_owners(&regions())
        .await
        .unwrap();
    assert_eq!(owners.len(), 500);
}

#[tokio::test]
async fn date_window_is_passed_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/results"))
        .and(query_param("date_from", "2025-10-01"))
        .and(query_param("date_to", "2025-10-31"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "results": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let results = client(&server)
        .get_results(
            "2025-10-01".parse().unwrap(),
            "2025-10-31".parse().unwrap(),
            &regions(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}
