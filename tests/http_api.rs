use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use ratekeeper::{server, BucketConfig, BucketSet, LimitResult, ManualClock, TokenStore};
use std::sync::Arc;
use tower::ServiceExt;

const START_MS: u64 = 1_000_000;

fn app() -> (Router, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    let buckets = BucketSet::from_configs(vec![
        BucketConfig::parse_spec("fast1,1,1s").unwrap(),
        BucketConfig::parse_spec("fast10,10,1s").unwrap(),
    ])
    .unwrap();
    let store = Arc::new(TokenStore::with_clock(buckets, clock.clone()));
    (server::router(store), clock)
}

async fn send(app: &Router, method: Method, uri: &str, form: Option<&str>) -> (StatusCode, String) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match form {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_owned())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn limit(app: &Router, method: Method, uri: &str, form: Option<&str>) -> LimitResult {
    let (status, body) = send(app, method, uri, form).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn test_query_shape() {
    let (app, _) = app();
    let (status, body) = send(&app, Method::GET, "/fast10/alice", None).await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "conformant": true,
            "size": 10,
            "remaining": 10,
            "ttl": START_MS + 1_000,
        })
    );
}

#[tokio::test]
async fn test_post_defaults_to_take() {
    let (app, _) = app();

    // No body at all.
    let res = limit(&app, Method::POST, "/fast10/alice", None).await;
    assert_eq!((res.conformant, res.remaining), (true, 9));

    // Form body without a count field.
    let res = limit(&app, Method::POST, "/fast10/alice", Some("")).await;
    assert_eq!((res.conformant, res.remaining), (true, 8));

    let res = limit(&app, Method::POST, "/fast10/alice", Some("count=1")).await;
    assert_eq!(res.remaining, 7);
}

#[tokio::test]
async fn test_post_give_back_and_query() {
    let (app, _) = app();
    limit(&app, Method::POST, "/fast10/bob", None).await;
    limit(&app, Method::POST, "/fast10/bob", None).await;

    let res = limit(&app, Method::POST, "/fast10/bob", Some("count=-1")).await;
    assert_eq!(res.remaining, 9);

    let res = limit(&app, Method::POST, "/fast10/bob", Some("count=0")).await;
    assert_eq!(res.remaining, 9);

    let res = limit(&app, Method::GET, "/fast10/bob", None).await;
    assert_eq!(res.remaining, 9);
}

#[tokio::test]
async fn test_exhaustion_over_http() {
    let (app, _) = app();
    let first = limit(&app, Method::POST, "/fast1/k", None).await;
    assert_eq!((first.conformant, first.remaining), (true, 0));

    let second = limit(&app, Method::POST, "/fast1/k", None).await;
    assert_eq!((second.conformant, second.remaining), (false, 0));
    assert_eq!(second.ttl, first.ttl);
}

#[tokio::test]
async fn test_window_rollover_over_http() {
    let (app, clock) = app();
    limit(&app, Method::POST, "/fast1/k", None).await;
    limit(&app, Method::POST, "/fast1/k", None).await;

    clock.advance(1_001);
    let res = limit(&app, Method::POST, "/fast1/k", None).await;
    assert!(res.conformant);
    assert_eq!(res.ttl, START_MS + 1_001 + 1_000);
}

#[tokio::test]
async fn test_count_out_of_range() {
    let (app, _) = app();
    for body in ["count=2", "count=-2", "count=abc"] {
        let (status, msg) = send(&app, Method::POST, "/fast10/k", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert!(!msg.is_empty());
    }

    // Rejected requests never touch the record.
    let res = limit(&app, Method::GET, "/fast10/k", None).await;
    assert_eq!(res.remaining, 10);
}

#[tokio::test]
async fn test_non_form_body_is_rejected() {
    let (app, _) = app();
    for content_type in ["application/json", "text/plain"] {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/fast10/k")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(r#"{"count":-1}"#))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{content_type}");
    }

    // Nothing was taken.
    let res = limit(&app, Method::GET, "/fast10/k", None).await;
    assert_eq!(res.remaining, 10);
}

#[tokio::test]
async fn test_unknown_bucket_is_bad_request() {
    let (app, _) = app();
    for method in [Method::GET, Method::POST, Method::DELETE] {
        let (status, body) = send(&app, method.clone(), "/nope/k", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{method}");
        assert_eq!(body, "Could not find bucket nope");
    }
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let (app, _) = app();
    let (status, _) = send(&app, Method::GET, "/fast10/", None).await;
    assert!(status.is_client_error());

    let (status, _) = send(&app, Method::GET, "/fast10/a/b", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset() {
    let (app, _) = app();
    let (status, body) = send(&app, Method::DELETE, "/fast1/k", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "false");

    limit(&app, Method::POST, "/fast1/k", None).await;
    limit(&app, Method::POST, "/fast1/k", None).await;

    let (_, body) = send(&app, Method::DELETE, "/fast1/k", None).await;
    assert_eq!(body, "true");

    let res = limit(&app, Method::POST, "/fast1/k", None).await;
    assert!(res.conformant);
}

#[tokio::test]
async fn test_clean_route() {
    let (app, clock) = app();
    limit(&app, Method::POST, "/fast1/old", None).await;
    clock.advance(2_000);

    let (status, body) = send(&app, Method::DELETE, "/clean", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "true");

    // The swept key no longer exists.
    let (_, body) = send(&app, Method::DELETE, "/fast1/old", None).await;
    assert_eq!(body, "false");
}
