//! Routing and middleware dispatch through a live proxy:
//! host/path matching, middleware rejection, CORS preflight, and the
//! injected response headers.

#[path = "common/mod.rs"]
mod common;

use common::{proxy_get, proxy_request, spawn_marker_upstream, TestProxy};

use bytes::Bytes;
use hyper::StatusCode;

#[tokio::test]
async fn test_wildcard_host_routing() {
    let backend = spawn_marker_upstream("from-web").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "*.example.com"
    target: "web"
services:
  web:
    url: "http://{backend}"
"#
    ))
    .await;

    let (status, body) = proxy_get(proxy.port, "app.example.com", "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "from-web");

    // The bare domain matches the wildcard too.
    let (status, _) = proxy_get(proxy.port, "example.com", "/").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_unmatched_host_is_502() {
    let backend = spawn_marker_upstream("unused").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
services:
  web:
    url: "http://{backend}"
"#
    ))
    .await;

    let (status, body) = proxy_get(proxy.port, "other.org", "/").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body.contains("no matching rule found"), "{body}");
}

#[tokio::test]
async fn test_route_rules_split_traffic_with_host_fallback() {
    let api = spawn_marker_upstream("from-api").await;
    let web = spawn_marker_upstream("from-web").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
    route_rules:
      - pattern: "/api/*"
        target: "api"
services:
  web:
    url: "http://{web}"
  api:
    url: "http://{api}"
"#
    ))
    .await;

    let (_, body) = proxy_get(proxy.port, "example.com", "/api/users").await;
    assert_eq!(body, "from-api");

    let (_, body) = proxy_get(proxy.port, "example.com", "/index.html").await;
    assert_eq!(body, "from-web");
}

#[tokio::test]
async fn test_proxy_headers_are_injected() {
    let backend = spawn_marker_upstream("ok").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
services:
  web:
    url: "http://{backend}"
"#
    ))
    .await;

    let response = proxy_request(
        proxy.port,
        "GET",
        "example.com",
        "/",
        &[],
        Bytes::new(),
    )
    .await;

    assert_eq!(response.headers().get("x-proxy-by").unwrap(), "crossway");
    assert_eq!(
        response.headers().get("x-target-service").unwrap(),
        "127.0.0.1"
    );
}

#[tokio::test]
async fn test_auth_middleware_gates_a_route() {
    let backend = spawn_marker_upstream("secret-data").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
    middlewares: ["auth"]
services:
  web:
    url: "http://{backend}"
middlewares:
  - name: "auth"
    enabled: true
    config:
      header: "Authorization"
      keys: ["sesame"]
"#
    ))
    .await;

    let (status, body) = proxy_get(proxy.port, "example.com", "/").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.contains("Missing authentication header"));

    let response = proxy_request(
        proxy.port,
        "GET",
        "example.com",
        "/",
        &[("authorization", "Bearer wrong")],
        Bytes::new(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = proxy_request(
        proxy.port,
        "GET",
        "example.com",
        "/",
        &[("authorization", "Bearer sesame")],
        Bytes::new(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), "secret-data");
}

#[tokio::test]
async fn test_cors_preflight_short_circuits() {
    let backend = spawn_marker_upstream("never-reached").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
services:
  web:
    url: "http://{backend}"
middlewares:
  - name: "cors"
    enabled: true
    config:
      allowed_origins: ["https://app.example.com"]
      allowed_methods: ["GET", "POST"]
"#
    ))
    .await;

    let response = proxy_request(
        proxy.port,
        "OPTIONS",
        "example.com",
        "/api/data",
        &[("origin", "https://app.example.com")],
        Bytes::new(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "https://app.example.com"
    );
    assert!(response.body().is_empty());
}

#[tokio::test]
async fn test_hidden_paths_are_denied_when_configured() {
    let backend = spawn_marker_upstream("ok").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
services:
  web:
    url: "http://{backend}"
advanced:
  security:
    deny_hidden_files: true
"#
    ))
    .await;

    let (status, _) = proxy_get(proxy.port, "example.com", "/.env").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = proxy_get(proxy.port, "example.com", "/app/.git/config").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = proxy_get(proxy.port, "example.com", "/visible").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_middleware_answers_429() {
    let backend = spawn_marker_upstream("ok").await;
    let proxy = TestProxy::start(&format!(
        r#"
host_rules:
  - pattern: "example.com"
    target: "web"
    middlewares: ["rate_limit"]
services:
  web:
    url: "http://{backend}"
middlewares:
  - name: "rate_limit"
    enabled: true
    config:
      requests_per_minute: 2
      burst_size: 0
"#
    ))
    .await;

    let headers = [("x-real-ip", "198.51.100.7")];
    for _ in 0..2 {
        let response = proxy_request(
            proxy.port,
            "GET",
            "example.com",
            "/",
            &headers,
            Bytes::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = proxy_request(
        proxy.port,
        "GET",
        "example.com",
        "/",
        &headers,
        Bytes::new(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
