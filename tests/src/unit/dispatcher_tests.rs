use super::{auth_payload, envelope, settings, signed_in_client};
use opswatch_core::{ApiError, RequestConfig, SessionEvent};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_refresh(server: &MockServer, token: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .and(body_json(json!({"refresh_token": "refresh-0"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(auth_payload(token, "refresh-1"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn unwraps_data_and_sends_bearer() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/hosts"))
        .and(query_param("status", "online"))
        .and(header("authorization", "Bearer token-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([{"id": "web-1"}]))))
        .expect(1)
        .mount(&server)
        .await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "token-a");
    let hosts: Value = client
        .dispatch(RequestConfig::get("/v1/hosts").query("status", "online"))
        .await
        .expect("hosts");
    assert_eq!(hosts[0]["id"], "web-1");
}

#[tokio::test]
async fn envelope_401_inside_http_200_is_not_an_auth_failure() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/alerts"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 401, "message": "no permission"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, "unused", 0).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "token-a");
    let err = client.get::<Value>("/v1/alerts").await.unwrap_err();
    assert_eq!(err, ApiError::Application("no permission".into()));
    assert!(client.credentials().is_authenticated());
}

#[tokio::test]
async fn refreshes_once_and_retries_with_new_token() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/metrics"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/metrics"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"cpu": 0.42}))))
        .expect(1)
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh", 1).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "stale");
    let metrics: Value = client.get("/v1/metrics").await.expect("metrics");
    assert_eq!(metrics["cpu"], 0.42);
    assert_eq!(client.credentials().access_token().as_deref(), Some("fresh"));
    assert_eq!(
        client.credentials().refresh_token().as_deref(),
        Some("refresh-1")
    );
}

#[tokio::test]
async fn concurrent_401s_share_a_single_refresh() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/services"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/services"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"ok": true}))))
        .expect(6)
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh", 1).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "stale");
    let calls = (0..6).map(|_| {
        let client = client.clone();
        tokio::spawn(async move { client.get::<Value>("/v1/services").await })
    });
    for result in futures::future::join_all(calls).await {
        assert_eq!(result.expect("join").expect("call")["ok"], true);
    }
}

#[tokio::test]
async fn second_401_is_final() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/users"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh", 1).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "stale");
    let mut events = client.coordinator().subscribe();

    let err = client.get::<Value>("/v1/users").await.unwrap_err();
    assert_eq!(err, ApiError::Unauthorized);
    assert!(!client.credentials().is_authenticated());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn failed_refresh_expires_every_waiting_call() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/knowledge"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"code": 10002, "message": "refresh token expired"}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "stale");
    let (a, b, c) = tokio::join!(
        client.get::<Value>("/v1/knowledge"),
        client.get::<Value>("/v1/knowledge"),
        client.get::<Value>("/v1/knowledge"),
    );
    for result in [a, b, c] {
        assert_eq!(result.unwrap_err(), ApiError::AuthExpired);
    }
    assert!(!client.credentials().is_authenticated());
    assert!(super::credential_store(&dir).load().unwrap().is_none());
}

#[tokio::test]
async fn per_call_timeout_applies() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(json!(null)))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "token-a");
    let err = client
        .dispatch::<Value>(RequestConfig::get("/v1/slow").timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn long_timeout_survives_the_retry() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/anomalies/detect"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/anomalies/detect"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(json!({"count": 2})))
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh", 1).await;

    let mut settings = settings(&server, &dir);
    settings.request_timeout = Duration::from_millis(300);
    let client = signed_in_client(&settings, &dir, "stale");
    let result: Value = client
        .dispatch(RequestConfig::post("/v1/anomalies/detect").timeout(Duration::from_secs(5)))
        .await
        .expect("detection");
    assert_eq!(result["count"], 2);
}

#[tokio::test]
async fn server_errors_are_network_errors() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("DELETE"))
        .and(path("/v1/alerts/rules/3"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    mount_refresh(&server, "unused", 0).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "token-a");
    let err = client.delete::<Value>("/v1/alerts/rules/3").await.unwrap_err();
    assert!(matches!(err, ApiError::Network { status: Some(503), .. }));
}

#[tokio::test]
async fn unauthenticated_calls_carry_no_header() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!("up"))))
        .mount(&server)
        .await;

    let client = opswatch_core::ApiClient::new(&settings(&server, &dir), super::credential_store(&dir))
        .expect("client");
    let status: String = client.get("/v1/health").await.expect("health");
    assert_eq!(status, "up");

    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn late_401_after_rotation_retries_without_refreshing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path("/v1/fast"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/slow"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!(1))))
        .expect(2)
        .mount(&server)
        .await;
    mount_refresh(&server, "fresh", 1).await;

    let client = signed_in_client(&settings(&server, &dir), &dir, "stale");
    let (fast, slow) = tokio::join!(
        client.get::<i64>("/v1/fast"),
        client.get::<i64>("/v1/slow"),
    );
    assert_eq!(fast.expect("fast"), 1);
    assert_eq!(slow.expect("slow"), 1);
    assert_eq!(client.credentials().access_token().as_deref(), Some("fresh"));
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let dir = TempDir::new().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let settings = opswatch_core::ClientSettings {
        base_url: format!("http://127.0.0.1:{port}"),
        request_timeout: Duration::from_secs(2),
        credentials_dir: dir.path().to_path_buf(),
        ..opswatch_core::ClientSettings::default()
    };

    let client = signed_in_client(&settings, &dir, "token-a");
    let err = client.get::<Value>("/v1/hosts").await.unwrap_err();
    assert!(matches!(err, ApiError::Network { status: None, .. }), "{err:?}");
    assert!(client.credentials().is_authenticated());
}
