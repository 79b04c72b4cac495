use super::{auth_payload, credential_store, envelope, settings};
use chrono::Utc;
use opswatch::build_session;
use opswatch_core::{ApiError, Credential, SessionEvent};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn user_json() -> serde_json::Value {
    json!({
        "id": 7,
        "username": "oncall",
        "email": "oncall@example.com",
        "role": "admin",
        "status": "active"
    })
}

#[tokio::test]
async fn login_persists_the_credential() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .and(body_json(json!({"username": "oncall", "password": "hunter2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_payload("token-a", "refresh-0")))
        .expect(1)
        .mount(&server)
        .await;

    let session = build_session(&settings(&server, &dir)).expect("session");
    let user = session.login("oncall", "hunter2").await.expect("login");
    assert_eq!(user.username, "oncall");
    assert!(session.is_authenticated());
    assert!(session.watchdog().is_running());

    let persisted = credential_store(&dir).load().unwrap().expect("persisted");
    assert_eq!(persisted.access_token, "token-a");
    assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-0"));
    assert!(persisted.expires_at.unwrap() > Utc::now() + chrono::Duration::minutes(59));
}

#[tokio::test]
async fn bad_password_surfaces_server_message() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"code": 10001, "message": "invalid username or password"})),
        )
        .mount(&server)
        .await;

    let session = build_session(&settings(&server, &dir)).expect("session");
    let err = session.login("oncall", "wrong").await.unwrap_err();
    assert_eq!(err.user_message(), "invalid username or password");
    assert!(!session.is_authenticated());
}

#[tokio::test]
async fn restore_refreshes_an_expired_credential() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    credential_store(&dir)
        .set(Credential::new(
            "old",
            Some("refresh-0".into()),
            Some(Utc::now() - chrono::Duration::minutes(5)),
        ))
        .unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_payload("new", "refresh-1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/user/me"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(user_json())))
        .expect(1)
        .mount(&server)
        .await;

    let session = build_session(&settings(&server, &dir)).expect("session");
    let user = session.restore().await.expect("restore").expect("signed in");
    assert!(user.is_admin());
    assert_eq!(
        session.client().credentials().access_token().as_deref(),
        Some("new")
    );
}

#[tokio::test]
async fn restore_without_refresh_token_signs_out() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    credential_store(&dir)
        .set(Credential::new(
            "old",
            None,
            Some(Utc::now() - chrono::Duration::minutes(5)),
        ))
        .unwrap();

    let session = build_session(&settings(&server, &dir)).expect("session");
    let mut events = session.events();
    assert!(session.restore().await.expect("restore").is_none());
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
    assert!(credential_store(&dir).load().unwrap().is_none());
}

#[tokio::test]
async fn logout_clears_and_announces_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path("/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_payload("token-a", "refresh-0")))
        .mount(&server)
        .await;

    let session = build_session(&settings(&server, &dir)).expect("session");
    session.login("oncall", "hunter2").await.expect("login");
    let mut events = session.events();

    session.logout();
    session.logout();

    assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
    assert!(events.try_recv().is_err());
    assert!(!session.is_authenticated());
    assert!(!session.watchdog().is_running());
    assert!(credential_store(&dir).load().unwrap().is_none());
}

#[tokio::test]
async fn change_password_requires_success_code() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("PUT"))
        .and(path("/v1/user/password"))
        .and(body_json(json!({"old_password": "a", "new_password": "b"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 400, "message": "old password mismatch"})),
        )
        .mount(&server)
        .await;

    let session = build_session(&settings(&server, &dir)).expect("session");
    let err = session.change_password("a", "b").await.unwrap_err();
    assert_eq!(err, ApiError::Application("old password mismatch".into()));
}
