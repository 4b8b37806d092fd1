use std::sync::Arc;
use std::time::Duration;

use atmeex_cloud::{ApiError, CloudClient, DeviceId, Error, MessageLogMode, SessionStatus};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn password() -> SecretString {
    SecretString::from("pw-secret")
}

async fn mount_auth(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": token })))
        .mount(server)
        .await;
}

async fn signed_in(server: &MockServer) -> CloudClient {
    mount_auth(server, "tok-1").await;
    let client = CloudClient::builder()
        .base_url(server.uri())
        .build()
        .expect("client should build");
    client
        .authenticate("me@example.com", password())
        .await
        .expect("sign-in should succeed");
    client
}

#[tokio::test]
async fn authenticate_posts_credentials() {
    let server = MockServer::start().await;
    let expiry = chrono::Utc::now().timestamp() + 3600;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .and(body_json(json!({"email": "me@example.com", "password": "pw-secret"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": "tok-1", "expiry": expiry, "account": "acc-9"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = CloudClient::builder().base_url(server.uri()).build().unwrap();
    assert_eq!(client.session_status(), None);
    client
        .authenticate("me@example.com", password())
        .await
        .unwrap();

    assert_eq!(client.session_status(), Some(SessionStatus::Valid));
    assert_eq!(client.account().as_deref(), Some("acc-9"));
}

#[tokio::test]
async fn session_without_expiry_is_unknown() {
    let server = MockServer::start().await;
    let client = signed_in(&server).await;
    assert_eq!(client.session_status(), Some(SessionStatus::Unknown));
}

#[tokio::test]
async fn rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad login"))
        .expect(1)
        .mount(&server)
        .await;

    let client = CloudClient::builder().base_url(server.uri()).build().unwrap();
    let err = client
        .authenticate("me@example.com", password())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Auth { .. }), "got {err:?}");
    assert_eq!(client.session_status(), None);
}

#[tokio::test]
async fn list_devices_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 101, "name": "Bedroom", "settings": {"u_hum_stg": 0}},
            {"id": "102"},
            {"name": "no id"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = signed_in(&server).await;
    let devices = client.list_devices().await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, DeviceId::from(101u64));
    assert!(devices[0].has_humidifier());
    assert_eq!(devices[1].name, "Atmeex 102");
    assert!(!devices[1].has_humidifier());
}

#[tokio::test]
async fn expired_session_reauthenticates_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-1"})))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"devices": [{"id": 1}]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = CloudClient::builder().base_url(server.uri()).build().unwrap();
    client
        .authenticate("me@example.com", password())
        .await
        .unwrap();

    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn second_rejection_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok"})))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let client = CloudClient::builder().base_url(server.uri()).build().unwrap();
    client
        .authenticate("me@example.com", password())
        .await
        .unwrap();

    let err = client.list_devices().await.unwrap_err();
    assert!(err.is_auth_expired());
    assert_eq!(client.session_status(), Some(SessionStatus::Expired));
}

#[tokio::test]
async fn server_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&server)
        .await;

    let client = signed_in(&server).await;
    let err = client.list_devices().await.unwrap_err();

    assert!(err.is_transient());
    assert!(matches!(
        err,
        Error::Api(ApiError::Status { status: 503, ref body }) if body == "maintenance"
    ));
}

#[tokio::test]
async fn malformed_response_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = signed_in(&server).await;
    let err = client.list_devices().await.unwrap_err();
    assert!(matches!(err, Error::Api(ApiError::Decode { .. })), "got {err:?}");
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/devices/1/state"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let client = CloudClient::builder()
        .base_url(server.uri())
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    client
        .authenticate("me@example.com", password())
        .await
        .unwrap();

    let err = client
        .fetch_state(&DeviceId::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Api(ApiError::Timeout)), "got {err:?}");
}

#[tokio::test]
async fn fetch_state_returns_raw_payload() {
    let server = MockServer::start().await;
    let body = json!({"settings": {"u_pwr_on": true}, "condition": {"temp_in": -100}});
    Mock::given(method("GET"))
        .and(path("/devices/9/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
        .mount(&server)
        .await;

    let client = signed_in(&server).await;
    let raw = client.fetch_state(&DeviceId::from(9u64)).await.unwrap();
    assert_eq!(raw, body);
}

#[tokio::test]
async fn send_command_patches_state() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/devices/7/state"))
        .and(header("authorization", "Bearer tok-1"))
        .and(body_json(json!({"u_fan_speed": 3})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = signed_in(&server).await;
    client
        .send_command(&DeviceId::from(7u64), &json!({"u_fan_speed": 3}))
        .await
        .unwrap();
}

#[tokio::test]
async fn closed_client_rejects_requests() {
    let server = MockServer::start().await;
    let client = signed_in(&server).await;

    assert!(client.close());
    assert!(!client.close());

    let err = client.list_devices().await.unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert_eq!(client.session_status(), None);
}

#[tokio::test]
async fn close_aborts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = Arc::new(signed_in(&server).await);
    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.list_devices().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close();

    let result = tokio::time::timeout(Duration::from_secs(1), in_flight)
        .await
        .expect("request should stop promptly")
        .unwrap();
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn wire_capture_redacts_password() {
    let server = MockServer::start().await;
    mount_auth(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/devices/3/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"online": true})))
        .mount(&server)
        .await;

    let tmp = tempfile::NamedTempFile::new().unwrap();
    let client = CloudClient::builder()
        .base_url(server.uri())
        .message_log(MessageLogMode::Full, tmp.path())
        .build()
        .unwrap();
    client
        .authenticate("me@example.com", password())
        .await
        .unwrap();
    client.fetch_state(&DeviceId::from(3u64)).await.unwrap();

    let capture = std::fs::read_to_string(tmp.path()).unwrap();
    assert!(!capture.contains("pw-secret"));
    assert!(capture.contains("<redacted>"));

    let lines: Vec<serde_json::Value> = capture
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let state = lines.iter().find(|l| l["dir"] == "state").unwrap();
    assert_eq!(state["device"], "3");
    assert_eq!(state["body"]["online"], true);
}
