//! Client integration tests against a mocked vellum-meter API.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vellum_meter_client::{
    ClientError, ClientOptions, MeterClient, RefundRequest, TelemetryKind, TelemetryRequest,
};

#[tokio::test]
async fn consume_returns_quota_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/quota/consume"))
        .and(header("authorization", "Bearer user-jwt"))
        .and(body_partial_json(json!({ "cost": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "limit": 100,
            "used": 7,
            "remaining": 93,
            "reset_at": "2026-10-01T00:00:00Z",
            "authenticated": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let status = client.consume_as_user("user-jwt", 1).await.unwrap();
    assert_eq!(status.remaining, 93);
    assert!(status.authenticated);
    assert!(status.reset_at.is_some());
}

#[tokio::test]
async fn quota_exceeded_maps_to_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/quota/consume"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": {
                "code": "quota_exceeded",
                "message": "quota exceeded: 10/10",
                "details": { "limit": 10, "used": 10, "reset_at": null }
            }
        })))
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let err = client
        .consume_as_visitor("0191a2b3-0000-7000-8000-000000000000", 1)
        .await
        .unwrap_err();
    match err {
        ClientError::QuotaExceeded {
            limit,
            used,
            reset_at,
        } => {
            assert_eq!(limit, 10);
            assert_eq!(used, 10);
            assert!(reset_at.is_none());
        }
        other => panic!("expected QuotaExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn visitor_consume_sends_session_cookie() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/quota/consume"))
        .and(header("cookie", "vm_session=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "limit": 10,
            "used": 1,
            "remaining": 9,
            "reset_at": null,
            "authenticated": false,
            "session_id": "abc"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let status = client.consume_as_visitor("abc", 1).await.unwrap();
    assert!(!status.authenticated);
    assert_eq!(status.session_id.as_deref(), Some("abc"));
}

#[tokio::test]
async fn refund_requires_api_key() {
    let client = MeterClient::new("http://localhost:1");
    let err = client
        .refund(RefundRequest {
            user_id: Some("user-uuid".into()),
            session_id: None,
            amount: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Configuration(_)));
}

#[tokio::test]
async fn refund_sends_service_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/quota/refund"))
        .and(header("x-api-key", "service-key"))
        .and(header("x-service-name", "chat-backend"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "limit": 100,
            "used": 5,
            "remaining": 95,
            "reset_at": null,
            "authenticated": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = MeterClient::with_options(
        server.uri(),
        ClientOptions::with_service_key("service-key", "chat-backend"),
    );
    let status = client
        .refund(RefundRequest {
            user_id: Some("user-uuid".into()),
            session_id: None,
            amount: 2,
        })
        .await
        .unwrap();
    assert_eq!(status.used, 5);
}

#[tokio::test]
async fn telemetry_serializes_kind_as_snake_case() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/telemetry"))
        .and(body_partial_json(json!({ "kind": "page_view" })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "session_id": "s",
            "record_id": "r",
            "new_session": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let response = client
        .record_telemetry(TelemetryRequest {
            session_id: None,
            kind: TelemetryKind::PageView,
            conversation_id: None,
            payload: json!({ "path": "/" }),
        })
        .await
        .unwrap();
    assert!(response.new_session);
}

#[tokio::test]
async fn unknown_session_maps_to_typed_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sessions/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "code": "not_found",
                "message": "not found: session missing",
                "details": null
            }
        })))
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let err = client.get_session("missing").await.unwrap_err();
    assert!(matches!(err, ClientError::SessionNotFound { .. }));
}

#[tokio::test]
async fn unparseable_error_body_falls_back_to_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/quota/status"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let client = MeterClient::new(server.uri());
    let err = client.quota_status("user-jwt").await.unwrap_err();
    match err {
        ClientError::Api { code, status, .. } => {
            assert_eq!(code, "unknown");
            assert_eq!(status, 503);
        }
        other => panic!("expected Api, got {other:?}"),
    }
}
