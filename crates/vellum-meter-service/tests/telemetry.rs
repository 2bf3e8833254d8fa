//! Telemetry and session endpoint integration tests.

mod common;

use common::TestHarness;
use serde_json::json;
use vellum_meter_core::SessionId;

async fn record(
    harness: &TestHarness,
    body: serde_json::Value,
) -> serde_json::Value {
    let response = harness.server.post("/v1/telemetry").json(&body).await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    response.json()
}

#[tokio::test]
async fn page_view_opens_session_and_rolls_up() {
    let harness = TestHarness::new();

    let body = record(
        &harness,
        json!({ "kind": "page_view", "payload": { "path": "/" } }),
    )
    .await;
    assert_eq!(body["new_session"], true);
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let response = harness.server.get(&format!("/v1/sessions/{session_id}")).await;
    response.assert_status_ok();
    let session: serde_json::Value = response.json();
    assert_eq!(session["page_views"], 1);
    assert_eq!(session["events_count"], 0);
    assert_eq!(session["bounce"], true);
    assert_eq!(session["active"], true);
}

#[tokio::test]
async fn session_cookie_attributes_records() {
    let harness = TestHarness::new();
    let session_id = SessionId::generate();
    let cookie = TestHarness::session_cookie_header(session_id);

    let response = harness
        .server
        .post("/v1/telemetry")
        .add_header("cookie", cookie)
        .json(&json!({ "kind": "page_view", "payload": { "path": "/" } }))
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["session_id"], session_id.to_string());
}

#[tokio::test]
async fn second_interaction_clears_bounce() {
    let harness = TestHarness::new();

    let first = record(
        &harness,
        json!({ "kind": "page_view", "payload": { "path": "/" } }),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    record(
        &harness,
        json!({
            "session_id": session_id,
            "kind": "event",
            "payload": { "name": "click" }
        }),
    )
    .await;

    let response = harness.server.get(&format!("/v1/sessions/{session_id}")).await;
    let session: serde_json::Value = response.json();
    assert_eq!(session["page_views"], 1);
    assert_eq!(session["events_count"], 1);
    assert_eq!(session["bounce"], false);
}

#[tokio::test]
async fn ended_session_is_not_resurrected() {
    let harness = TestHarness::new();

    let first = record(
        &harness,
        json!({ "kind": "page_view", "payload": { "path": "/" } }),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    harness
        .server
        .post(&format!("/v1/sessions/{session_id}/end"))
        .await
        .assert_status_ok();

    let after = record(
        &harness,
        json!({
            "session_id": session_id,
            "kind": "page_view",
            "payload": { "path": "/back" }
        }),
    )
    .await;
    assert_ne!(after["session_id"], session_id);
    assert_eq!(after["new_session"], true);

    let response = harness.server.get(&format!("/v1/sessions/{session_id}")).await;
    let session: serde_json::Value = response.json();
    assert_eq!(session["active"], false);
    assert_eq!(session["page_views"], 1);
}

#[tokio::test]
async fn ending_twice_is_a_noop() {
    let harness = TestHarness::new();

    let first = record(
        &harness,
        json!({ "kind": "page_view", "payload": { "path": "/" } }),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    let once = harness
        .server
        .post(&format!("/v1/sessions/{session_id}/end"))
        .await;
    once.assert_status_ok();
    let first_end: serde_json::Value = once.json();

    let twice = harness
        .server
        .post(&format!("/v1/sessions/{session_id}/end"))
        .await;
    twice.assert_status_ok();
    let second_end: serde_json::Value = twice.json();
    assert_eq!(first_end["ended_at"], second_end["ended_at"]);
}

#[tokio::test]
async fn chat_turn_requires_conversation_id() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/v1/telemetry")
        .json(&json!({ "kind": "chat_turn", "payload": {} }))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_turns_aggregate_per_conversation() {
    let harness = TestHarness::new();
    let conversation_id = vellum_meter_core::ConversationId::generate();

    let first = record(
        &harness,
        json!({ "kind": "page_view", "payload": { "path": "/chat" } }),
    )
    .await;
    let session_id = first["session_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        record(
            &harness,
            json!({
                "session_id": session_id,
                "kind": "chat_turn",
                "conversation_id": conversation_id.to_string(),
                "payload": { "tokens": 17 }
            }),
        )
        .await;
    }

    let response = harness
        .server
        .get(&format!("/v1/conversations/{conversation_id}"))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["turns"], 2);

    // Chat turns touch neither session counter.
    let response = harness.server.get(&format!("/v1/sessions/{session_id}")).await;
    let session: serde_json::Value = response.json();
    assert_eq!(session["page_views"], 1);
    assert_eq!(session["events_count"], 0);
}

#[tokio::test]
async fn unknown_session_returns_404() {
    let harness = TestHarness::new();
    let response = harness
        .server
        .get(&format!("/v1/sessions/{}", SessionId::generate()))
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn malformed_session_id_returns_400() {
    let harness = TestHarness::new();
    let response = harness.server.get("/v1/sessions/not-a-uuid").await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_kind_is_rejected() {
    let harness = TestHarness::new();
    let response = harness
        .server
        .post("/v1/telemetry")
        .json(&json!({ "kind": "pageview" }))
        .await;
    // Serde rejects the unknown kind before the handler runs.
    response.assert_status(axum::http::StatusCode::UNPROCESSABLE_ENTITY);
}
