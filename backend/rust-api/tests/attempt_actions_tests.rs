use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::json;

mod common;

#[tokio::test]
async fn test_state_without_action_returns_document() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app.call(Method::GET, "att-1", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt_id"], "att-1");
    assert_eq!(body["version"], 1);
    assert_eq!(body["completion_status"], "in_progress");
}

#[tokio::test]
async fn test_state_for_unknown_attempt_is_404() {
    let app = common::create_test_app(&[]).await;

    let (status, body) = app.call(Method::GET, "ghost", Some("state"), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "attempt_not_found");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let app = common::create_test_app(&["att-1"]).await;

    let request = Request::builder()
        .uri("/api/v1/attempts/att-1")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_save_then_stale_save_returns_latest() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app
        .call(
            Method::PATCH,
            "att-1",
            Some("save"),
            Some(json!({"answers": {"q1": "B"}, "auto_save_data": {"scroll": 300}, "expected_version": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_version"], 2);

    let (status, body) = app
        .call(
            Method::PATCH,
            "att-1",
            Some("save"),
            Some(json!({"answers": {"q1": "C"}, "expected_version": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "version_mismatch");
    assert_eq!(body["latest"]["version"], 2);
    assert_eq!(body["latest"]["answers"]["q1"], "B");
    assert_eq!(body["latest"]["auto_save_data"]["scroll"], 300);
    assert!(body["latest"]["auto_save_data"]["scroll"].is_u64());
}

#[tokio::test]
async fn test_save_with_wrong_method_is_405() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("save"),
            Some(json!({"answers": {}, "expected_version": 1})),
        )
        .await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], "method_not_allowed");
}

#[tokio::test]
async fn test_malformed_body_returns_json_400() {
    let app = common::create_test_app(&["att-1"]).await;

    let request = Request::builder()
        .method(Method::PATCH)
        .uri("/api/v1/attempts/att-1?action=save")
        .header("authorization", format!("Bearer {}", common::bearer_token("s")))
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_action_is_400() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app.call(Method::POST, "att-1", Some("grade"), None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_optimized_save_coalesces_changes() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("optimized_save"),
            Some(json!({
                "changes": [
                    {"question_id": "q1", "value": "A"},
                    {"question_id": "q1", "value": "B"},
                    {"question_id": "q1", "value": "C"}
                ],
                "config": {"interval_ms": 10}
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["version"], 2);
    assert_eq!(app.store.committed_writes(), 1);

    let (_, state) = app.call(Method::GET, "att-1", None, None).await;
    assert_eq!(state["answers"]["q1"], "C");
}

#[tokio::test]
async fn test_resolve_conflict_uses_fresh_version() {
    let app = common::create_test_app(&["att-1"]).await;
    app.call(
        Method::PATCH,
        "att-1",
        Some("save"),
        Some(json!({"answers": {"q1": "Y"}, "expected_version": 1})),
    )
    .await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("resolve_conflict"),
            Some(json!({
                "questionId": "q1",
                "resolution": "merge",
                "localValue": "X",
                "serverValue": "Y"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["version"], 3);
    assert_eq!(body["resolvedAnswer"], "X");
}

#[tokio::test]
async fn test_resolve_conflict_with_null_local_value_clears_answer() {
    let app = common::create_test_app(&["att-1"]).await;
    app.call(
        Method::PATCH,
        "att-1",
        Some("save"),
        Some(json!({"answers": {"q1": "Y"}, "expected_version": 1})),
    )
    .await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("resolve_conflict"),
            Some(json!({
                "questionId": "q1",
                "resolution": "merge",
                "localValue": null,
                "serverValue": "Y"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 3);
    assert!(body["resolvedAnswer"].is_null());

    let (_, state) = app.call(Method::GET, "att-1", None, None).await;
    assert!(state["answers"].as_object().unwrap().contains_key("q1"));
    assert!(state["answers"]["q1"].is_null());
}

#[tokio::test]
async fn test_force_sync_twice_is_identical() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, first) = app.call(Method::POST, "att-1", Some("force_sync"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = app.call(Method::POST, "att-1", Some("force_sync"), None).await;

    assert_eq!(first["status"], "refreshed");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_force_sync_with_pending_changes_reports_conflict() {
    let app = common::create_test_app(&["att-1"]).await;
    app.call(
        Method::PATCH,
        "att-1",
        Some("save"),
        Some(json!({"answers": {"q1": "server"}, "expected_version": 1})),
    )
    .await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("force_sync"),
            Some(json!({
                "localVersion": 1,
                "pendingChanges": [{"question_id": "q1", "value": "offline"}]
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "conflict");
    assert_eq!(body["server_state"]["version"], 2);
    assert_eq!(body["unresolved_changes"][0]["value"], "offline");
}

#[tokio::test]
async fn test_activity_records_actor() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app
        .call(
            Method::POST,
            "att-1",
            Some("activity"),
            Some(json!({"events": [
                {"kind": "focus_lost", "payload": {"duration_ms": 1200}},
                {"kind": "focus_gained"}
            ]})),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["inserted_count"], 2);
    let records = app.store.activity_records();
    assert_eq!(records[0].actor_id.as_deref(), Some("student-1"));

    let (_, state) = app.call(Method::GET, "att-1", None, None).await;
    assert_eq!(state["version"], 1);
}

#[tokio::test]
async fn test_submit_closes_attempt_for_good() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app.call(Method::POST, "att-1", Some("submit"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["completion_status"], "submitted");
    assert_eq!(body["version"], 2);

    for expected_version in [1, 2, 3] {
        let (status, body) = app
            .call(
                Method::PATCH,
                "att-1",
                Some("save"),
                Some(json!({"answers": {"q1": "late"}, "expected_version": expected_version})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "attempt_closed");
    }

    let (status, body) = app.call(Method::POST, "att-1", Some("submit"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "attempt_closed");
}

#[tokio::test]
async fn test_invalid_question_key_is_400() {
    let app = common::create_test_app(&["att-1"]).await;

    let (status, body) = app
        .call(
            Method::PATCH,
            "att-1",
            Some("save"),
            Some(json!({"answers": {"$where": "1"}, "expected_version": 1})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(app.store.committed_writes(), 0);
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let app = common::create_test_app(&["att-1"]).await;
    app.store.fail_next_calls(2);

    let (status, body) = app
        .call(
            Method::PATCH,
            "att-1",
            Some("save"),
            Some(json!({"answers": {"q1": "A"}, "expected_version": 1})),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_version"], 2);
}

#[tokio::test]
async fn test_exhausted_store_retries_return_503() {
    let app = common::create_test_app(&["att-1"]).await;
    app.store.fail_next_calls(10);

    let (status, body) = app
        .call(
            Method::PATCH,
            "att-1",
            Some("save"),
            Some(json!({"answers": {"q1": "A"}, "expected_version": 1})),
        )
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "transient_store_error");
}

#[tokio::test]
async fn test_health_reports_dependencies_and_load() {
    let app = common::create_test_app(&["att-1"]).await;
    app.call(
        Method::POST,
        "att-1",
        Some("realtime"),
        Some(json!({"op": "init_monitoring", "connection_id": "conn-1"})),
    )
    .await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["attempt_store"]["healthy"], true);
    assert_eq!(body["dependencies"]["state_cache"]["healthy"], true);
    assert_eq!(body["sync"]["live_sessions"], 1);
}

#[tokio::test]
async fn test_trace_id_is_echoed() {
    let app = common::create_test_app(&[]).await;

    let request = Request::builder()
        .uri("/health")
        .header("x-trace-id", "trace-abc")
        .body(Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.router.clone(), request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-trace-id"], "trace-abc");
}
