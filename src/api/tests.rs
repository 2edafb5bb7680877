use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use super::AppState;
use crate::chain::RemoteTotals;
use crate::ledger::models::{SagaKind, SagaStatus};
use crate::ledger::LedgerStore;
use crate::middleware::{RateLimitLayer, OPERATOR_TOKEN_HEADER};
use crate::saga::mocks::{origin_event, Harness, ALICE};
use crate::saga::SagaRequest;
use crate::server::create_app;

const TOKEN: &str = "operator-secret";

fn state(harness: &Harness, token: Option<&str>, per_minute: u32) -> AppState {
    AppState {
        ledger: harness.ledger.clone(),
        coordinator: harness.coordinator.clone(),
        remote: harness.remote.clone(),
        origin: harness.origin.clone(),
        cursor_stream: "origin_vault:test".to_string(),
        stale_after: chrono::Duration::minutes(15),
        started_at: Instant::now(),
        operator_token: token.map(str::to_string),
        manual_limiter: RateLimitLayer::per_minute(per_minute).unwrap(),
    }
}

async fn app(harness: &Harness) -> Router {
    create_app(state(harness, Some(TOKEN), 100), &[]).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(OPERATOR_TOKEN_HEADER, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn deposit(harness: &Harness, amount: u128, block: u64) -> String {
    let request = SagaRequest::from(&origin_event(SagaKind::Deposit, ALICE, amount, block, 0));
    let id = request.id.clone();
    harness.coordinator.ingest(request).await.unwrap();
    harness.coordinator.wait_idle().await;
    id
}

#[tokio::test]
async fn test_health_turns_degraded_on_terminal_saga() {
    let harness = Harness::new();
    harness.ledger.set_cursor("origin_vault:test", 321).await.unwrap();
    let app = app(&harness).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["last_processed_block"], 321);
    assert_eq!(body["origin_vault"], "0x00000000000000000000000000000000000000bB");

    let withdraw = SagaRequest::from(&origin_event(SagaKind::Withdraw, ALICE, 5_000000, 40, 0));
    harness.coordinator.ingest(withdraw).await.unwrap();
    harness.coordinator.wait_idle().await;

    let (_, body) = send(&app, get("/health")).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["failed_terminal"], 1);
}

#[tokio::test]
async fn test_health_survives_widest_stale_window() {
    let harness = Harness::new();
    let mut state = state(&harness, Some(TOKEN), 100);
    state.stale_after = chrono::Duration::try_seconds(i64::MAX / 1000).unwrap();
    let app = create_app(state, &[]).await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stale_sagas"], 0);

    let (status, _) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_balance_normalizes_address_and_formats_units() {
    let harness = Harness::new();
    deposit(&harness, 100_000000, 10).await;
    harness.origin.set_balance(ALICE, 100_000000);
    let app = app(&harness).await;

    let (status, body) = send(&app, get(&format!("/balance/{}", ALICE.to_lowercase()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], ALICE);
    assert_eq!(body["vault_balance"], "100.000000");
    assert_eq!(body["principal"], "102.000000");
    assert_eq!(body["remote_shares"], "102.000000");
    assert_eq!(body["yield_earned"], "0.000000");
    assert_eq!(body["onchain_shares"], "0.000000");
    assert_eq!(body["state"], "ACTIVE");

    let (status, body) = send(&app, get("/balance/0x1234")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "INVALID_ADDRESS");
}

#[tokio::test]
async fn test_unknown_user_reads_as_empty_position() {
    let harness = Harness::new();
    let app = app(&harness).await;

    let (status, body) = send(&app, get(&format!("/user/{ALICE}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["position"]["state"], "EMPTY");
    assert_eq!(body["position"]["principal"], "0.000000");
    assert_eq!(body["recent_sagas"], json!([]));
}

#[tokio::test]
async fn test_user_lists_recent_sagas() {
    let harness = Harness::new();
    let id = deposit(&harness, 100_000000, 10).await;
    let app = app(&harness).await;

    let (_, body) = send(&app, get(&format!("/user/{ALICE}"))).await;
    let sagas = body["recent_sagas"].as_array().unwrap();
    assert_eq!(sagas.len(), 1);
    assert_eq!(sagas[0]["id"], id);
    assert_eq!(sagas[0]["status"], "COMPLETED");
    assert_eq!(sagas[0]["input_amount"], "100.000000");
    assert_eq!(sagas[0]["converted_amount"], "102.000000");
    assert_eq!(sagas[0]["rate"], "1.02");
}

#[tokio::test]
async fn test_global_and_stats_include_remote_totals() {
    let harness = Harness::new();
    deposit(&harness, 100_000000, 10).await;
    harness.remote.set_totals(RemoteTotals {
        total_supplied: 102_000000,
        total_assets: 110_500000,
    });
    let app = app(&harness).await;

    let (status, body) = send(&app, get("/global")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_principal"], "102.000000");
    assert_eq!(body["active_users"], 1);
    assert_eq!(body["remote_total_assets"], "110.500000");

    let (status, body) = send(&app, get("/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_yield"], "8.500000");
    assert_eq!(
        body["sagas"],
        json!([{ "kind": "DEPOSIT", "status": "COMPLETED", "count": 1 }])
    );
}

#[tokio::test]
async fn test_saga_detail_includes_audit_trail() {
    let harness = Harness::new();
    let id = deposit(&harness, 100_000000, 10).await;
    let app = app(&harness).await;

    let (status, body) = send(&app, get(&format!("/saga/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["saga"]["step"], "COMPLETED");
    let events: Vec<&str> = body["audit"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(events.first(), Some(&"RECEIVED"));
    assert_eq!(events.last(), Some(&"COMPLETED"));

    let (status, _) = send(&app, get("/saga/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_deposit_is_gated_and_idempotent() {
    let harness = Harness::new();
    let app = app(&harness).await;
    let body = json!({ "user": ALICE, "amount": "100", "reference": "ticket-7" });

    let (status, response) = send(&app, post("/manual/deposit", None, body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error_code"], "UNAUTHORIZED");

    let (status, _) = send(&app, post("/manual/deposit", Some("wrong"), body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, response) = send(&app, post("/manual/deposit", Some(TOKEN), body.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["outcome"], "created");
    assert_eq!(response["saga"]["id"], "manual:ticket-7");
    assert_eq!(response["saga"]["trigger"], "MANUAL");
    harness.coordinator.wait_idle().await;

    let (status, response) = send(&app, post("/manual/deposit", Some(TOKEN), body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "duplicate");
    assert_eq!(harness.remote.count("supply"), 1);
}

#[tokio::test]
async fn test_manual_deposit_by_origin_log_matches_watcher_id() {
    let harness = Harness::new();
    let event = origin_event(SagaKind::Deposit, ALICE, 100_000000, 10, 3);
    let watcher_id = deposit_event(&harness, &event).await;
    let app = app(&harness).await;

    let body = json!({
        "user": ALICE,
        "amount": "100",
        "tx_hash": event.tx_hash,
        "log_index": 3,
    });
    let (status, response) = send(&app, post("/manual/deposit", Some(TOKEN), body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "duplicate");
    assert_eq!(response["saga"]["id"], watcher_id);
}

async fn deposit_event(harness: &Harness, event: &crate::chain::OriginEvent) -> String {
    let request = SagaRequest::from(event);
    let id = request.id.clone();
    harness.coordinator.ingest(request).await.unwrap();
    harness.coordinator.wait_idle().await;
    id
}

#[tokio::test]
async fn test_manual_requests_are_validated() {
    let harness = Harness::new();
    let app = app(&harness).await;

    let cases = [
        json!({ "user": "0x12", "amount": "1", "reference": "a" }),
        json!({ "user": ALICE, "amount": "1.0000001", "reference": "a" }),
        json!({ "user": ALICE, "amount": "1", "tx_hash": format!("0x{}", "ab".repeat(32)) }),
        json!({ "user": ALICE, "amount": "1" }),
        json!({ "user": ALICE }),
    ];
    for case in cases {
        let (status, body) = send(&app, post("/manual/deposit", Some(TOKEN), case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{case}");
        assert_eq!(body["error_code"], "INVALID_INPUT", "{case}");
    }
    assert!(harness.coordinator.queued() == 0);
}

#[tokio::test]
async fn test_manual_withdraw_and_abandon() {
    let harness = Harness::new();
    let app = app(&harness).await;

    // no position: terminal immediately, nothing sent on chain
    let body = json!({ "user": ALICE, "shares": "5", "reference": "w-1" });
    let (status, _) = send(&app, post("/manual/withdraw", Some(TOKEN), body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    harness.coordinator.wait_idle().await;
    assert_eq!(harness.saga("manual:w-1").await.status, SagaStatus::FailedTerminal);

    let (status, body) = send(&app, post("/manual/abandon/manual:w-1", Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ABANDONED");

    let (status, _) = send(&app, post("/manual/abandon/manual:w-1", Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, post("/manual/retry/missing", Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_retry_resumes_failed_saga() {
    let harness = Harness::new();
    harness.remote.set_available(0);
    let id = deposit(&harness, 100_000000, 10).await;
    assert_eq!(harness.saga(&id).await.status, SagaStatus::FailedRetryable);
    harness.remote.set_available(500_000000);
    let app = app(&harness).await;

    let (status, body) = send(&app, post(&format!("/manual/retry/{id}"), Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["attempt"], 0);
    harness.coordinator.wait_idle().await;
    assert_eq!(harness.saga(&id).await.status, SagaStatus::Completed);
}

#[tokio::test]
async fn test_manual_routes_disabled_without_token() {
    let harness = Harness::new();
    let app = create_app(state(&harness, None, 100), &[]).await;

    let body = json!({ "user": ALICE, "amount": "1", "reference": "x" });
    let (status, response) = send(&app, post("/manual/deposit", Some(TOKEN), body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["error_code"], "MANUAL_DISABLED");

    // reads stay open
    let (status, _) = send(&app, get("/global")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_manual_routes_are_rate_limited() {
    let harness = Harness::new();
    let app = create_app(state(&harness, Some(TOKEN), 1), &[]).await;

    let (status, _) = send(&app, post("/manual/retry/missing", Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = send(&app, post("/manual/retry/missing", Some(TOKEN), json!({}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "RATE_LIMITED");

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}
