use std::sync::Arc;
use std::time::Duration;

use herdsync_core::{
    AuthToken, BackoffConfig, ConflictWinner, HttpRemoteApi, Payload, Record, RecordId,
    ServerRecord, StaticTokenProvider, SyncConfig, SyncEngine, SyncState, TraceId, UpsertRequest,
};
use pretty_assertions::assert_eq;
use serde_json::Value;

use crate::config::AppConfig;
use crate::routes::{app_router, AppState};

const TOKEN: &str = "farm-secret";

async fn spawn_server() -> (String, AppState) {
    let config = Arc::new(AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        api_token: TOKEN.to_string(),
    });
    let state = AppState::from_config(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn engine_for(base: &str) -> SyncEngine {
    let config = SyncConfig {
        workers: 2,
        backoff: BackoffConfig {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(40),
            ..BackoffConfig::default()
        },
        request_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        idle_poll_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let remote = HttpRemoteApi::new(format!("{base}/v1")).unwrap();
    let auth = StaticTokenProvider::new(AuthToken::new(TOKEN));
    SyncEngine::open(config, Arc::new(remote), Arc::new(auth)).unwrap()
}

async fn wait_for_state(engine: &SyncEngine, id: &RecordId, state: SyncState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while engine.get(id).unwrap().sync_state != state {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {id} to become {state}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn upsert_body(record: &Record, trace_id: TraceId) -> UpsertRequest {
    UpsertRequest::from_record(record, trace_id, false)
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_is_public() {
    let (base, _) = spawn_server().await;
    let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["records"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn upsert_requires_known_bearer_token() {
    let (base, state) = spawn_server().await;
    let record = Record::new("owner-1", Payload::new().with("name", "Bessie"));
    let client = reqwest::Client::new();

    let missing = client
        .put(format!("{base}/v1/records/{}", record.id))
        .json(&upsert_body(&record, TraceId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client
        .put(format!("{base}/v1/records/{}", record.id))
        .bearer_auth("guess")
        .json(&upsert_body(&record, TraceId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
    assert_eq!(state.records.len().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn upsert_creates_then_replays() {
    let (base, _) = spawn_server().await;
    let record = Record::new("owner-1", Payload::new().with("name", "Bessie"));
    let body = upsert_body(&record, TraceId::new());
    let client = reqwest::Client::new();
    let url = format!("{base}/v1/records/{}", record.id);

    let created = client
        .put(&url)
        .bearer_auth(TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: ServerRecord = created.json().await.unwrap();

    let replay = client
        .put(&url)
        .bearer_auth(TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 200);
    assert_eq!(replay.json::<ServerRecord>().await.unwrap(), created);

    let fetched = client
        .get(&url)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json::<ServerRecord>()
        .await
        .unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_upsert_returns_conflict_with_stored_record() {
    let (base, state) = spawn_server().await;
    let mut newer = Record::new("owner-1", Payload::new().with("name", "Server"));
    newer.local_version = 4;
    let stored = state
        .records
        .upsert(newer.id, upsert_body(&newer, TraceId::new()))
        .await
        .unwrap()
        .into_record();

    let mut stale = newer.clone();
    stale.local_version = 1;
    let response = reqwest::Client::new()
        .put(format!("{base}/v1/records/{}", stale.id))
        .bearer_auth(TOKEN)
        .json(&upsert_body(&stale, TraceId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    assert_eq!(response.json::<ServerRecord>().await.unwrap(), stored);
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_trace_header_is_rejected() {
    let (base, _) = spawn_server().await;
    let record = Record::new("owner-1", Payload::new());
    let response = reqwest::Client::new()
        .put(format!("{base}/v1/records/{}", record.id))
        .bearer_auth(TOKEN)
        .header("x-trace-id", TraceId::new().to_string())
        .json(&upsert_body(&record, TraceId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_syncs_against_server() {
    let (base, state) = spawn_server().await;
    let engine = engine_for(&base);
    engine.start().unwrap();

    let receipt = engine
        .create("owner-1", Payload::new().with("name", "Bessie"))
        .unwrap();
    wait_for_state(&engine, &receipt.record.id, SyncState::Committed).await;

    let server = state.records.get(&receipt.record.id).await.unwrap();
    assert_eq!(server.payload, receipt.record.payload);
    assert_eq!(
        engine.get(&receipt.record.id).unwrap().updated_at,
        Some(server.updated_at)
    );

    let update = engine
        .update(
            &receipt.record.id,
            Payload::new().with("name", "Bessie").with("weight_kg", 612_i64),
        )
        .unwrap();
    wait_for_state(&engine, &receipt.record.id, SyncState::Committed).await;
    let server = state.records.get(&receipt.record.id).await.unwrap();
    assert_eq!(server.local_version, update.record.local_version);
    assert_eq!(server.payload, update.record.payload);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_accepts_newer_server_copy() {
    let (base, state) = spawn_server().await;
    let engine = engine_for(&base);

    let receipt = engine
        .create("owner-1", Payload::new().with("name", "Local"))
        .unwrap();
    let mut server_side = receipt.record.clone();
    server_side.payload = Payload::new().with("name", "Vet edit");
    server_side.local_version = 3;
    tokio::time::sleep(Duration::from_millis(5)).await;
    state
        .records
        .upsert(server_side.id, upsert_body(&server_side, TraceId::new()))
        .await
        .unwrap();

    engine.start().unwrap();
    wait_for_state(&engine, &receipt.record.id, SyncState::Committed).await;

    let local = engine.get(&receipt.record.id).unwrap();
    assert_eq!(local.payload.text("name"), Some("Vet edit"));
    assert_eq!(
        engine.list_conflicts(10).unwrap()[0].winner,
        ConflictWinner::Server
    );
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_force_pushes_newer_local_edit() {
    let (base, state) = spawn_server().await;
    let engine = engine_for(&base);

    let mut server_side = Record::new("owner-1", Payload::new().with("name", "Old"));
    server_side.local_version = 3;
    state
        .records
        .upsert(server_side.id, upsert_body(&server_side, TraceId::new()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let local = Record::with_id(
        server_side.id,
        "owner-1",
        Payload::new().with("name", "Fresh"),
    );
    let receipt = engine.submit(local).unwrap();
    engine.start().unwrap();
    wait_for_state(&engine, &receipt.record.id, SyncState::Committed).await;

    let server = state.records.get(&receipt.record.id).await.unwrap();
    assert_eq!(server.payload.text("name"), Some("Fresh"));
    assert_eq!(
        engine.list_conflicts(10).unwrap()[0].winner,
        ConflictWinner::Local
    );
    engine.shutdown().await.unwrap();
}
