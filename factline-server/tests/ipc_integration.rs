//! Unix socket IPC tests: length-prefixed MessagePack frames in, router
//! responses out, against the in-memory backend.

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use factline_core::ipc::{FactlineRequest, FactlineResponse};
use factline_core::models::{EntityKind, FactInput};
use factline_core::{FactlineConfig, ManualClock, TemporalMemory};
use factline_server::{router, server};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

fn make_memory() -> TemporalMemory {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
    TemporalMemory::in_memory(clock, &FactlineConfig::in_memory()).unwrap()
}

fn works_at(company: &str) -> FactInput {
    FactInput {
        subject: "philip-aga".to_string(),
        subject_kind: EntityKind::Person,
        predicate: "works_at".to_string(),
        object: company.to_string(),
        object_kind: EntityKind::Company,
        confidence: 0.9,
        valid_from: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
        source: "ipc-test".to_string(),
        recorded_by: None,
    }
}

async fn connect(path: &str) -> Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec> {
    for _ in 0..50 {
        if let Ok(stream) = UnixStream::connect(path).await {
            return Framed::new(stream, server::frame_codec());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("IPC server did not come up on {}", path);
}

async fn roundtrip(
    framed: &mut Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec>,
    request: &FactlineRequest,
) -> FactlineResponse {
    let bytes = rmp_serde::to_vec_named(request).unwrap();
    framed.send(Bytes::from(bytes)).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    rmp_serde::from_slice(&frame).unwrap()
}

// ===========================================================================
// TEST 1: socket round trip for ping, append and current
// ===========================================================================
#[tokio::test]
async fn test_socket_round_trip() {
    let path = std::env::temp_dir()
        .join(format!("factline-test-{}.sock", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();
    let (tx, _rx) = broadcast::channel(1);
    let server_path = path.clone();
    let shutdown = tx.subscribe();
    let handle = tokio::spawn(async move {
        server::run_unix_server(&server_path, make_memory(), shutdown).await
    });

    let mut framed = connect(&path).await;

    let pong = roundtrip(&mut framed, &FactlineRequest::Ping).await;
    assert!(pong.is_ok());

    let appended = roundtrip(&mut framed, &FactlineRequest::Append { fact: works_at("ck-delta") }).await;
    assert!(appended.is_ok(), "{:?}", appended.error);
    let data = appended.data.unwrap();
    let entity_id: uuid::Uuid = serde_json::from_value(data["subject_id"].clone()).unwrap();

    let current = roundtrip(&mut framed, &FactlineRequest::Current { entity_id }).await;
    let facts = current.data.unwrap();
    assert_eq!(facts.as_array().unwrap().len(), 1);
    assert_eq!(facts[0]["object_raw"], "ck-delta");

    let missing = roundtrip(
        &mut framed,
        &FactlineRequest::GetEpisode { episode_id: uuid::Uuid::new_v4() },
    )
    .await;
    assert_eq!(missing.error_kind.as_deref(), Some("not_found"));

    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert!(!std::path::Path::new(&path).exists(), "socket file should be removed");
}

// ===========================================================================
// TEST 2: undecodable frame gets an error response, connection stays open
// ===========================================================================
#[tokio::test]
async fn test_garbage_frame() {
    let path = std::env::temp_dir()
        .join(format!("factline-test-{}.sock", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string();
    let (tx, _rx) = broadcast::channel(1);
    let server_path = path.clone();
    let shutdown = tx.subscribe();
    let handle = tokio::spawn(async move {
        server::run_unix_server(&server_path, make_memory(), shutdown).await
    });

    let mut framed = connect(&path).await;
    framed.send(Bytes::from_static(b"\xc1not msgpack")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let resp: FactlineResponse = rmp_serde::from_slice(&frame).unwrap();
    assert!(!resp.is_ok());
    assert!(resp.error.unwrap().contains("Deserialization"));

    let pong = roundtrip(&mut framed, &FactlineRequest::Ping).await;
    assert!(pong.is_ok());

    tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

// ===========================================================================
// TEST 3: router directly: supersede inside an episode
// ===========================================================================
#[tokio::test]
async fn test_router_record_superseding() {
    let memory = make_memory();

    let appended = router::handle_request(FactlineRequest::Append { fact: works_at("ck-delta") }, &memory).await;
    let old_fact_id: uuid::Uuid = serde_json::from_value(appended.data.unwrap()["id"].clone()).unwrap();

    let episode = router::handle_request(
        FactlineRequest::BeginEpisode {
            source: "profile refresh".to_string(),
            occurred_at: None,
            recorded_by: None,
        },
        &memory,
    )
    .await;
    let episode_id: uuid::Uuid = serde_json::from_value(episode.data.unwrap()["id"].clone()).unwrap();

    let mut replacement = works_at("other-co");
    replacement.valid_from = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let resp = router::handle_request(
        FactlineRequest::RecordSuperseding {
            episode_id,
            old_fact_id,
            fact: replacement,
        },
        &memory,
    )
    .await;
    assert!(resp.is_ok(), "{:?}", resp.error);
    assert_eq!(resp.data.unwrap()["episode_id"], episode_id.to_string());

    let old = router::handle_request(FactlineRequest::GetFact { id: old_fact_id }, &memory).await;
    assert_eq!(old.data.unwrap()["valid_to"], "2024-01-01T00:00:00Z");
}
