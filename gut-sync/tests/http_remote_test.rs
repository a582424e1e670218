//! HTTP remote store tests against a mock tracker API

use gut_sync::database::{Entry, EntryKind, FoodData, Payload};
use gut_sync::error::AppError;
use gut_sync::remote::{HttpRemoteStore, ImageUpload, RemoteStore};
use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;

fn store_for(server: &MockServer) -> HttpRemoteStore {
    HttpRemoteStore::new(&server.url("/api"), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_check_auth_reads_loose_flags() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/check_auth");
            then.status(200).json_body(json!({
                "authenticated": 1,
                "user_id": "12",
                "username": "jo",
                "debug_mode": "0"
            }));
        })
        .await;

    let status = store_for(&server).check_auth().await.unwrap();

    mock.assert_async().await;
    assert!(status.authenticated);
    assert_eq!(status.user_id, Some(12));
    assert!(!status.debug_mode);
    assert_eq!(status.profile().unwrap().username, "jo");
}

#[tokio::test]
async fn test_list_accepts_legacy_shapes() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/entries")
                .query_param("limit", "50");
            then.status(200).json_body(json!([
                {
                    "id": "31",
                    "user_id": 12,
                    "type": "food",
                    "event_at": "2024-02-01T08:15:00Z",
                    "data": "{\"notes\":\"Oats\"}"
                },
                {
                    "id": 30,
                    "user_id": "12",
                    "type": "mood",
                    "recorded_at": "2024-02-01 07:00:00",
                    "data": { "mood_score": "4" }
                },
                {
                    "id": 29,
                    "type": "weather",
                    "event_at": "2024-02-01 06:00:00",
                    "data": {}
                }
            ]));
        })
        .await;

    let entries = store_for(&server).list(50).await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, Some(31));
    assert_eq!(entries[0].event_at, "2024-02-01 08:15:00");
    assert_eq!(entries[0].data.payload.notes(), Some("Oats"));
    assert_eq!(entries[1].kind(), EntryKind::Symptom);
    assert_eq!(entries[1].event_at, "2024-02-01 07:00:00");
    assert!(entries.iter().all(|e| e.synced && e.user_id == 12));
}

#[tokio::test]
async fn test_get_missing_entry() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/entries").query_param("id", "404");
            then.status(404).json_body(json!({ "error": "Entry not found" }));
        })
        .await;

    let result = store_for(&server).get(404).await;
    assert!(matches!(result, Err(AppError::RemoteNotFound(404))));
}

#[tokio::test]
async fn test_save_posts_multipart_form() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/entry")
                .body_contains("name=\"type\"")
                .body_contains("Grilled fish")
                .body_contains("name=\"image\"");
            then.status(200).json_body(json!({
                "message": "Entry saved",
                "id": "77",
                "image_path": "uploads/plate.jpg"
            }));
        })
        .await;

    let entry = Entry::new(
        12,
        "2024-02-01 19:00:00",
        Payload::Food(FoodData {
            notes: Some("Grilled fish".to_string()),
        }),
    );
    let image = ImageUpload {
        file_name: "plate.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        bytes: vec![0xFF, 0xD8, 0xFF],
    };

    let receipt = store_for(&server).save(&entry, Some(image)).await.unwrap();

    mock.assert_hits_async(1).await;
    assert_eq!(receipt.id, 77);
    assert_eq!(receipt.image_path.as_deref(), Some("uploads/plate.jpg"));
}

#[tokio::test]
async fn test_delete_sends_id_and_maps_404() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/delete")
                .json_body(json!({ "id": 5 }));
            then.status(200).json_body(json!({ "message": "Entry deleted" }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/delete")
                .json_body(json!({ "id": 6 }));
            then.status(404).json_body(json!({ "error": "Entry not found" }));
        })
        .await;

    let store = store_for(&server);
    store.delete(5).await.unwrap();
    assert!(matches!(store.delete(6).await, Err(AppError::RemoteNotFound(6))));
}

#[tokio::test]
async fn test_server_error_message_surfaces() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/delete_all");
            then.status(500).json_body(json!({ "error": "Database is locked" }));
        })
        .await;

    match store_for(&server).delete_all().await {
        Err(AppError::RemoteRejected { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "Database is locked");
        }
        other => panic!("unexpected result {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let store = HttpRemoteStore::new("http://127.0.0.1:9/api", Duration::from_millis(500)).unwrap();
    let result = store.check_auth().await;
    assert!(matches!(result, Err(AppError::NetworkUnavailable(_))));
}
