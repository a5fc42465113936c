//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a collaboration server on a free port and drives it
//! with real connection managers, verifying the full pipeline: preflight,
//! auth, sync, presence, and locking.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use visus_collab::{
    AnnotationStore, CollabServer, ConnectionConfig, ConnectionManager, ConnectionState, Endpoint,
    LockService, MemoryStore, ParticipantInfo, PresenceEvent, ReconnectPolicy, ServerConfig,
    StaticTokenProvider, SyncChannel,
};
use visus_scene::{Annotation, AnnotationShape, ChangeKind, Point};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server (with its health responder) and return its endpoint.
async fn start_test_server(store: Option<Arc<dyn AnnotationStore>>) -> Endpoint {
    let _ = env_logger::builder().is_test(true).try_init();
    let ws_port = free_port().await;
    let health_port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{ws_port}"),
        health_addr: Some(format!("127.0.0.1:{health_port}")),
        require_token: true,
        max_participants_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = match store {
        Some(store) => CollabServer::new(config).with_store(store),
        None => CollabServer::new(config),
    };
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listeners time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Endpoint::new(
        format!("ws://127.0.0.1:{ws_port}"),
        format!("http://127.0.0.1:{health_port}/health"),
    )
}

fn manager_for(endpoint: &Endpoint) -> ConnectionManager {
    let mut config = ConnectionConfig::new(endpoint.clone());
    config.preflight_timeout = Duration::from_millis(1500);
    config.connect_timeout = Duration::from_secs(2);
    ConnectionManager::new(config, Arc::new(StaticTokenProvider::new("test-token")))
}

async fn connected_manager(endpoint: &Endpoint) -> ConnectionManager {
    let manager = manager_for(endpoint);
    manager.connect().await.expect("connect");
    manager
}

fn marker(image_id: Uuid, x: f32, y: f32) -> Annotation {
    Annotation::new(
        image_id,
        Uuid::new_v4(),
        0,
        AnnotationShape::Marker {
            at: Point::new(x, y),
        },
    )
}

#[tokio::test]
async fn test_connect_reaches_connected() {
    let endpoint = start_test_server(None).await;
    let manager = manager_for(&endpoint);
    let mut events = manager.subscribe_events();

    manager.connect().await.expect("connect should succeed");
    assert_eq!(manager.state().await, ConnectionState::Connected);

    let event = timeout(RECV_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, visus_collab::ConnectionEvent::Established));
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let endpoint = start_test_server(None).await;
    let manager = connected_manager(&endpoint).await;
    // Second connect on a live manager is a no-op.
    manager.connect().await.expect("no-op connect");
    assert_eq!(manager.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_handshake_without_token_rejected() {
    let endpoint = start_test_server(None).await;
    // Raw dial with no token query parameter: the server must refuse.
    let result = tokio_tungstenite::connect_async(&endpoint.ws_url).await;
    assert!(result.is_err(), "unauthenticated handshake should fail");
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let endpoint = start_test_server(None).await;
    let manager = connected_manager(&endpoint).await;

    manager.disconnect().await;
    assert_eq!(manager.state().await, ConnectionState::Idle);

    manager.connect().await.expect("reconnect after disconnect");
    assert_eq!(manager.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_backup_endpoint_when_primary_times_out() {
    let endpoint = start_test_server(None).await;

    // TEST-NET-1 address: packets go nowhere, so the probe times out
    // rather than being refused.
    let mut config = ConnectionConfig::new(Endpoint::new(
        "ws://192.0.2.1:9",
        "http://192.0.2.1:9/health",
    ))
    .with_backup(endpoint.clone());
    config.preflight_timeout = Duration::from_millis(500);

    let manager = ConnectionManager::new(config, Arc::new(StaticTokenProvider::new("tok")));
    let started = std::time::Instant::now();
    manager.connect().await.expect("backup should carry the connection");

    assert_eq!(manager.state().await, ConnectionState::Connected);
    // One primary probe timeout plus the backup handshake.
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_annotation_event_propagates() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();

    let channel_a = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Alice"),
    );
    let channel_b = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Bob"),
    );

    channel_b.join(image).await.unwrap();
    channel_a.join(image).await.unwrap();
    let mut events_b = channel_b.annotation_events();
    let mut events_a = channel_a.annotation_events();

    let annotation = marker(image, 120.0, 80.0);
    channel_a
        .emit_annotation(image, ChangeKind::Add, &annotation)
        .await
        .unwrap();

    let event = timeout(RECV_TIMEOUT, events_b.recv()).await.unwrap().unwrap();
    assert_eq!(event.image_id, image);
    assert_eq!(event.change.kind, ChangeKind::Add);
    assert_eq!(event.change.annotation, annotation);

    // The emitter must not see its own echo.
    assert!(
        timeout(Duration::from_millis(300), events_a.recv()).await.is_err(),
        "sender received its own event"
    );
}

#[tokio::test]
async fn test_events_scoped_to_image() {
    let endpoint = start_test_server(None).await;
    let image_a = Uuid::new_v4();
    let image_b = Uuid::new_v4();

    let channel_a = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Alice"),
    );
    let channel_b = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Bob"),
    );

    channel_a.join(image_a).await.unwrap();
    channel_b.join(image_b).await.unwrap();
    let mut events_b = channel_b.annotation_events();

    channel_a
        .emit_annotation(image_a, ChangeKind::Add, &marker(image_a, 1.0, 1.0))
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(300), events_b.recv()).await.is_err(),
        "event leaked across image sessions"
    );
}

#[tokio::test]
async fn test_presence_join_and_leave() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();

    let channel_b = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Bob"),
    );
    channel_b.join(image).await.unwrap();
    let mut presence_b = channel_b.presence_events();

    let alice = ParticipantInfo::new("Alice");
    let channel_a = SyncChannel::new(connected_manager(&endpoint).await, alice.clone());
    channel_a.join(image).await.unwrap();

    let event = timeout(RECV_TIMEOUT, presence_b.recv()).await.unwrap().unwrap();
    match event {
        PresenceEvent::Joined { participant, .. } => {
            assert_eq!(participant.user_id, alice.user_id);
            assert_eq!(participant.name, "Alice");
        }
        other => panic!("expected join, got {other:?}"),
    }

    channel_a.leave(image).await.unwrap();
    let event = timeout(RECV_TIMEOUT, presence_b.recv()).await.unwrap().unwrap();
    match event {
        PresenceEvent::Left { user_id, .. } => assert_eq!(user_id, alice.user_id),
        other => panic!("expected leave, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();

    let channel_b = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Bob"),
    );
    channel_b.join(image).await.unwrap();
    let mut presence_b = channel_b.presence_events();

    let channel_a = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Alice"),
    );
    channel_a.join(image).await.unwrap();
    channel_a.join(image).await.unwrap(); // no-op

    // Exactly one join announcement.
    let first = timeout(RECV_TIMEOUT, presence_b.recv()).await.unwrap().unwrap();
    assert!(matches!(first, PresenceEvent::Joined { .. }));
    assert!(
        timeout(Duration::from_millis(300), presence_b.recv()).await.is_err(),
        "duplicate join was announced"
    );
}

#[tokio::test]
async fn test_cursor_broadcast() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();

    let alice = ParticipantInfo::new("Alice");
    let channel_a = SyncChannel::new(connected_manager(&endpoint).await, alice.clone());
    let channel_b = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Bob"),
    );
    channel_b.join(image).await.unwrap();
    channel_a.join(image).await.unwrap();
    let mut presence_b = channel_b.presence_events();

    channel_a.emit_cursor(image, Point::new(42.0, 24.0)).await;

    // Skip Alice's join announcement if it lands first.
    loop {
        let event = timeout(RECV_TIMEOUT, presence_b.recv()).await.unwrap().unwrap();
        match event {
            PresenceEvent::Cursor {
                user_id, position, ..
            } => {
                assert_eq!(user_id, alice.user_id);
                assert_eq!(position, Point::new(42.0, 24.0));
                break;
            }
            PresenceEvent::Joined { .. } => continue,
            other => panic!("unexpected presence event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_lock_mutual_exclusion() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();
    let annotation_id = Uuid::new_v4();

    let manager_a = connected_manager(&endpoint).await;
    let manager_b = connected_manager(&endpoint).await;
    let channel_a = SyncChannel::new(manager_a.clone(), ParticipantInfo::new("Alice"));
    let channel_b = SyncChannel::new(manager_b.clone(), ParticipantInfo::new("Bob"));
    channel_a.join(image).await.unwrap();
    channel_b.join(image).await.unwrap();

    let locks_a = LockService::new(manager_a);
    let locks_b = LockService::new(manager_b);

    assert!(locks_a.acquire(image, annotation_id).await.unwrap());
    assert!(!locks_b.acquire(image, annotation_id).await.unwrap());

    locks_a.release(image, annotation_id).await.unwrap();
    // Release is fire-and-forget; give the server a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(locks_b.acquire(image, annotation_id).await.unwrap());
}

#[tokio::test]
async fn test_lock_reacquire_by_holder() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();
    let annotation_id = Uuid::new_v4();

    let manager = connected_manager(&endpoint).await;
    let channel = SyncChannel::new(manager.clone(), ParticipantInfo::new("Alice"));
    channel.join(image).await.unwrap();

    let locks = LockService::new(manager);
    assert!(locks.acquire(image, annotation_id).await.unwrap());
    assert!(locks.acquire(image, annotation_id).await.unwrap());
}

#[tokio::test]
async fn test_lock_status_is_advisory() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();
    let annotation_id = Uuid::new_v4();

    let manager_a = connected_manager(&endpoint).await;
    let manager_b = connected_manager(&endpoint).await;
    let channel_a = SyncChannel::new(manager_a.clone(), ParticipantInfo::new("Alice"));
    let channel_b = SyncChannel::new(manager_b.clone(), ParticipantInfo::new("Bob"));
    channel_a.join(image).await.unwrap();
    channel_b.join(image).await.unwrap();

    let locks_a = LockService::new(manager_a);
    let locks_b = LockService::new(manager_b);

    assert!(!locks_b.status(image, annotation_id).await.unwrap().locked);
    assert!(locks_a.acquire(image, annotation_id).await.unwrap());
    assert!(locks_b.status(image, annotation_id).await.unwrap().locked);
}

#[tokio::test]
async fn test_locks_released_when_holder_disconnects() {
    let endpoint = start_test_server(None).await;
    let image = Uuid::new_v4();
    let annotation_id = Uuid::new_v4();

    let manager_a = connected_manager(&endpoint).await;
    let manager_b = connected_manager(&endpoint).await;
    let channel_a = SyncChannel::new(manager_a.clone(), ParticipantInfo::new("Alice"));
    let channel_b = SyncChannel::new(manager_b.clone(), ParticipantInfo::new("Bob"));
    channel_a.join(image).await.unwrap();
    channel_b.join(image).await.unwrap();

    let locks_a = LockService::new(manager_a.clone());
    let locks_b = LockService::new(manager_b);

    assert!(locks_a.acquire(image, annotation_id).await.unwrap());
    assert!(!locks_b.acquire(image, annotation_id).await.unwrap());

    // The server observes the socket close and frees Alice's locks.
    manager_a.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(locks_b.acquire(image, annotation_id).await.unwrap());
}

#[tokio::test]
async fn test_annotations_fold_into_store() {
    let store = MemoryStore::shared();
    let endpoint = start_test_server(Some(store.clone())).await;
    let image = Uuid::new_v4();

    let channel = SyncChannel::new(
        connected_manager(&endpoint).await,
        ParticipantInfo::new("Alice"),
    );
    channel.join(image).await.unwrap();

    let a = marker(image, 5.0, 5.0);
    let b = marker(image, 9.0, 9.0);
    channel.emit_annotation(image, ChangeKind::Add, &a).await.unwrap();
    channel.emit_annotation(image, ChangeKind::Add, &b).await.unwrap();
    channel.emit_annotation(image, ChangeKind::Delete, &a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let saved = store.load_annotations(image).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0], b);
}

#[tokio::test]
async fn test_reconnect_attempts_exhaust_to_failed() {
    // Health answers while every socket dial times out (TEST-NET-1),
    // so the backoff loop runs dry.
    let endpoint = start_test_server(None).await;
    let mut conn_config = ConnectionConfig::new(Endpoint::new(
        "ws://192.0.2.1:9",
        endpoint.health_url.clone(),
    ));
    conn_config.connect_timeout = Duration::from_millis(200);
    conn_config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        growth: 2.0,
        max_delay: Duration::from_millis(100),
        max_attempts: 2,
    };

    let manager = ConnectionManager::new(conn_config, Arc::new(StaticTokenProvider::new("tok")));
    let result = manager.connect().await;
    assert!(result.is_err());
    assert_eq!(manager.state().await, ConnectionState::Failed);
}
