//! End-to-end tests for the task socket over a real TCP listener

use chrono::Utc;
use clap::Parser;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use trustgate_backend::{
    api::{build_router, AppState},
    auth::{models::ClientInfo, SqliteTokenStore, UserStore},
    cache::MemoryCache,
    clock::ManualClock,
    config::Config,
    ws::{Channel, Frame},
};
use uuid::Uuid;

async fn serve() -> (SocketAddr, AppState) {
    let config = Config::parse_from([
        "trustgate",
        "--jwt-secret",
        "ws-test-secret-0123456789abcdef",
        "--bcrypt-cost",
        "4",
    ]);
    let state = AppState::assemble(
        Arc::new(UserStore::in_memory(config.bcrypt_cost).unwrap()),
        Arc::new(SqliteTokenStore::in_memory().unwrap()),
        Arc::new(MemoryCache::new()),
        Arc::new(ManualClock::new(Utc::now())),
        &config,
    );
    let app = build_router(state.clone(), &config.cors_allow_origin);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn access_token(state: &AppState, username: &str, role: &str) -> (Uuid, String) {
    let user = state
        .users
        .create_user(username, &format!("{username}@example.com"), "Passw0rd!", &[role])
        .await
        .unwrap();
    let issued = state.tokens.issue(user.id, &ClientInfo::default()).await.unwrap();
    (user.id, issued.access_token)
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    for _ in 0..200 {
        if state.broadcaster.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {expected} live sockets, found {}",
        state.broadcaster.connection_count()
    );
}

async fn expect_policy_close(url: String) {
    let (mut socket, _) = connect_async(url).await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected a policy close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rejected_sockets_close_with_policy_violation() {
    let (addr, state) = serve().await;

    expect_policy_close(format!("ws://{addr}/api/v1/ws/tasks")).await;
    expect_policy_close(format!("ws://{addr}/api/v1/ws/tasks?token=garbage")).await;

    assert_eq!(state.broadcaster.connection_count(), 0);
}

#[tokio::test]
async fn test_owner_and_wildcard_sockets_receive_notifications() {
    let (addr, state) = serve().await;
    let (alice_id, alice_token) = access_token(&state, "alice", "user").await;
    let (_, admin_token) = access_token(&state, "root", "admin").await;

    let (mut alice, _) = connect_async(format!("ws://{addr}/api/v1/ws/tasks?token={alice_token}"))
        .await
        .unwrap();
    let (mut admin, _) = connect_async(format!("ws://{addr}/api/v1/ws/tasks?token={admin_token}"))
        .await
        .unwrap();
    wait_for_connections(&state, 2).await;
    assert_eq!(state.broadcaster.members(Channel::Wildcard), 1);

    let frame = Frame::new(
        Channel::Owner(alice_id),
        alice_id,
        serde_json::json!({ "task": "updated" }),
    );
    let delivered = state
        .broadcaster
        .broadcast_frame(&frame, Some(Channel::Owner(alice_id)))
        .await
        .unwrap();
    assert_eq!(delivered, 2);

    for socket in [&mut alice, &mut admin] {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let received: Frame = match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        };
        assert_eq!(received, frame);
    }

    // Closing a socket deregisters it.
    alice.close(None).await.unwrap();
    wait_for_connections(&state, 1).await;
    assert_eq!(state.broadcaster.members(Channel::Owner(alice_id)), 0);
}

#[tokio::test]
async fn test_client_messages_fan_out_on_owner_channel() {
    let (addr, state) = serve().await;
    let (alice_id, alice_token) = access_token(&state, "alice", "user").await;
    let (_, admin_token) = access_token(&state, "root", "admin").await;

    let (mut alice, _) = connect_async(format!("ws://{addr}/api/v1/ws/tasks?token={alice_token}"))
        .await
        .unwrap();
    let (mut admin, _) = connect_async(format!("ws://{addr}/api/v1/ws/tasks?token={admin_token}"))
        .await
        .unwrap();
    wait_for_connections(&state, 2).await;

    futures_util::SinkExt::send(&mut alice, Message::Text(r#"{"status":"done"}"#.to_string()))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), admin.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let received: Frame = match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    };
    assert_eq!(received.channel, alice_id.to_string());
    assert_eq!(received.sender, alice_id);
    assert_eq!(received.payload, serde_json::json!({ "status": "done" }));
}
