//! End-to-end HTTP-01 flow: a CHALLENGE message from the control stream
//! makes the loopback responder serve the key authorization; eviction and
//! expiry turn it back into a 404.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use anssl_agent::challenge::ChallengeStore;
use anssl_agent::config::AppConfig;
use anssl_agent::control::dispatch::{dispatch, DispatchContext};
use anssl_agent::{server, state};
use anssl_common::{ExecuteBusinessResponse, MessageType, NotifyResponse};

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.server.access_key = "test-key".into();
    cfg
}

async fn start_responder(store: Arc<ChallengeStore>) -> (std::net::SocketAddr, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = server::serve_on(listener, store, rx).await;
    });
    (addr, tx)
}

fn challenge_message(token: &str, response: &str, domain: &str) -> NotifyResponse {
    NotifyResponse {
        message_type: MessageType::Challenge,
        request_id: String::new(),
        connect_request: None,
        execute_business_response: Some(ExecuteBusinessResponse {
            challenge_token: token.into(),
            challenge_response: response.into(),
            domain: domain.into(),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn challenge_message_is_served_then_evicted() {
    let state = state::new_state(test_config(), "c".repeat(64)).expect("state");
    let store = ChallengeStore::new();
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let ctx = DispatchContext::new(state, store.clone(), shutdown_tx);
    let (frame_tx, _frames) = mpsc::channel(4);

    let (addr, _server_shutdown) = start_responder(store.clone()).await;
    let url = format!("http://{}/acme-challenge/abc", addr);

    // Before the challenge arrives: 404.
    let resp = reqwest::get(&url).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // CHALLENGE message caches the key authorization.
    dispatch(
        ctx.clone(),
        frame_tx.clone(),
        challenge_message("abc", "abc.xyz", "d.example"),
    )
    .await;

    let resp = reqwest::get(&url).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.expect("body"), "abc.xyz");

    // Empty response is the eviction signal.
    dispatch(
        ctx.clone(),
        frame_tx.clone(),
        challenge_message("abc", "", ""),
    )
    .await;

    let resp = reqwest::get(&url).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_challenge_is_not_served() {
    let store = ChallengeStore::new();
    store
        .set_with_ttl("short", "short.response", "d.example", Duration::from_millis(50))
        .await;

    let (addr, _server_shutdown) = start_responder(store.clone()).await;
    let url = format!("http://{}/acme-challenge/short", addr);

    let resp = reqwest::get(&url).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let resp = reqwest::get(&url).await.expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // Lazy expiry: the entry is still in the map until a sweep runs.
    assert_eq!(store.len().await, 1);
    store.sweep_expired().await;
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn tokens_are_isolated_per_path_segment() {
    let store = ChallengeStore::new();
    store.set("tok-1", "resp-1", "a.example").await;
    store.set("tok-2", "resp-2", "b.example").await;

    let (addr, _server_shutdown) = start_responder(store).await;

    let one = reqwest::get(format!("http://{}/acme-challenge/tok-1", addr))
        .await
        .expect("request");
    assert_eq!(one.text().await.expect("body"), "resp-1");

    let two = reqwest::get(format!("http://{}/acme-challenge/tok-2", addr))
        .await
        .expect("request");
    assert_eq!(two.text().await.expect("body"), "resp-2");

    let missing = reqwest::get(format!("http://{}/acme-challenge/tok-3", addr))
        .await
        .expect("request");
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}
