//! Loopback HTTP-01 responder.
//!
//! The front web server forwards `/.well-known/acme-challenge/{token}` to
//! this endpoint; the agent answers from the challenge store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::challenge::ChallengeStore;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

pub fn router(store: Arc<ChallengeStore>) -> Router {
    Router::new()
        .route("/acme-challenge/{token}", get(handle_challenge))
        .with_state(store)
}

async fn handle_challenge(
    State(store): State<Arc<ChallengeStore>>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    if token.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match store.get(&token).await {
        Some(response) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            response,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Bind the responder's loopback listener. A failure here is fatal for the
/// worker, so it happens before any task is spawned.
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| anyhow::anyhow!("failed to bind challenge port {}: {}", addr, err))?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "http-01 responder listening");
    Ok(listener)
}

/// Serve until shutdown; in-flight requests get a 5 s drain window.
pub async fn serve(
    store: Arc<ChallengeStore>,
    port: u16,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = bind(port).await?;
    serve_on(listener, store, shutdown).await
}

pub async fn serve_on(
    listener: TcpListener,
    store: Arc<ChallengeStore>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    use std::future::IntoFuture;

    let mut drain_watch = shutdown.clone();
    let shutdown_fut = async move {
        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
    };

    let serve_fut = axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown_fut)
        .into_future();
    tokio::pin!(serve_fut);

    tokio::select! {
        result = &mut serve_fut => result.map_err(Into::into),
        _ = drain_watch.changed() => {
            match tokio::time::timeout(SHUTDOWN_DRAIN, serve_fut).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => {
                    warn!("http-01 responder did not drain within 5s, abandoning");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_server(store: Arc<ChallengeStore>) -> (SocketAddr, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, mut rx) = watch::channel(false);

        tokio::spawn(async move {
            let shutdown_fut = async move {
                let _ = rx.changed().await;
            };
            axum::serve(listener, router(store))
                .with_graceful_shutdown(shutdown_fut)
                .await
                .expect("serve");
        });

        (addr, tx)
    }

    #[tokio::test]
    async fn known_token_returns_plaintext_response() {
        let store = ChallengeStore::new();
        store.set("abc", "abc.xyz", "d.example").await;
        let (addr, _tx) = spawn_server(store).await;

        let resp = reqwest::get(format!("http://{}/acme-challenge/abc", addr))
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/plain")
        );
        assert_eq!(resp.text().await.expect("body"), "abc.xyz");
    }

    #[tokio::test]
    async fn unknown_token_returns_404() {
        let store = ChallengeStore::new();
        let (addr, _tx) = spawn_server(store).await;

        let resp = reqwest::get(format!("http://{}/acme-challenge/missing", addr))
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_token_segment_returns_404() {
        let store = ChallengeStore::new();
        let (addr, _tx) = spawn_server(store).await;

        let resp = reqwest::get(format!("http://{}/acme-challenge/", addr))
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = reqwest::get(format!("http://{}/other", addr))
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deleted_token_stops_being_served() {
        let store = ChallengeStore::new();
        store.set("abc", "abc.xyz", "d.example").await;
        let (addr, _tx) = spawn_server(store.clone()).await;

        store.delete("abc").await;
        let resp = reqwest::get(format!("http://{}/acme-challenge/abc", addr))
            .await
            .expect("request");
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let store = ChallengeStore::new();
        let (addr, tx) = spawn_server(store).await;
        tx.send(true).expect("shutdown");

        // Allow the serve loop to wind down, then the port should refuse.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = reqwest::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .expect("client")
            .get(format!("http://{}/acme-challenge/abc", addr))
            .send()
            .await;
        assert!(result.is_err(), "server should be gone after shutdown");
    }
}
