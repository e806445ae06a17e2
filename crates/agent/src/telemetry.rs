use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

/// Serve the Prometheus endpoint on the loopback until `shutdown` resolves.
pub async fn serve_metrics<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_heartbeat(result: &str) {
    counter!("anssl_heartbeat_total", "result" => result.to_string()).increment(1);
}

pub fn record_reconnect(result: &str) {
    counter!("anssl_reconnect_total", "result" => result.to_string()).increment(1);
}

pub fn record_message(kind: &str) {
    counter!("anssl_messages_total", "type" => kind.to_string()).increment(1);
}

pub fn record_deployment(target: &str, result: &str) {
    counter!(
        "anssl_deployments_total",
        "target" => target.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_provider_upload(provider: &str, result: &str) {
    counter!(
        "anssl_provider_uploads_total",
        "provider" => provider.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_challenge_entries(count: usize) {
    gauge!("anssl_challenge_entries").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_prometheus_output() {
        let handle = init_metrics_recorder();

        record_heartbeat("success");
        record_reconnect("failure");
        record_message("CHALLENGE");
        record_deployment("nginx", "success");
        record_provider_upload("aliyun", "failure");
        record_challenge_entries(2);

        let rendered = handle.render();
        assert!(
            rendered.contains("anssl_heartbeat_total"),
            "heartbeat counter missing: {rendered}"
        );
        assert!(
            rendered.contains("anssl_deployments_total"),
            "deployment counter missing: {rendered}"
        );
        assert!(
            rendered.contains("anssl_challenge_entries"),
            "challenge gauge missing: {rendered}"
        );
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_payload() {
        let handle = init_metrics_recorder();
        record_heartbeat("success");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(serve_metrics(handle, addr, async move {
            let _ = rx.await;
        }));

        // Wait for the listener to come up.
        let mut body = String::new();
        for _ in 0..50 {
            match reqwest::get(format!("http://{}/metrics", addr)).await {
                Ok(resp) => {
                    body = resp.text().await.expect("metrics body");
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let _ = tx.send(());
        let _ = server.await;

        assert!(
            body.contains("anssl_heartbeat_total"),
            "metrics payload missing heartbeat counter: {body}"
        );
    }
}
