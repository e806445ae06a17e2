//! Persistent control channel to the central service.
//!
//! A single h2 bidirectional stream carries typed frames both ways. The
//! agent registers on connect, heartbeats every 15 s, and demultiplexes
//! inbound messages to handler tasks. On any stream error the connection is
//! torn down and re-dialed with backoff.

pub mod dispatch;
pub mod frame;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::{Bytes, BytesMut};
use h2::{RecvStream, SendStream};
use http::{Request, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant};
use tokio_rustls::{
    rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
    TlsConnector,
};
use tracing::{info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

use anssl_common::{NotifyRequest, NotifyResponse};

use crate::control::dispatch::DispatchContext;
use crate::telemetry;
use crate::{ACCESS_KEY_HEADER, CLIENT_ID_HEADER, VERSION_HEADER};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
pub const FAST_RECONNECT_ATTEMPTS: u32 = 3;

const FRAME_CHANNEL_CAPACITY: usize = 128;

/// Where the control stream dials, derived from the configured server URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Request path for the stream, e.g. `/deploy/stream`.
    pub path: String,
}

pub fn endpoint_from_url(url: &str) -> anyhow::Result<ControlEndpoint> {
    let parsed: Uri = url.parse().context("invalid server URL")?;
    let use_tls = match parsed.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        other => anyhow::bail!("unsupported server URL scheme: {:?}", other),
    };
    let host = parsed
        .host()
        .ok_or_else(|| anyhow!("server URL has no host: {url}"))?
        .to_string();
    let port = parsed
        .port_u16()
        .unwrap_or(if use_tls { 443 } else { 80 });

    let base = parsed.path().trim_end_matches('/');
    let path = format!("{base}/stream");

    Ok(ControlEndpoint {
        host,
        port,
        use_tls,
        path,
    })
}

/// First `FAST_RECONNECT_ATTEMPTS` failures retry after the minimum delay;
/// after that the delay doubles up to the cap. A received frame resets the
/// failure count, restarting the ladder at the minimum.
pub fn next_reconnect_delay(consecutive_failures: u32, current: Duration) -> Duration {
    if consecutive_failures <= FAST_RECONNECT_ATTEMPTS {
        MIN_RECONNECT_DELAY
    } else {
        (current * 2).min(MAX_RECONNECT_DELAY)
    }
}

struct Liveness {
    last_inbound: Mutex<Instant>,
    last_send: Mutex<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_inbound: Mutex::new(Instant::now()),
            last_send: Mutex::new(Instant::now()),
        }
    }

    async fn touch_inbound(&self) {
        *self.last_inbound.lock().await = Instant::now();
    }

    async fn touch_send(&self) {
        *self.last_send.lock().await = Instant::now();
    }

    /// Idle means neither direction has moved within the timeout.
    async fn is_idle(&self, timeout: Duration) -> bool {
        let inbound = *self.last_inbound.lock().await;
        let send = *self.last_send.lock().await;
        let newest = inbound.max(send);
        Instant::now().duration_since(newest) > timeout
    }
}

/// Connect / receive / reconnect forever, until shutdown.
pub async fn control_loop(
    ctx: Arc<DispatchContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut delay = MIN_RECONNECT_DELAY;
    let mut consecutive_failures: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let saw_frame = Arc::new(AtomicBool::new(false));
        let result = run_connection(&ctx, &mut shutdown, &saw_frame).await;

        ctx.state.set_connected(false);

        if *shutdown.borrow() {
            break;
        }

        if saw_frame.load(Ordering::SeqCst) {
            consecutive_failures = 0;
            delay = MIN_RECONNECT_DELAY;
        }

        if let Err(err) = result {
            let busy = ctx.state.busy_operations();
            if busy > 0 {
                warn!(
                    busy,
                    ?err,
                    "control stream dropped with operations in flight; their replies are lost"
                );
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
            if consecutive_failures == 1 {
                info!("control stream disconnected, reconnecting");
            }
            telemetry::record_reconnect("failure");
            delay = next_reconnect_delay(consecutive_failures, delay);
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = time::sleep(delay) => {}
        }
    }

    Ok(())
}

async fn run_connection(
    ctx: &Arc<DispatchContext>,
    shutdown: &mut watch::Receiver<bool>,
    saw_frame: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let endpoint = endpoint_from_url(&ctx.state.cfg.server_url())?;
    let transport = connect_transport(&endpoint).await?;
    let (mut h2_client, connection) = h2::client::handshake(transport).await?;
    let mut connection_handle =
        tokio::spawn(async move { connection.await.map_err(|err| anyhow!(err)) });

    let connect_request = build_connect_request(ctx, &endpoint)?;
    let (response_future, mut send_stream) = h2_client.send_request(connect_request, false)?;
    let response = response_future.await?;
    if response.status() != StatusCode::OK {
        connection_handle.abort();
        return Err(anyhow!(
            "control stream CONNECT failed with status {}",
            response.status()
        ));
    }

    let recv_stream = response.into_parts().1;

    // Registration is the distinguished first frame.
    let register = NotifyRequest::register(&ctx.state.identity(), ctx.state.system_info().await);
    frame::send_frame(&mut send_stream, &register).await?;
    info!("control stream established, registered");
    telemetry::record_reconnect("success");

    let liveness = Arc::new(Liveness::new());
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

    let mut reader_handle = Box::pin(tokio::spawn({
        let ctx = ctx.clone();
        let frame_tx = frame_tx.clone();
        let liveness = liveness.clone();
        let saw_frame = saw_frame.clone();
        let mut shutdown = shutdown.clone();
        async move {
            read_loop(
                recv_stream,
                ctx,
                frame_tx,
                liveness,
                saw_frame,
                &mut shutdown,
            )
            .await
        }
    }));

    let mut writer_handle = Box::pin(tokio::spawn({
        let liveness = liveness.clone();
        let mut shutdown = shutdown.clone();
        async move { write_loop(send_stream, frame_rx, liveness, &mut shutdown).await }
    }));

    let mut heartbeat_handle = Box::pin(tokio::spawn({
        let ctx = ctx.clone();
        let frame_tx = frame_tx.clone();
        let liveness = liveness.clone();
        let mut shutdown = shutdown.clone();
        async move { heartbeat_loop(ctx, frame_tx, liveness, &mut shutdown).await }
    }));

    tokio::select! {
        _ = shutdown.changed() => {
            reader_handle.abort();
            writer_handle.abort();
            heartbeat_handle.abort();
            connection_handle.abort();
            Ok(())
        }
        res = &mut reader_handle => {
            writer_handle.abort();
            heartbeat_handle.abort();
            connection_handle.abort();
            res?
        }
        res = &mut writer_handle => {
            reader_handle.abort();
            heartbeat_handle.abort();
            connection_handle.abort();
            res?
        }
        res = &mut heartbeat_handle => {
            reader_handle.abort();
            writer_handle.abort();
            connection_handle.abort();
            res?
        }
        res = &mut connection_handle => {
            reader_handle.abort();
            writer_handle.abort();
            heartbeat_handle.abort();
            res?
        }
    }
}

/// Single-writer discipline: every producer goes through the frame channel
/// and only this task touches the send stream.
async fn write_loop(
    mut send_stream: SendStream<Bytes>,
    mut rx: mpsc::Receiver<NotifyRequest>,
    liveness: Arc<Liveness>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = rx.recv() => match frame {
                Some(frame) => {
                    frame::send_frame(&mut send_stream, &frame).await?;
                    liveness.touch_send().await;
                }
                None => return Ok(()),
            },
        }
    }
}

async fn heartbeat_loop(
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    liveness: Arc<Liveness>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ticker.tick() => {
                if liveness.is_idle(IDLE_TIMEOUT).await {
                    telemetry::record_heartbeat("idle_timeout");
                    return Err(anyhow!("control stream idle beyond {}s", IDLE_TIMEOUT.as_secs()));
                }

                let frame = NotifyRequest::heartbeat(&ctx.state.identity());
                if frame_tx.send(frame).await.is_err() {
                    return Err(anyhow!("heartbeat channel closed"));
                }
                telemetry::record_heartbeat("sent");
            }
        }
    }
}

async fn read_loop(
    mut recv: RecvStream,
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    liveness: Arc<Liveness>,
    saw_frame: Arc<AtomicBool>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut buffer = BytesMut::new();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let payload = match frame::read_next_payload(&mut recv, &mut buffer).await? {
            Some(payload) => payload,
            None => return Err(anyhow!("control stream closed by server")),
        };

        liveness.touch_inbound().await;
        if !saw_frame.swap(true, Ordering::SeqCst) && !ctx.state.is_connected() {
            ctx.state.set_connected(true);
        }

        // A frame that does not deserialize is a protocol violation: drop it
        // and keep the stream.
        let message: NotifyResponse = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, "dropping undeserializable control frame");
                continue;
            }
        };

        // Handlers run concurrently; inbound order is preserved only up to
        // this spawn point.
        let ctx = ctx.clone();
        let frame_tx = frame_tx.clone();
        tokio::spawn(async move {
            dispatch::dispatch(ctx, frame_tx, message).await;
        });
    }
}

fn build_connect_request(
    ctx: &Arc<DispatchContext>,
    endpoint: &ControlEndpoint,
) -> anyhow::Result<Request<()>> {
    let authority = format_authority(&endpoint.host, endpoint.port);
    let scheme = if endpoint.use_tls { "https" } else { "http" };
    let uri = format!("{scheme}://{authority}{}", endpoint.path)
        .parse::<Uri>()
        .context("invalid control endpoint URI")?;

    let identity = ctx.state.identity();
    Request::builder()
        .method("CONNECT")
        .uri(uri)
        .header("host", authority)
        .header(ACCESS_KEY_HEADER, identity.access_key)
        .header(CLIENT_ID_HEADER, identity.client_id)
        .header(VERSION_HEADER, identity.version)
        .body(())
        .context("build control CONNECT request")
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

trait ControlIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> ControlIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

async fn connect_transport(endpoint: &ControlEndpoint) -> anyhow::Result<Box<dyn ControlIo>> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to dial control service {addr}"))?;
    stream.set_nodelay(true)?;

    if !endpoint.use_tls {
        return Ok(Box::new(stream));
    }

    let connector = TlsConnector::from(tls_config());
    let server_name = resolve_server_name(&endpoint.host)?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .context("tls handshake with control service")?;
    Ok(Box::new(tls_stream))
}

fn tls_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

fn resolve_server_name(host: &str) -> anyhow::Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned()).map_err(|err| anyhow!("invalid control host: {err}"))
}
