//! Typed demultiplexer for inbound control messages.
//!
//! Every message with a `requestId` produces exactly one reply frame
//! echoing it. Handler failures surface only through the reply's result
//! code; nothing here can crash the worker.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use anssl_common::{
    ExecuteBusinessResponse, ExecuteBusinessType, MessageType, NotifyRequest, NotifyResponse,
    ProviderInfo, RequestResult,
};

use crate::challenge::ChallengeStore;
use crate::deploy::CertDeployer;
use crate::providers::ProviderRegistry;
use crate::state::SharedState;
use crate::{telemetry, version};

/// Everything a handler task needs, shared across the worker's lifetime.
pub struct DispatchContext {
    pub state: SharedState,
    pub store: Arc<ChallengeStore>,
    pub providers: ProviderRegistry,
    pub deployer: CertDeployer,
    shutdown_tx: watch::Sender<bool>,
}

impl DispatchContext {
    pub fn new(
        state: SharedState,
        store: Arc<ChallengeStore>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Arc<Self> {
        let providers = ProviderRegistry::from_config(&state.cfg.provider);
        let deployer = CertDeployer::new(
            state.cfg.ssl.clone(),
            state.http.clone(),
            state.cfg.server.access_key.clone(),
        );
        Arc::new(Self {
            state,
            store,
            providers,
            deployer,
            shutdown_tx,
        })
    }

    /// Ask the worker to exit cleanly (zero status) so the supervisor takes
    /// over; used after a successful self-update.
    pub fn request_clean_exit(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub async fn dispatch(
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    message: NotifyResponse,
) {
    telemetry::record_message(type_label(message.message_type));

    match message.message_type {
        MessageType::Unknown => {}
        MessageType::Connect => {
            let provider = message
                .connect_request
                .map(|c| c.provider)
                .unwrap_or_default();
            handle_connect(ctx, frame_tx, &message.request_id, &provider).await;
        }
        MessageType::Challenge => {
            if let Some(payload) = message.execute_business_response {
                handle_challenge(&ctx, payload).await;
            }
        }
        MessageType::ExecuteBusiness => {
            if let Some(payload) = message.execute_business_response {
                handle_execute_business(ctx, frame_tx, &message.request_id, payload).await;
            } else {
                warn!(request_id = %message.request_id, "EXECUTE_BUSINESS without payload");
                send_reply(
                    &frame_tx,
                    NotifyRequest::execute_reply(
                        &ctx.state.identity(),
                        &message.request_id,
                        RequestResult::Failed,
                    ),
                )
                .await;
            }
        }
        MessageType::UpdateVersion => handle_update(ctx).await,
        MessageType::GetProvider => handle_get_provider(ctx, frame_tx, &message.request_id).await,
    }
}

fn type_label(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Unknown => "UNKNOWN",
        MessageType::Connect => "CONNECT",
        MessageType::Challenge => "CHALLENGE",
        MessageType::ExecuteBusiness => "EXECUTE_BUSINESS",
        MessageType::UpdateVersion => "UPDATE_VERSION",
        MessageType::GetProvider => "GET_PROVIDER",
    }
}

async fn handle_connect(
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    request_id: &str,
    provider: &str,
) {
    let _busy = ctx.state.busy_guard();
    info!(provider, request_id, "connection test requested");

    let success = match ctx.providers.test_connection(provider).await {
        Ok(ok) => ok,
        Err(err) => {
            error!(?err, provider, "provider connection test failed");
            false
        }
    };

    send_reply(
        &frame_tx,
        NotifyRequest::connect_reply(&ctx.state.identity(), request_id, provider, success),
    )
    .await;
}

async fn handle_challenge(ctx: &Arc<DispatchContext>, payload: ExecuteBusinessResponse) {
    let token = payload.challenge_token;
    if token.is_empty() {
        return;
    }

    // An empty response is the server's eviction signal.
    if payload.challenge_response.is_empty() {
        ctx.store.delete(&token).await;
        info!(%token, domain = %payload.domain, "challenge removed");
        return;
    }

    ctx.store
        .set(&token, &payload.challenge_response, &payload.domain)
        .await;
    info!(%token, domain = %payload.domain, "challenge cached");
}

async fn handle_execute_business(
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    request_id: &str,
    payload: ExecuteBusinessResponse,
) {
    let _busy = ctx.state.busy_guard();
    info!(
        provider = %payload.provider,
        business_type = ?payload.execute_business_type,
        domain = %payload.domain,
        request_id,
        "execute business requested"
    );

    let result = execute_business(&ctx, &payload).await;

    send_reply(
        &frame_tx,
        NotifyRequest::execute_reply(&ctx.state.identity(), request_id, result),
    )
    .await;
}

async fn execute_business(
    ctx: &Arc<DispatchContext>,
    payload: &ExecuteBusinessResponse,
) -> RequestResult {
    if payload.domain.is_empty() {
        error!("execute business without a domain");
        return RequestResult::Failed;
    }

    if payload.provider.is_empty() {
        // No provider means the default behavior: install into every
        // configured local target.
        return match ctx.deployer.deploy_all(&payload.domain, &payload.url).await {
            Ok(()) => RequestResult::Success,
            Err(err) => {
                error!(?err, domain = %payload.domain, "certificate deployment failed");
                RequestResult::Failed
            }
        };
    }

    if payload.provider == "ansslCli" {
        let deploy = match payload.execute_business_type {
            ExecuteBusinessType::AnsslCliCert => {
                ctx.deployer.deploy_nginx(&payload.domain, &payload.url).await
            }
            ExecuteBusinessType::AnsslCliApacheCert => {
                ctx.deployer.deploy_apache(&payload.domain, &payload.url).await
            }
            ExecuteBusinessType::AnsslCliRustfsCert => {
                ctx.deployer.deploy_rustfs(&payload.domain, &payload.url).await
            }
            ExecuteBusinessType::AnsslCli1PanelCert => {
                ctx.deployer.deploy_one_panel(&payload.domain, &payload.url).await
            }
            ExecuteBusinessType::AnsslCliFeiniuCert => {
                ctx.deployer.deploy_feiniu(&payload.domain, &payload.url).await
            }
            ExecuteBusinessType::UploadCert | ExecuteBusinessType::Unsupported => {
                warn!(business_type = ?payload.execute_business_type, "unsupported business type for ansslCli");
                return RequestResult::NotSupported;
            }
        };

        return match deploy {
            Ok(()) => RequestResult::Success,
            Err(err) => {
                error!(?err, domain = %payload.domain, "certificate deployment failed");
                RequestResult::Failed
            }
        };
    }

    if !ctx.providers.contains(&payload.provider) {
        warn!(provider = %payload.provider, "unsupported provider");
        return RequestResult::NotSupported;
    }

    if payload.execute_business_type != ExecuteBusinessType::UploadCert {
        warn!(
            provider = %payload.provider,
            business_type = ?payload.execute_business_type,
            "unsupported business type for cloud provider"
        );
        return RequestResult::NotSupported;
    }

    let remark = format!(
        "{}_{}",
        payload.domain,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    match ctx
        .providers
        .upload_certificate(
            &payload.provider,
            &remark,
            &payload.domain,
            &payload.cert,
            &payload.key,
        )
        .await
    {
        Ok(()) => {
            info!(provider = %payload.provider, %remark, "certificate uploaded");
            telemetry::record_provider_upload(&payload.provider, "success");
            RequestResult::Success
        }
        Err(err) => {
            error!(?err, provider = %payload.provider, "certificate upload failed");
            telemetry::record_provider_upload(&payload.provider, "failure");
            RequestResult::Failed
        }
    }
}

async fn handle_update(ctx: Arc<DispatchContext>) {
    info!("update notification received");

    let options = anssl_updater::UpdateOptions {
        mirror: ctx.state.cfg.update.mirror.clone(),
        custom_url: ctx.state.cfg.update.custom_url.clone(),
        proxy: ctx.state.cfg.update.proxy.clone(),
    };

    let info = match anssl_updater::check_update(&options, version::VERSION).await {
        Ok(info) => info,
        Err(err) => {
            error!(?err, "update check failed");
            return;
        }
    };

    if !info.has_update {
        return;
    }

    info!(current = %info.current_version, latest = %info.latest_version, "new version found");

    if let Err(err) = anssl_updater::perform_update(&options, &info).await {
        error!(?err, "update failed");
        return;
    }

    if let Err(err) = anssl_updater::write_update_marker(&info.latest_version) {
        error!(?err, "failed to write update marker");
        return;
    }

    info!("update applied, restarting");
    ctx.request_clean_exit();
}

async fn handle_get_provider(
    ctx: Arc<DispatchContext>,
    frame_tx: mpsc::Sender<NotifyRequest>,
    request_id: &str,
) {
    info!(request_id, "provider list requested");

    let providers: Vec<ProviderInfo> = ctx
        .state
        .cfg
        .provider
        .iter()
        .map(|p| ProviderInfo {
            name: p.name.clone(),
            remark: p.remark.clone(),
        })
        .collect();

    send_reply(
        &frame_tx,
        NotifyRequest::provider_reply(&ctx.state.identity(), request_id, providers),
    )
    .await;
}

async fn send_reply(frame_tx: &mpsc::Sender<NotifyRequest>, frame: NotifyRequest) {
    if let Err(err) = frame_tx.send(frame).await {
        error!(?err, "failed to enqueue reply frame");
    }
}
