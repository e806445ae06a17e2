use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use anssl_common::{AgentIdentity, SystemInfo};

use crate::{config::AppConfig, identity, version};

pub type SharedState = Arc<AgentState>;

/// State shared by every worker task. Mutable pieces are atomics; the system
/// info is computed once and memoized.
pub struct AgentState {
    pub cfg: AppConfig,
    pub client_id: String,
    pub http: reqwest::Client,
    system_info: OnceCell<SystemInfo>,
    busy_operations: AtomicI64,
    is_connected: AtomicBool,
}

pub fn new_state(cfg: AppConfig, client_id: String) -> anyhow::Result<SharedState> {
    let http = reqwest::Client::builder()
        .tcp_keepalive(Duration::from_secs(15))
        .build()?;

    Ok(Arc::new(AgentState {
        cfg,
        client_id,
        http,
        system_info: OnceCell::new(),
        busy_operations: AtomicI64::new(0),
        is_connected: AtomicBool::new(false),
    }))
}

impl AgentState {
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            access_key: self.cfg.server.access_key.clone(),
            client_id: self.client_id.clone(),
            version: version::VERSION.to_string(),
        }
    }

    pub async fn system_info(&self) -> SystemInfo {
        self.system_info
            .get_or_init(identity::collect_system_info)
            .await
            .clone()
    }

    /// RAII guard around CONNECT / EXECUTE_BUSINESS handlers; the counter is
    /// what the reconnect path inspects to warn about interrupted work.
    pub fn busy_guard(self: &Arc<Self>) -> BusyGuard {
        self.busy_operations.fetch_add(1, Ordering::SeqCst);
        BusyGuard {
            state: self.clone(),
        }
    }

    pub fn busy_operations(&self) -> i64 {
        self.busy_operations.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }
}

pub struct BusyGuard {
    state: SharedState,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.state.busy_operations.fetch_sub(1, Ordering::SeqCst);
    }
}
