//! anssl edge agent.
//!
//! The worker keeps one persistent control stream to the central service,
//! answers ACME HTTP-01 probes on the loopback, installs issued certificate
//! bundles into local web servers, and relays certificate material to
//! configured cloud providers. A thin supervisor process keeps the worker
//! alive across crashes and self-updates.

pub mod challenge;
pub mod config;
pub mod control;
pub mod deploy;
pub mod identity;
pub mod providers;
pub mod runner;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod telemetry;
pub mod version;

/// Headers attached to the control stream CONNECT request.
pub const ACCESS_KEY_HEADER: &str = "x-anssl-access-key";
pub const CLIENT_ID_HEADER: &str = "x-anssl-client-id";
pub const VERSION_HEADER: &str = "x-anssl-version";
