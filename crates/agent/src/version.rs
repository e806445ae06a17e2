/// Version string reported on registration and heartbeats, `v`-prefixed to
/// match release tag names.
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
