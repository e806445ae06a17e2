//! Shared DTOs exchanged between the anssl agent and the central service.

pub mod api;

pub use api::*;
