//! Gateway core: inbound authentication, error taxonomy, upstream dispatch
//! and the per-request orchestration pipeline behind the two public
//! surfaces.

pub mod auth;
pub mod convert;
pub mod error;
pub mod handler;
pub mod orchestrator;
pub mod state;
pub mod upstream;

pub use auth::{ClientAuth, Identity};
pub use error::GatewayError;
pub use state::AppState;
