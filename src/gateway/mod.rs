pub mod auth;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod session;

pub use orchestrator::{Orchestrator, Outcome};
pub use server::{GatewayState, build_router};
