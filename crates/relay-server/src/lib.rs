pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pending;
pub mod relay;
pub mod server;

pub use config::ServerConfig;
pub use relay::Relay;
pub use server::{build_router, start, AppState, ServerHandle};
