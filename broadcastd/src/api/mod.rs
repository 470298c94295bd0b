//! HTTP/WebSocket control plane over the [`Broadcast`](crate::broadcast::Broadcast).

pub mod error;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
