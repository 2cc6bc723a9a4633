//! `keyserver`: HTTP surface, mutual-TLS listener and background tasks
//! around the policy engine.

pub mod app;
pub mod cli;
pub mod context;
pub mod error;
pub mod middleware;
pub mod server;
pub mod tls;

pub use app::{AppState, build_app};
pub use error::ServerError;
