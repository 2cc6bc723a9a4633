//! keyclient: obtains a keygranting certificate with a bootstrap token, then
//! keeps that certificate, the configured credentials and downloads fresh.

pub mod config;
pub mod daemon;
pub mod download;
pub mod error;
pub mod keys;
pub mod renewal;
pub mod retry;
pub mod state;
pub mod transport;
pub mod validity;

pub use config::ClientConfig;
pub use daemon::Keyclient;
pub use error::ClientError;
pub use state::{ClientState, StateHandle};
pub use transport::{Auth, HttpKeyserver, Keyserver};
