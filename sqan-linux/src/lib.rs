//! SqAN Linux node: TCP relay server and client around `sqan-core`.

pub mod auth;
pub mod client;
pub mod config;
pub mod logging;
pub mod relay;
pub mod server;

pub use auth::{Authenticator, Permissive};
pub use client::RelayClient;
pub use relay::{EventSink, RelayError, RelaySettings, SharedCore};
pub use server::{RelayServer, ServerStats};
