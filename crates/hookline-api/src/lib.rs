//! HTTP ingress and configuration for hookline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

pub use config::{Config, WebhookRoute};
pub use server::{create_router, shutdown_signal, start_server, AppState};
