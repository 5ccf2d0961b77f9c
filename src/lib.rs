pub mod auth;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod message;
pub mod normalize;
pub mod relay;
pub mod smtp;
pub mod status;
pub mod tls;

pub use tracing;

/// Broadcast from the controller to the listener and every session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
