//! The inbound side: an ESMTP server speaking to local clients.

pub mod command;
pub mod connection;
pub mod extensions;
pub mod session;
pub mod state;

pub use self::{
    command::{Command, HeloVariant},
    session::{Session, SessionConfig},
    state::State,
};
