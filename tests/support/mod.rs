//! Test support utilities for end-to-end testing
//!
//! A mock upstream SMTP server plus a harness that runs the relay's listener
//! against it on loopback ports.

#![allow(dead_code)]

pub mod harness;
pub mod mock_server;

pub use harness::{Client, RelayHarness};
pub use mock_server::{MockSmtpServer, SmtpCommand};
