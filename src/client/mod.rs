//! SMTP client used for the upstream relay dialogue.
//!
//! Supports plain TCP, implicit TLS and STARTTLS, AUTH PLAIN / LOGIN /
//! XOAUTH2, and dot-stuffed DATA transfer.
//!
//! ```no_run
//! use smtp_relay::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("localhost:2525", "localhost".to_string()).await?;
//! client.read_greeting().await?;
//! client.ehlo("relay.example.com").await?;
//! client.mail_from("sender@example.com").await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: Test\r\n\r\nHello World").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{dot_stuff, SmtpClient};

#[cfg(test)]
pub(crate) use smtp_client::insecure_connector;
