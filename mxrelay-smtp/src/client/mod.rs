//! SMTP client implementation.
//!
//! # Examples
//!
//! ```no_run
//! use mxrelay_smtp::client::{ConnectOptions, SmtpClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ConnectOptions::new("192.0.2.25:25".parse()?, "mx.example.com");
//! let mut client = SmtpClient::connect(options).await?;
//!
//! client.ehlo("relay.example.org").await?;
//! client.mail_from("sender@example.org", None, None, None).await?;
//! client.rcpt_to("rcpt@example.com", None, None).await?;
//! client
//!     .send_message(&mut &b"Subject: Hi\r\n\r\nHello\r\n"[..])
//!     .await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod dot_stuff;
mod dsn;
mod error;
mod features;
mod response;
mod smtp_client;
mod timeouts;

pub use auth::{AuthMechanism, Credentials};
pub use connection::SslMode;
pub use dot_stuff::DotStuffer;
pub use dsn::{DsnNotify, DsnRet, xtext};
pub use error::{ClientError, Result};
pub use features::EsmtpFeatures;
pub use response::{Response, ResponseLine};
pub use smtp_client::{ConnectOptions, SmtpClient};
pub use timeouts::SmtpTimeouts;
