//! Outbound SMTP client for the mxrelay delivery engine.
//!
//! The client speaks just enough ESMTP to hand one message to one server:
//! greeting, EHLO/HELO, STARTTLS, AUTH, MAIL FROM, RCPT TO, DATA and QUIT,
//! each bounded by a per-command timeout.

pub mod client;

pub use client::{
    AuthMechanism, ClientError, ConnectOptions, Credentials, DotStuffer, DsnNotify, DsnRet,
    EsmtpFeatures, Response, SmtpClient, SmtpTimeouts, SslMode,
};
