//! SASL mechanisms for the SMTP `AUTH` command.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde::{Deserialize, Serialize};

type HmacMd5 = Hmac<Md5>;

/// Mechanisms the client can perform, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthMechanism {
    Plain,
    Login,
    CramMd5,
}

impl AuthMechanism {
    pub const ALL: [Self; 3] = [Self::Plain, Self::Login, Self::CramMd5];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }

    /// The strongest mechanism that is also offered by the server.
    #[must_use]
    pub fn strongest<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter(|mechanism| {
                offered
                    .iter()
                    .any(|offered| offered.as_ref().eq_ignore_ascii_case(mechanism.name()))
            })
            .max()
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// User name and password for a smart host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The RFC 4616 `PLAIN` initial response, base64 encoded.
    #[must_use]
    pub fn plain_response(&self) -> String {
        STANDARD.encode(format!("\0{}\0{}", self.username, self.password))
    }

    /// The RFC 2195 `CRAM-MD5` answer to a base64 encoded server challenge,
    /// or `None` if the challenge is not valid base64.
    #[must_use]
    pub fn cram_md5_response(&self, challenge: &str) -> Option<String> {
        let challenge = STANDARD.decode(challenge.trim()).ok()?;

        let mut mac = HmacMd5::new_from_slice(self.password.as_bytes()).ok()?;
        mac.update(&challenge);
        let digest = hex::encode(mac.finalize().into_bytes());

        Some(STANDARD.encode(format!("{} {digest}", self.username)))
    }

    #[must_use]
    pub fn encoded_username(&self) -> String {
        STANDARD.encode(&self.username)
    }

    #[must_use]
    pub fn encoded_password(&self) -> String {
        STANDARD.encode(&self.password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
