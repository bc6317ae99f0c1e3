//! The SMTP collaborator of a relay session.
//!
//! Sessions only talk to [`SmtpConnector`] and [`SmtpConnection`], so tests
//! can script every reply. [`TcpConnector`] is the real implementation on top
//! of [`SmtpClient`].

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use async_trait::async_trait;
use mxrelay_smtp::{
    AuthMechanism, ClientError, ConnectOptions, Credentials, DsnNotify, DsnRet, EsmtpFeatures,
    SmtpClient, SmtpTimeouts, SslMode,
};
use tokio::io::AsyncRead;

/// Everything needed to open one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub local: IpAddr,
    pub remote: SocketAddr,
    pub server_name: String,
    pub ssl_mode: SslMode,
    /// Certificate of the local binding, presented during TLS
    pub client_certificate: Option<PathBuf>,
}

#[async_trait]
pub trait SmtpConnector: Send + Sync {
    /// Connect and read the greeting. For `SslMode::Ssl` the TLS handshake
    /// happens first.
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn SmtpConnection>, ClientError>;
}

/// An established SMTP conversation. Dropping it closes the connection.
#[async_trait]
pub trait SmtpConnection: Send {
    async fn ehlo(&mut self, host_name: &str) -> Result<(), ClientError>;

    async fn helo(&mut self, host_name: &str) -> Result<(), ClientError>;

    async fn starttls(&mut self) -> Result<(), ClientError>;

    async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<(), ClientError>;

    async fn mail_from(
        &mut self,
        sender: &str,
        size: Option<u64>,
        ret: Option<DsnRet>,
        envid: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn rcpt_to(
        &mut self,
        recipient: &str,
        notify: Option<DsnNotify>,
        orcpt: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn send_message(
        &mut self,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ClientError>;

    async fn quit(&mut self) -> Result<(), ClientError>;

    /// Best-effort goodbye when the session is abandoned: write `text` and
    /// close.
    async fn farewell(&mut self, text: &str) -> Result<(), ClientError>;

    /// Extensions from the most recent EHLO.
    fn esmtp_features(&self) -> &EsmtpFeatures;

    fn is_secure(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Opens real connections with [`SmtpClient`].
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeouts: SmtpTimeouts,
    accept_invalid_certs: bool,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(timeouts: SmtpTimeouts, accept_invalid_certs: bool) -> Self {
        Self {
            timeouts,
            accept_invalid_certs,
        }
    }
}

#[async_trait]
impl SmtpConnector for TcpConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn SmtpConnection>, ClientError> {
        let options = ConnectOptions::new(request.remote, request.server_name)
            .local(request.local)
            .ssl_mode(request.ssl_mode)
            .accept_invalid_certs(self.accept_invalid_certs)
            .client_certificate(request.client_certificate)
            .timeouts(self.timeouts.clone());

        Ok(Box::new(SmtpClient::connect(options).await?))
    }
}

#[async_trait]
impl SmtpConnection for SmtpClient {
    async fn ehlo(&mut self, host_name: &str) -> Result<(), ClientError> {
        Self::ehlo(self, host_name).await.map(drop)
    }

    async fn helo(&mut self, host_name: &str) -> Result<(), ClientError> {
        Self::helo(self, host_name).await.map(drop)
    }

    async fn starttls(&mut self) -> Result<(), ClientError> {
        Self::starttls(self).await.map(drop)
    }

    async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<(), ClientError> {
        Self::auth(self, mechanism, credentials).await.map(drop)
    }

    async fn mail_from(
        &mut self,
        sender: &str,
        size: Option<u64>,
        ret: Option<DsnRet>,
        envid: Option<&str>,
    ) -> Result<(), ClientError> {
        Self::mail_from(self, sender, size, ret, envid)
            .await
            .map(drop)
    }

    async fn rcpt_to(
        &mut self,
        recipient: &str,
        notify: Option<DsnNotify>,
        orcpt: Option<&str>,
    ) -> Result<(), ClientError> {
        Self::rcpt_to(self, recipient, notify, orcpt).await.map(drop)
    }

    async fn send_message(
        &mut self,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ClientError> {
        Self::send_message(self, body).await.map(drop)
    }

    async fn quit(&mut self) -> Result<(), ClientError> {
        Self::quit(self).await.map(drop)
    }

    async fn farewell(&mut self, text: &str) -> Result<(), ClientError> {
        Self::farewell(self, text).await
    }

    fn esmtp_features(&self) -> &EsmtpFeatures {
        self.features()
    }

    fn is_secure(&self) -> bool {
        Self::is_secure(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(Self::local_addr(self))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(Self::peer_addr(self))
    }
}
