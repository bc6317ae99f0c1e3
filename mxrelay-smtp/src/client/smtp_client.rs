//! SMTP client with implicit TLS and STARTTLS support.

use std::{
    fmt::Write as _,
    future::Future,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncReadExt};

use mxrelay_common::{incoming, outgoing, tracing};

use super::{
    auth::{AuthMechanism, Credentials},
    connection::{Connection, SslMode},
    dot_stuff::DotStuffer,
    dsn::{DsnNotify, DsnRet, xtext},
    error::{ClientError, Result},
    features::EsmtpFeatures,
    response::Response,
    timeouts::SmtpTimeouts,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Size of the chunks read from the message body while sending `DATA`.
const CHUNK_SIZE: usize = 64 * 1024;

/// Where and how to open an SMTP connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Local address to bind (port 0). `None` or an unspecified address lets
    /// the operating system choose.
    pub local: Option<IpAddr>,
    pub remote: SocketAddr,
    /// Host name used for TLS server name verification.
    pub server_name: String,
    pub ssl_mode: SslMode,
    pub accept_invalid_certs: bool,
    /// PEM file with the certificate chain and key presented during TLS.
    pub client_certificate: Option<PathBuf>,
    pub timeouts: SmtpTimeouts,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(remote: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            local: None,
            remote,
            server_name: server_name.into(),
            ssl_mode: SslMode::None,
            accept_invalid_certs: false,
            client_certificate: None,
            timeouts: SmtpTimeouts::default(),
        }
    }

    #[must_use]
    pub const fn local(mut self, local: IpAddr) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub const fn ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub fn client_certificate(mut self, path: Option<PathBuf>) -> Self {
        self.client_certificate = path;
        self
    }

    #[must_use]
    pub fn timeouts(mut self, timeouts: SmtpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

async fn timed<T>(
    operation: &'static str,
    after: Duration,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| ClientError::Timeout { operation, after })?
}

/// One SMTP conversation with one server.
///
/// Every command checks the reply code and turns a rejection into
/// `ClientError::SmtpError`, so callers only ever see successful replies.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    accept_invalid_certs: bool,
    client_certificate: Option<PathBuf>,
    timeouts: SmtpTimeouts,
    features: EsmtpFeatures,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("server_name", &self.server_name)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("secure", &self.is_secure())
            .finish_non_exhaustive()
    }
}

impl SmtpClient {
    /// Connect, perform the implicit TLS handshake for `SslMode::Ssl`, and
    /// read the `220` greeting, all within the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened, the handshake fails,
    /// or the server does not greet with `220`.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let limit = options.timeouts.connect();
        timed("connect", limit, Self::establish(options)).await
    }

    async fn establish(options: ConnectOptions) -> Result<Self> {
        let mut connection = Connection::open(options.local, options.remote).await?;

        if options.ssl_mode == SslMode::Ssl {
            connection = connection
                .upgrade(
                    &options.server_name,
                    options.accept_invalid_certs,
                    options.client_certificate.as_deref(),
                )
                .await?;
        }

        let local_addr = connection.local_addr()?;
        let peer_addr = connection.peer_addr()?;

        tracing::debug!(%local_addr, %peer_addr, ssl_mode = ?options.ssl_mode, "Connected");

        let mut client = Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: options.server_name,
            accept_invalid_certs: options.accept_invalid_certs,
            client_certificate: options.client_certificate,
            timeouts: options.timeouts,
            features: EsmtpFeatures::default(),
            local_addr,
            peer_addr,
        };

        client.read_response().await?.expect(&[220])?;

        Ok(client)
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with `250`.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let limit = self.timeouts.ehlo();
        let response = timed("EHLO", limit, self.command(&format!("EHLO {domain}")))
            .await?
            .expect(&[250])?;

        self.features = EsmtpFeatures::from_ehlo(&response);
        Ok(response)
    }

    /// Sends HELO. The server is then assumed to offer no extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with `250`.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        let limit = self.timeouts.ehlo();
        let response = timed("HELO", limit, self.command(&format!("HELO {domain}")))
            .await?
            .expect(&[250])?;

        self.features = EsmtpFeatures::default();
        Ok(response)
    }

    /// Sends STARTTLS and upgrades the connection.
    ///
    /// The extensions from the previous EHLO are discarded; the caller must
    /// send EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the TLS handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let limit = self.timeouts.starttls();
        timed("STARTTLS", limit, async {
            let response = self.command("STARTTLS").await?.expect(&[220])?;

            let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
            self.connection = Some(
                connection
                    .upgrade(
                        &self.server_name,
                        self.accept_invalid_certs,
                        self.client_certificate.as_deref(),
                    )
                    .await?,
            );

            // Anything still buffered arrived before the handshake
            self.buffer_pos = 0;
            self.features = EsmtpFeatures::default();

            Ok(response)
        })
        .await
    }

    /// Authenticates with `mechanism`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects any step of the exchange.
    pub async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<Response> {
        let limit = self.timeouts.auth();
        timed("AUTH", limit, async {
            match mechanism {
                AuthMechanism::Plain => {
                    let line = format!("AUTH PLAIN {}", credentials.plain_response());
                    self.secret_command(&line, "AUTH PLAIN <redacted>")
                        .await?
                        .expect(&[235])
                }
                AuthMechanism::Login => {
                    self.command("AUTH LOGIN").await?.expect(&[334])?;
                    self.secret_command(&credentials.encoded_username(), "<username>")
                        .await?
                        .expect(&[334])?;
                    self.secret_command(&credentials.encoded_password(), "<password>")
                        .await?
                        .expect(&[235])
                }
                AuthMechanism::CramMd5 => {
                    let challenge = self.command("AUTH CRAM-MD5").await?.expect(&[334])?;
                    let response = credentials
                        .cram_md5_response(&challenge.message())
                        .ok_or_else(|| {
                            ClientError::ParseError(format!(
                                "Invalid CRAM-MD5 challenge: {}",
                                challenge.message()
                            ))
                        })?;
                    self.secret_command(&response, "<cram-md5 response>")
                        .await?
                        .expect(&[235])
                }
            }
        })
        .await
    }

    /// Sends MAIL FROM with the optional `SIZE`, `RET` and `ENVID` parameters.
    ///
    /// Parameters are sent as given; checking that the server advertised
    /// the matching extension is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with `250`.
    pub async fn mail_from(
        &mut self,
        sender: &str,
        size: Option<u64>,
        ret: Option<DsnRet>,
        envid: Option<&str>,
    ) -> Result<Response> {
        let mut command = format!("MAIL FROM:<{sender}>");
        if let Some(size) = size {
            let _ = write!(command, " SIZE={size}");
        }
        if let Some(ret) = ret {
            let _ = write!(command, " RET={ret}");
        }
        if let Some(envid) = envid {
            let _ = write!(command, " ENVID={}", xtext(envid));
        }

        let limit = self.timeouts.mail_from();
        timed("MAIL FROM", limit, self.command(&command))
            .await?
            .expect(&[250])
    }

    /// Sends RCPT TO with the optional `NOTIFY` and `ORCPT` parameters.
    /// A `NOTIFY` without conditions is left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with `250`/`251`.
    pub async fn rcpt_to(
        &mut self,
        recipient: &str,
        notify: Option<DsnNotify>,
        orcpt: Option<&str>,
    ) -> Result<Response> {
        let mut command = format!("RCPT TO:<{recipient}>");
        if let Some(notify) = notify.filter(|notify| !notify.is_empty()) {
            let _ = write!(command, " NOTIFY={notify}");
        }
        if let Some(orcpt) = orcpt {
            let _ = write!(command, " ORCPT=rfc822;{}", xtext(orcpt));
        }

        let limit = self.timeouts.rcpt_to();
        timed("RCPT TO", limit, self.command(&command))
            .await?
            .expect(&[250, 251])
    }

    /// Sends DATA, streams `body` dot-stuffed, and terminates it with `.`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the body or writing to the server fails,
    /// or if the server rejects `DATA` or the message.
    pub async fn send_message<R>(&mut self, body: &mut R) -> Result<Response>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let limit = self.timeouts.data();
        timed("DATA", limit, async {
            self.command("DATA").await?.expect(&[354])?;

            let mut stuffer = DotStuffer::new();
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let mut encoded = Vec::with_capacity(CHUNK_SIZE + CHUNK_SIZE / 32);
            let mut sent = 0usize;

            loop {
                let n = body.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }

                encoded.clear();
                stuffer.encode(&chunk[..n], &mut encoded);
                self.connection_mut()?.send(&encoded).await?;
                sent += n;
            }

            encoded.clear();
            stuffer.finish(&mut encoded);
            self.connection_mut()?.send(&encoded).await?;

            outgoing!("<message body, {} bytes>", sent);

            self.read_response().await?.expect(&[250])
        })
        .await
    }

    /// Sends QUIT and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or is not answered with `221`.
    pub async fn quit(&mut self) -> Result<Response> {
        let limit = self.timeouts.quit();
        let response = timed("QUIT", limit, self.command("QUIT")).await;

        if let Some(mut connection) = self.connection.take() {
            let _ = connection.shutdown().await;
        }

        response?.expect(&[221])
    }

    /// Writes `text` as a last line and closes the connection without
    /// waiting for a reply. Does nothing once the connection is closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the shutdown fails or times out.
    pub async fn farewell(&mut self, text: &str) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        let line = text.replace(['\r', '\n'], " ");
        outgoing!("{}", line);

        let limit = self.timeouts.quit();
        timed("farewell", limit, async move {
            connection.send(format!("{line}\r\n").as_bytes()).await?;
            connection.shutdown().await
        })
        .await
    }

    /// Extensions from the most recent EHLO.
    #[must_use]
    pub const fn features(&self) -> &EsmtpFeatures {
        &self.features
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(&self.connection, Some(connection) if connection.is_secure())
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn command(&mut self, command: &str) -> Result<Response> {
        self.secret_command(command, command).await
    }

    /// Send `command`, logging `shown` in its place.
    async fn secret_command(&mut self, command: &str, shown: &str) -> Result<Response> {
        outgoing!("{}", shown);

        let data = format!("{command}\r\n");
        self.connection_mut()?.send(data.as_bytes()).await?;

        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}
