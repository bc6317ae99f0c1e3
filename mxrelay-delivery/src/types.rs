//! Value records shared by the relay components.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use mxrelay_smtp::{Credentials, DsnNotify, DsnRet, SslMode};
use serde::Deserialize;
use tokio::io::AsyncRead;

/// Readable message content handed to the SMTP client.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// The message content of a queued item, owned by the queue.
#[derive(Clone)]
pub enum MessageBody {
    Memory(Arc<[u8]>),
    File(PathBuf),
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl MessageBody {
    /// Size in bytes when it can be determined.
    pub async fn size(&self) -> Option<u64> {
        match self {
            Self::Memory(bytes) => u64::try_from(bytes.len()).ok(),
            Self::File(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
        }
    }

    /// Open a fresh reader positioned at the start of the content.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be opened.
    pub async fn open(&self) -> io::Result<BodyReader> {
        Ok(match self {
            Self::Memory(bytes) => Box::new(io::Cursor::new(Arc::clone(bytes))),
            Self::File(path) => Box::new(tokio::fs::File::open(path).await?),
        })
    }
}

impl From<Vec<u8>> for MessageBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Memory(Arc::from(bytes))
    }
}

impl From<&[u8]> for MessageBody {
    fn from(bytes: &[u8]) -> Self {
        Self::Memory(Arc::from(bytes))
    }
}

/// DSN parameters carried from submission to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DsnParameters {
    pub ret: Option<DsnRet>,
    pub envid: Option<String>,
    pub notify: Option<DsnNotify>,
    pub orcpt: Option<String>,
}

/// One delivery work order: a single recipient of a single message.
#[derive(Debug, Clone)]
pub struct RelayQueueItem {
    pub from: String,
    pub to: String,
    pub message_id: String,
    pub body: MessageBody,
    pub dsn: DsnParameters,
    /// Opaque value for the queue's own bookkeeping.
    pub tag: Option<String>,
    /// Name of the queue that produced the item.
    pub queue: String,
}

impl RelayQueueItem {
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<MessageBody>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_id: message_id.into(),
            body: body.into(),
            dsn: DsnParameters::default(),
            tag: None,
            queue: String::from("default"),
        }
    }

    #[must_use]
    pub fn with_dsn(mut self, dsn: DsnParameters) -> Self {
        self.dsn = dsn;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl From<IpAddr> for AddressFamily {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// A candidate destination for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host_name: String,
    pub endpoint: SocketAddr,
    pub ssl_mode: SslMode,
    pub credentials: Option<Credentials>,
}

impl RelayTarget {
    #[must_use]
    pub fn new(host_name: impl Into<String>, endpoint: SocketAddr) -> Self {
        Self {
            host_name: host_name.into(),
            endpoint,
            ssl_mode: SslMode::None,
            credentials: None,
        }
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.endpoint.ip()
    }

    #[must_use]
    pub const fn family(&self) -> AddressFamily {
        match self.endpoint {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host_name, self.endpoint)
    }
}

/// A local source address the relay may connect from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IpBindInfo {
    pub ip: IpAddr,
    /// Name announced in EHLO; the system host name when unset.
    #[serde(default)]
    pub host_name: Option<String>,
    /// PEM certificate chain and key offered when a server asks for a
    /// client certificate.
    #[serde(default)]
    pub certificate: Option<PathBuf>,
}

impl IpBindInfo {
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            host_name: None,
            certificate: None,
        }
    }

    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    #[must_use]
    pub fn with_certificate(mut self, certificate: impl Into<PathBuf>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    #[must_use]
    pub fn family(&self) -> AddressFamily {
        AddressFamily::from(self.ip)
    }
}
