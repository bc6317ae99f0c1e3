//! Scripted collaborators for driving relay sessions without a network

use std::{
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use mxrelay_common::Domain;
use mxrelay_delivery::{
    ConnectRequest, DnsError, HostAddresses, Resolve, SmtpConnection, SmtpConnector,
};
use mxrelay_smtp::{
    AuthMechanism, ClientError, Credentials, DsnNotify, DsnRet, EsmtpFeatures, SslMode,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Resolves from fixed tables.
#[derive(Debug, Default)]
pub struct StaticResolver {
    exchangers: HashMap<String, Vec<HostAddresses>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_exchanger(mut self, domain: &str, host: &str, addresses: &[&str]) -> Self {
        let addresses = parse_all(addresses);
        self.hosts.insert(host.to_string(), addresses.clone());
        self.exchangers
            .entry(domain.to_string())
            .or_default()
            .push(HostAddresses::new(host, addresses));
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, addresses: &[&str]) -> Self {
        self.hosts.insert(host.to_string(), parse_all(addresses));
        self
    }
}

fn parse_all(addresses: &[&str]) -> Vec<IpAddr> {
    addresses
        .iter()
        .map(|address| address.parse().unwrap())
        .collect()
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve_mail_exchangers(
        &self,
        domain: &Domain,
    ) -> Result<Vec<HostAddresses>, DnsError> {
        self.exchangers
            .get(domain.as_str())
            .cloned()
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_string()))
    }

    async fn resolve_addresses(&self, hosts: &[String]) -> Result<Vec<HostAddresses>, DnsError> {
        let resolved: Vec<_> = hosts
            .iter()
            .filter_map(|host| {
                self.hosts
                    .get(host)
                    .map(|addresses| HostAddresses::new(host.clone(), addresses.clone()))
            })
            .collect();

        if resolved.is_empty() {
            Err(DnsError::NoAddresses(hosts.join(", ")))
        } else {
            Ok(resolved)
        }
    }
}

/// Commands a scripted server can fail or stall on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Ehlo,
    Helo,
    StartTls,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Quit,
}

/// How a scripted server behaves once connected
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// EHLO keyword lines, without the greeting line
    pub features: Vec<String>,
    pub failures: HashMap<Stage, u16>,
    pub hang_at: Option<Stage>,
}

impl Script {
    #[must_use]
    pub fn with_features(features: &[&str]) -> Self {
        Self {
            features: features.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail(mut self, stage: Stage, code: u16) -> Self {
        self.failures.insert(stage, code);
        self
    }

    #[must_use]
    pub const fn hang(mut self, stage: Stage) -> Self {
        self.hang_at = Some(stage);
        self
    }
}

/// Opens [`ScriptedConnection`]s and records every attempt.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    default: Script,
    scripts: HashMap<IpAddr, Script>,
    refused: HashSet<IpAddr>,
    attempts: Mutex<Vec<ConnectRequest>>,
    commands: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(default: Script) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    /// Refuse connections to `ip`
    #[must_use]
    pub fn refuse(mut self, ip: &str) -> Self {
        self.refused.insert(ip.parse().unwrap());
        self
    }

    #[must_use]
    pub fn script(mut self, ip: &str, script: Script) -> Self {
        self.scripts.insert(ip.parse().unwrap(), script);
        self
    }

    pub fn attempts(&self) -> Vec<ConnectRequest> {
        self.attempts.lock().clone()
    }

    pub fn attempted(&self) -> Vec<SocketAddr> {
        self.attempts.lock().iter().map(|r| r.remote).collect()
    }

    /// Every command sent on any connection, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn command_starting(&self, prefix: &str) -> Option<String> {
        self.commands
            .lock()
            .iter()
            .find(|command| command.starts_with(prefix))
            .cloned()
    }

    /// Connections not yet dropped
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SmtpConnector for ScriptedConnector {
    async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<Box<dyn SmtpConnection>, ClientError> {
        self.attempts.lock().push(request.clone());
        tokio::task::yield_now().await;

        let ip = request.remote.ip();
        if self.refused.contains(&ip) {
            return Err(ClientError::Io(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        }

        self.open.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedConnection {
            script: self.scripts.get(&ip).unwrap_or(&self.default).clone(),
            commands: Arc::clone(&self.commands),
            open: Arc::clone(&self.open),
            features: EsmtpFeatures::default(),
            secure: request.ssl_mode == SslMode::Ssl,
            local: SocketAddr::new(request.local, 40_000),
            remote: request.remote,
        }))
    }
}

pub struct ScriptedConnection {
    script: Script,
    commands: Arc<Mutex<Vec<String>>>,
    open: Arc<AtomicUsize>,
    features: EsmtpFeatures,
    secure: bool,
    local: SocketAddr,
    remote: SocketAddr,
}

impl ScriptedConnection {
    async fn run(&self, stage: Stage, command: String) -> Result<(), ClientError> {
        self.commands.lock().push(command);

        if self.script.hang_at == Some(stage) {
            std::future::pending::<()>().await;
        }

        tokio::task::yield_now().await;

        match self.script.failures.get(&stage) {
            Some(&code) => Err(ClientError::SmtpError {
                code,
                message: "scripted failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SmtpConnection for ScriptedConnection {
    async fn ehlo(&mut self, host_name: &str) -> Result<(), ClientError> {
        self.run(Stage::Ehlo, format!("EHLO {host_name}")).await?;
        self.features = EsmtpFeatures::from_lines(self.script.features.iter().map(String::as_str));
        Ok(())
    }

    async fn helo(&mut self, host_name: &str) -> Result<(), ClientError> {
        self.run(Stage::Helo, format!("HELO {host_name}")).await?;
        self.features = EsmtpFeatures::default();
        Ok(())
    }

    async fn starttls(&mut self) -> Result<(), ClientError> {
        self.run(Stage::StartTls, "STARTTLS".to_string()).await?;
        self.secure = true;
        self.features = EsmtpFeatures::default();
        Ok(())
    }

    async fn auth(
        &mut self,
        mechanism: AuthMechanism,
        credentials: &Credentials,
    ) -> Result<(), ClientError> {
        self.run(
            Stage::Auth,
            format!("AUTH {} {}", mechanism.name(), credentials.username),
        )
        .await
    }

    async fn mail_from(
        &mut self,
        sender: &str,
        size: Option<u64>,
        ret: Option<DsnRet>,
        envid: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut command = format!("MAIL FROM:<{sender}>");
        if let Some(size) = size {
            command.push_str(&format!(" SIZE={size}"));
        }
        if let Some(ret) = ret {
            command.push_str(&format!(" RET={ret}"));
        }
        if let Some(envid) = envid {
            command.push_str(&format!(" ENVID={envid}"));
        }

        self.run(Stage::MailFrom, command).await
    }

    async fn rcpt_to(
        &mut self,
        recipient: &str,
        notify: Option<DsnNotify>,
        orcpt: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut command = format!("RCPT TO:<{recipient}>");
        if let Some(notify) = notify {
            command.push_str(&format!(" NOTIFY={notify}"));
        }
        if let Some(orcpt) = orcpt {
            command.push_str(&format!(" ORCPT=rfc822;{orcpt}"));
        }

        self.run(Stage::RcptTo, command).await
    }

    async fn send_message(
        &mut self,
        body: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), ClientError> {
        let mut content = Vec::new();
        body.read_to_end(&mut content).await?;

        self.run(Stage::Data, format!("DATA {} bytes", content.len()))
            .await
    }

    async fn quit(&mut self) -> Result<(), ClientError> {
        self.run(Stage::Quit, "QUIT".to_string()).await
    }

    async fn farewell(&mut self, text: &str) -> Result<(), ClientError> {
        self.commands.lock().push(format!("FAREWELL {text}"));
        Ok(())
    }

    fn esmtp_features(&self) -> &EsmtpFeatures {
        &self.features
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }
}
