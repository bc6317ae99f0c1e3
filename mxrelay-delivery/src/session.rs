//! One delivery attempt of one queued item.
//!
//! A [`RelaySession`] walks the relay state machine as a single linear async
//! function: resolve targets, then select and connect (failing over to the
//! next target only when the connection itself fails), then EHLO, optional
//! STARTTLS and AUTH, MAIL FROM, RCPT TO and DATA. Every step races the
//! session's disconnect signal. Whatever the outcome, [`RelaySession`]
//! tears down exactly once: the admission slot is released, the client is
//! dropped and the completion callback runs.

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use mxrelay_common::internal;
use mxrelay_smtp::{AuthMechanism, ClientError, SslMode};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::watch,
    time::Instant,
};
use tracing::{Instrument, debug, info, warn};
use ulid::Ulid;

use crate::{
    admission::AdmissionPermit,
    config::SmartHost,
    error::RelayError,
    resolver::resolve_targets,
    selector::{Selection, select_next},
    server::RelayContext,
    transport::{ConnectRequest, SmtpConnection},
    types::{IpBindInfo, RelayQueueItem, RelayTarget},
};

pub type SessionId = Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    ResolvingTargets,
    Connecting,
    Greeting,
    StartingTls,
    Authenticating,
    SendingMailFrom,
    SendingRcptTo,
    SendingData,
    Succeeded,
    Failed,
    Disposed,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Disposed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "Created",
            Self::ResolvingTargets => "Target resolution",
            Self::Connecting => "Connect",
            Self::Greeting => "EHLO",
            Self::StartingTls => "STARTTLS",
            Self::Authenticating => "AUTH",
            Self::SendingMailFrom => "MAIL FROM",
            Self::SendingRcptTo => "RCPT TO",
            Self::SendingData => "DATA",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Disposed => "Disposed",
        })
    }
}

/// A point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub from: String,
    pub to: String,
    pub message_id: String,
    pub queue: String,
    pub tag: Option<String>,
    pub state: SessionState,
    pub created_at: SystemTime,
    pub connected_at: Option<SystemTime>,
    pub last_activity: SystemTime,
    pub remote_host: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub is_secure: bool,
    pub expected_timeout_remaining: Duration,
}

#[derive(Debug)]
struct Progress {
    state: SessionState,
    connected_at: Option<SystemTime>,
    last_activity: Instant,
    last_activity_at: SystemTime,
    remote_host: Option<String>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    is_secure: bool,
}

/// The shared, observable half of a session.
///
/// The registry and operators hold this; the running task owns the
/// [`RelaySession`].
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    item: Arc<RelayQueueItem>,
    created_at: SystemTime,
    idle_timeout: Duration,
    progress: RwLock<Progress>,
    disconnect: watch::Sender<Option<String>>,
    disposed: AtomicBool,
}

impl SessionHandle {
    #[must_use]
    pub fn new(item: Arc<RelayQueueItem>, idle_timeout: Duration) -> Self {
        let now = SystemTime::now();
        let (disconnect, _) = watch::channel(None);

        Self {
            id: Ulid::new(),
            item,
            created_at: now,
            idle_timeout,
            progress: RwLock::new(Progress {
                state: SessionState::Created,
                connected_at: None,
                last_activity: Instant::now(),
                last_activity_at: now,
                remote_host: None,
                local_addr: None,
                remote_addr: None,
                is_secure: false,
            }),
            disconnect,
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn item(&self) -> &RelayQueueItem {
        &self.item
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.progress.read().state
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Idle timeout minus the time since the last activity, never negative.
    ///
    /// Activity is a state change or message body being streamed. Waiting
    /// for a reply is idle time; the deadline for each command is enforced
    /// separately by the SMTP client's per-command timeouts.
    #[must_use]
    pub fn expected_timeout_remaining(&self) -> Duration {
        let elapsed = self.progress.read().last_activity.elapsed();
        self.idle_timeout.saturating_sub(elapsed)
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        let progress = self.progress.read();

        SessionInfo {
            id: self.id,
            from: self.item.from.clone(),
            to: self.item.to.clone(),
            message_id: self.item.message_id.clone(),
            queue: self.item.queue.clone(),
            tag: self.item.tag.clone(),
            state: progress.state,
            created_at: self.created_at,
            connected_at: progress.connected_at,
            last_activity: progress.last_activity_at,
            remote_host: progress.remote_host.clone(),
            local_addr: progress.local_addr,
            remote_addr: progress.remote_addr,
            is_secure: progress.is_secure,
            expected_timeout_remaining: self
                .idle_timeout
                .saturating_sub(progress.last_activity.elapsed()),
        }
    }

    /// Abandon the session. The in-flight step fails and the session ends.
    pub fn disconnect(&self) {
        self.disconnect_with("Disconnected by operator");
    }

    pub fn disconnect_with(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.disconnect.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    fn disconnected(&self) -> watch::Receiver<Option<String>> {
        self.disconnect.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut progress = self.progress.write();
        f(&mut progress);
        progress.last_activity = Instant::now();
        progress.last_activity_at = SystemTime::now();
    }

    fn touch(&self) {
        self.update(|_| {});
    }

    fn set_state(&self, state: SessionState) {
        self.update(|progress| progress.state = state);
    }
}

/// Message body reader that records activity on its session while bytes
/// flow.
struct ActivityReader<'a, R: ?Sized> {
    inner: &'a mut R,
    handle: &'a SessionHandle,
}

impl<'a, R: AsyncRead + Unpin + ?Sized> ActivityReader<'a, R> {
    const fn new(inner: &'a mut R, handle: &'a SessionHandle) -> Self {
        Self { inner, handle }
    }
}

impl<R: AsyncRead + Unpin + ?Sized> AsyncRead for ActivityReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        let poll = Pin::new(&mut *this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.handle.touch();
        }

        poll
    }
}

/// Called once with the final snapshot and outcome of a session.
pub type OnComplete = Box<dyn FnOnce(SessionInfo, Result<(), RelayError>) + Send>;

/// The running half of a session.
pub struct RelaySession {
    handle: Arc<SessionHandle>,
    context: Arc<RelayContext>,
    smart_hosts: Vec<SmartHost>,
    disconnect: watch::Receiver<Option<String>>,
    permit: Option<AdmissionPermit>,
    client: Option<Box<dyn SmtpConnection>>,
    on_complete: Option<OnComplete>,
}

impl fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.handle.id)
            .field("state", &self.handle.state())
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}

/// Run `future` unless the session is disconnected first.
async fn until_disconnected<F: Future>(
    signal: &mut watch::Receiver<Option<String>>,
    future: F,
) -> Result<F::Output, RelayError> {
    let disconnected = async {
        let reason = signal
            .wait_for(Option::is_some)
            .await
            .map(|reason| (*reason).clone().unwrap_or_default());
        match reason {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        reason = disconnected => Err(RelayError::Disconnected(reason)),
        output = future => Ok(output),
    }
}

impl RelaySession {
    /// `smart_hosts` is the list for this session, already rotated by the
    /// server in load balance mode.
    #[must_use]
    pub fn new(
        handle: Arc<SessionHandle>,
        context: Arc<RelayContext>,
        smart_hosts: Vec<SmartHost>,
        on_complete: OnComplete,
    ) -> Self {
        let disconnect = handle.disconnected();

        Self {
            handle,
            context,
            smart_hosts,
            disconnect,
            permit: None,
            client: None,
            on_complete: Some(on_complete),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Make the one delivery attempt and tear down.
    pub async fn run(mut self) {
        let span = tracing::info_span!(
            "relay_session",
            session_id = %self.handle.id,
            message_id = %self.handle.item.message_id,
        );

        let outcome = self.deliver().instrument(span.clone()).await;

        if let Err(RelayError::Disconnected(text)) = &outcome {
            self.farewell(text).instrument(span.clone()).await;
        }

        let _enter = span.enter();
        match &outcome {
            Ok(()) => info!(to = %self.handle.item.to, "Message relayed"),
            Err(error) => warn!(to = %self.handle.item.to, %error, "Relay failed"),
        }

        self.dispose(outcome);
    }

    async fn deliver(&mut self) -> Result<(), RelayError> {
        let item = Arc::clone(&self.handle.item);
        let context = Arc::clone(&self.context);

        internal!("Relaying {} to {}", item.message_id, item.to);

        self.handle.set_state(SessionState::ResolvingTargets);
        let mut targets = until_disconnected(
            &mut self.disconnect,
            resolve_targets(
                &item.to,
                context.config.relay_mode,
                &self.smart_hosts,
                context.resolver.as_ref(),
            ),
        )
        .await??;

        let (target, binding) = self.connect(&mut targets).await?;
        let host_name = binding
            .host_name
            .clone()
            .unwrap_or_else(|| context.host_name.clone());

        self.handle.set_state(SessionState::Greeting);
        self.greet(&host_name).await?;

        let wants_tls = target.ssl_mode == SslMode::Tls
            || (context.config.use_tls_if_possible
                && self.client()?.esmtp_features().supports("STARTTLS"));

        if wants_tls && !self.client()?.is_secure() {
            self.handle.set_state(SessionState::StartingTls);
            let (disconnect, client) = self.connection(SessionState::StartingTls)?;
            until_disconnected(disconnect, client.starttls())
                .await?
                .map_err(RelayError::protocol(SessionState::StartingTls))?;
            self.handle.update(|progress| progress.is_secure = true);

            self.handle.set_state(SessionState::Greeting);
            self.greet(&host_name).await?;
        }

        if let Some(credentials) = &target.credentials {
            self.handle.set_state(SessionState::Authenticating);

            let offered = self.client()?.esmtp_features().auth_mechanisms();
            let mechanism = AuthMechanism::strongest(&offered).ok_or_else(|| {
                RelayError::protocol(SessionState::Authenticating)(ClientError::Unsupported(
                    format!("no common AUTH mechanism in {offered:?}"),
                ))
            })?;

            debug!(%mechanism, "Authenticating");
            let (disconnect, client) = self.connection(SessionState::Authenticating)?;
            until_disconnected(disconnect, client.auth(mechanism, credentials))
                .await?
                .map_err(RelayError::protocol(SessionState::Authenticating))?;
        }

        let features = self.client()?.esmtp_features();
        let dsn = features.supports("DSN");
        let advertises_size = features.supports("SIZE");
        let size_limit = features.max_size();

        self.handle.set_state(SessionState::SendingMailFrom);
        let size = if advertises_size {
            item.body.size().await
        } else {
            None
        };
        if let (Some(size), Some(limit)) = (size, size_limit)
            && size > limit
        {
            return Err(RelayError::protocol(SessionState::SendingMailFrom)(
                ClientError::MessageTooLarge { size, limit },
            ));
        }
        let ret = item.dsn.ret.filter(|_| dsn);
        let envid = item.dsn.envid.as_deref().filter(|_| dsn);
        let (disconnect, client) = self.connection(SessionState::SendingMailFrom)?;
        until_disconnected(disconnect, client.mail_from(&item.from, size, ret, envid))
            .await?
            .map_err(RelayError::protocol(SessionState::SendingMailFrom))?;

        self.handle.set_state(SessionState::SendingRcptTo);
        let notify = item.dsn.notify.filter(|notify| dsn && !notify.is_empty());
        let orcpt = item.dsn.orcpt.as_deref().filter(|_| dsn);
        let (disconnect, client) = self.connection(SessionState::SendingRcptTo)?;
        until_disconnected(disconnect, client.rcpt_to(&item.to, notify, orcpt))
            .await?
            .map_err(RelayError::protocol(SessionState::SendingRcptTo))?;

        self.handle.set_state(SessionState::SendingData);
        let mut body = item
            .body
            .open()
            .await
            .map_err(|e| RelayError::protocol(SessionState::SendingData)(ClientError::Io(e)))?;
        let handle = Arc::clone(&self.handle);
        let mut body = ActivityReader::new(body.as_mut(), &handle);
        let (disconnect, client) = self.connection(SessionState::SendingData)?;
        until_disconnected(disconnect, client.send_message(&mut body))
            .await?
            .map_err(RelayError::protocol(SessionState::SendingData))?;

        self.handle.set_state(SessionState::Succeeded);

        if let Some(client) = self.client.as_mut() {
            match until_disconnected(&mut self.disconnect, client.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => debug!(%error, "QUIT after delivery failed"),
                Err(_) => debug!("Disconnected before QUIT completed"),
            }
        }

        Ok(())
    }

    /// Select and connect, failing over to the next target on connect
    /// failure only.
    async fn connect(
        &mut self,
        targets: &mut Vec<RelayTarget>,
    ) -> Result<(RelayTarget, Arc<IpBindInfo>), RelayError> {
        let config = &self.context.config;
        let mut last_error = None;

        loop {
            self.handle.set_state(SessionState::Connecting);

            let Selection {
                target,
                binding,
                permit,
            } = match select_next(
                targets,
                &self.context.admission,
                config.relay_mode,
                config.balance_mode,
            ) {
                Ok(selection) => selection,
                Err(reason) => {
                    return Err(RelayError::NoTarget {
                        reason,
                        last_error: last_error.map(Box::new),
                    });
                }
            };

            debug!(%target, local = %binding.ip, "Connecting");
            self.handle
                .update(|progress| progress.remote_host = Some(target.host_name.clone()));

            let request = ConnectRequest {
                local: binding.ip,
                remote: target.endpoint,
                server_name: target.host_name.clone(),
                ssl_mode: target.ssl_mode,
                client_certificate: binding.certificate.clone(),
            };

            match until_disconnected(&mut self.disconnect, self.context.connector.connect(request))
                .await?
            {
                Ok(client) => {
                    self.handle.update(|progress| {
                        progress.connected_at = Some(SystemTime::now());
                        progress.local_addr = client.local_addr();
                        progress.remote_addr = client.peer_addr().or(Some(target.endpoint));
                        progress.is_secure = client.is_secure();
                    });

                    self.permit = Some(permit);
                    self.client = Some(client);

                    return Ok((target, binding));
                }
                Err(source) => {
                    warn!(%target, error = %source, "Connect failed, trying next target");
                    drop(permit);
                    last_error = Some(RelayError::Connect {
                        target: target.endpoint,
                        source,
                    });
                }
            }
        }
    }

    /// Say goodbye on a connection abandoned by a disconnect.
    async fn farewell(&mut self, text: &str) {
        if let Some(client) = self.client.as_mut()
            && let Err(error) = client.farewell(text).await
        {
            debug!(%error, "Farewell not delivered");
        }
    }

    /// EHLO, falling back to HELO when EHLO is not understood.
    async fn greet(&mut self, host_name: &str) -> Result<(), RelayError> {
        let (disconnect, client) = self.connection(SessionState::Greeting)?;

        match until_disconnected(disconnect, client.ehlo(host_name)).await? {
            Ok(()) => Ok(()),
            Err(error) if matches!(error.code(), Some(500..=502 | 504)) => {
                debug!(%error, "EHLO not supported, falling back to HELO");
                until_disconnected(disconnect, client.helo(host_name))
                    .await?
                    .map_err(RelayError::protocol(SessionState::Greeting))
            }
            Err(error) => Err(RelayError::protocol(SessionState::Greeting)(error)),
        }
    }

    /// The disconnect signal and the live connection, borrowed together.
    fn connection(
        &mut self,
        stage: SessionState,
    ) -> Result<
        (
            &mut watch::Receiver<Option<String>>,
            &mut (dyn SmtpConnection + 'static),
        ),
        RelayError,
    > {
        let client = self.client.as_deref_mut().ok_or(RelayError::Protocol {
            stage,
            source: ClientError::ConnectionClosed,
        })?;

        Ok((&mut self.disconnect, client))
    }

    fn client(&self) -> Result<&dyn SmtpConnection, RelayError> {
        self.client.as_deref().ok_or(RelayError::Protocol {
            stage: self.handle.state(),
            source: ClientError::ConnectionClosed,
        })
    }

    /// Tear down exactly once: release the admission slot, drop the client
    /// and report the outcome.
    pub(crate) fn dispose(&mut self, outcome: Result<(), RelayError>) {
        if self.handle.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.permit.take();
        self.client.take();

        self.handle.set_state(if outcome.is_ok() {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        });

        let info = self.handle.info();
        self.handle.set_state(SessionState::Disposed);

        if let Some(on_complete) = self.on_complete.take() {
            on_complete(info, outcome);
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.dispose(Err(RelayError::Disconnected(
            "Session aborted before completion".to_string(),
        )));
    }
}
