//! Owns the running relay sessions.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use mxrelay_common::{Signal, internal};
use tokio::{
    runtime::Handle,
    sync::{OwnedSemaphorePermit, Semaphore, broadcast},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use crate::{
    admission::AdmissionController,
    config::{BalanceMode, RelayConfig, RelayMode, SmartHost},
    dns::{DnsError, DnsResolver, Resolve},
    error::RelayError,
    queue::RelayQueue,
    session::{RelaySession, SessionHandle, SessionId, SessionInfo},
    transport::{SmtpConnector, TcpConnector},
    types::RelayQueueItem,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

/// Everything a session needs besides its item, shared by all sessions.
pub struct RelayContext {
    pub config: RelayConfig,
    pub admission: Arc<AdmissionController>,
    pub resolver: Arc<dyn Resolve>,
    pub connector: Arc<dyn SmtpConnector>,
    /// EHLO name for bindings without their own
    pub host_name: String,
}

impl fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayContext")
            .field("config", &self.config)
            .field("admission", &self.admission)
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        resolver: Arc<dyn Resolve>,
        connector: Arc<dyn SmtpConnector>,
    ) -> Self {
        let admission = Arc::new(AdmissionController::new(
            config.max_connections_per_ip,
            config.bindings.iter().cloned(),
        ));

        Self {
            config,
            admission,
            resolver,
            connector,
            host_name: system_host_name(),
        }
    }

    /// Build a context with the hickory DNS resolver and real SMTP
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be read.
    pub fn from_config(config: RelayConfig) -> Result<Self, DnsError> {
        let resolver = Arc::new(DnsResolver::new(config.dns.clone())?);
        let connector = Arc::new(TcpConnector::new(
            config.smtp_timeouts.clone(),
            config.accept_invalid_certs,
        ));

        Ok(Self::new(config, resolver, connector))
    }

    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }
}

fn system_host_name() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Published once per finished session.
#[derive(Debug, Clone)]
pub struct SessionCompleted {
    pub info: SessionInfo,
    pub error: Option<Arc<RelayError>>,
}

impl SessionCompleted {
    #[must_use]
    pub fn outcome(&self) -> Result<(), &RelayError> {
        self.error.as_deref().map_or(Ok(()), Err)
    }
}

/// Starts relay sessions and keeps track of the running ones.
pub struct RelayServer {
    context: Arc<RelayContext>,
    sessions: Arc<DashMap<SessionId, Arc<SessionHandle>>>,
    rotation: AtomicUsize,
    completed: broadcast::Sender<SessionCompleted>,
    limit: Option<Arc<Semaphore>>,
}

impl fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayServer")
            .field("context", &self.context)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    #[must_use]
    pub fn new(context: RelayContext) -> Self {
        let limit = (context.config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(context.config.max_connections)));
        let (completed, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);

        Self {
            context: Arc::new(context),
            sessions: Arc::new(DashMap::new()),
            rotation: AtomicUsize::new(0),
            completed,
            limit,
        }
    }

    #[must_use]
    pub fn context(&self) -> &RelayContext {
        &self.context
    }

    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.context.admission
    }

    /// Receive a [`SessionCompleted`] for every session that finishes from
    /// now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionCompleted> {
        self.completed.subscribe()
    }

    /// The sessions currently running
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Start one delivery attempt for `item`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_session(&self, item: RelayQueueItem) -> Arc<SessionHandle> {
        self.spawn_session(item, None, None).0
    }

    /// Pull items from `queue` and relay them until the queue is drained or
    /// a shutdown signal arrives.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop taking items from the queue
    /// 2. Disconnect in-flight sessions, which report their failure to the queue
    /// 3. Wait for them to finish (with 30s timeout)
    pub async fn serve(
        &self,
        queue: Arc<dyn RelayQueue>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        internal!("Relay server starting");

        loop {
            let slot = match &self.limit {
                Some(limit) => tokio::select! {
                    permit = Arc::clone(limit).acquire_owned() => permit.ok(),
                    sig = shutdown.recv() => {
                        self.on_signal(sig).await;
                        return;
                    }
                },
                None => None,
            };

            tokio::select! {
                item = queue.next() => {
                    let Some(item) = item else {
                        internal!("Relay queue closed, waiting for running sessions");
                        self.drain().await;
                        break;
                    };

                    self.spawn_session(item, Some(Arc::clone(&queue)), slot);
                }
                sig = shutdown.recv() => {
                    self.on_signal(sig).await;
                    return;
                }
            }
        }

        internal!("Relay server stopped");
    }

    async fn on_signal(&self, sig: Result<Signal, broadcast::error::RecvError>) {
        match sig {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Relay server received shutdown signal");
            }
            Err(e) => error!("Relay server shutdown channel error: {e}"),
        }

        self.shutdown().await;
    }

    /// Disconnect every running session and wait up to 30s for them to
    /// finish.
    pub async fn shutdown(&self) {
        for session in self.sessions() {
            session.disconnect_with("Relay server shutting down");
        }

        let start = Instant::now();

        while !self.sessions.is_empty() {
            if start.elapsed() >= SHUTDOWN_TIMEOUT {
                warn!(
                    "Shutdown timeout exceeded, {} session(s) still running",
                    self.sessions.len()
                );
                break;
            }

            debug!(
                "Waiting for {} session(s) to finish ({:.1}s elapsed)...",
                self.sessions.len(),
                start.elapsed().as_secs_f64()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.sessions.is_empty() {
            internal!("All relay sessions finished");
        }
    }

    async fn drain(&self) {
        while !self.sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// The smart host list for the next session. In load balance mode each
    /// session starts one position further along.
    fn smart_hosts_for_session(&self) -> Vec<SmartHost> {
        let config = &self.context.config;
        let mut smart_hosts = config.smart_hosts.clone();

        if config.relay_mode == RelayMode::SmartHost
            && config.balance_mode == BalanceMode::LoadBalance
            && !smart_hosts.is_empty()
        {
            let start = self.rotation.fetch_add(1, Ordering::Relaxed) % smart_hosts.len();
            smart_hosts.rotate_left(start);
        }

        smart_hosts
    }

    fn spawn_session(
        &self,
        item: RelayQueueItem,
        queue: Option<Arc<dyn RelayQueue>>,
        slot: Option<OwnedSemaphorePermit>,
    ) -> (Arc<SessionHandle>, JoinHandle<()>) {
        let handle = Arc::new(SessionHandle::new(
            Arc::new(item),
            self.context.config.session_idle_timeout(),
        ));

        let sessions = Arc::clone(&self.sessions);
        let completed = self.completed.clone();

        let session = RelaySession::new(
            Arc::clone(&handle),
            Arc::clone(&self.context),
            self.smart_hosts_for_session(),
            Box::new(move |info, outcome| {
                drop(slot);

                let event = SessionCompleted {
                    info,
                    error: outcome.err().map(Arc::new),
                };

                // The session stays registered until the queue has its outcome
                match (queue, Handle::try_current()) {
                    (Some(queue), Ok(runtime)) => {
                        runtime.spawn(async move {
                            queue.complete(&event.info, event.outcome()).await;
                            sessions.remove(&event.info.id);
                            let _ = completed.send(event);
                        });
                    }
                    (queue, _) => {
                        if queue.is_some() {
                            warn!(
                                session_id = %event.info.id,
                                "No runtime available to report the outcome to the queue"
                            );
                        }
                        sessions.remove(&event.info.id);
                        let _ = completed.send(event);
                    }
                }
            }),
        );

        self.sessions.insert(handle.id(), Arc::clone(&handle));
        debug!(session_id = %handle.id(), to = %handle.item().to, "Session started");

        (Arc::clone(&handle), tokio::spawn(session.run()))
    }
}
