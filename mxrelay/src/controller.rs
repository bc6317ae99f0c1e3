use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use mxrelay_common::{Signal, internal, logging};
use mxrelay_delivery::{
    DsnParameters, MemoryQueue, MessageBody, RelayConfig, RelayContext, RelayMode, RelayQueue,
    RelayQueueItem, RelayServer, RelayStatus,
};
use serde::Deserialize;
use tokio::sync::broadcast;

/// Top level of `mxrelay.config.ron`
#[derive(Debug, Default, Deserialize)]
pub struct Relay {
    #[serde(default)]
    relay: RelayConfig,
}

/// One message for one or more recipients
#[derive(Debug, Clone)]
pub struct Submission {
    pub from: String,
    pub to: Vec<String>,
    pub message_id: String,
    pub body: MessageBody,
    pub dsn: DsnParameters,
}

/// What happened to one recipient of a [`Submission`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub recipient: String,
    pub status: RelayStatus,
}

impl Outcome {
    #[must_use]
    pub const fn is_relayed(&self) -> bool {
        matches!(self.status, RelayStatus::Relayed)
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = tracing::Level::TRACE)]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Relay {
    #[must_use]
    pub const fn new(relay: RelayConfig) -> Self {
        Self { relay }
    }

    /// Read and validate a RON configuration file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or describes a
    /// configuration the relay cannot work with.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_ron(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// # Errors
    ///
    /// Returns an error if `content` does not parse or fails validation.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        let relay: Self = ron::from_str(content)?;
        relay.check()?;
        Ok(relay)
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.relay
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns the first problem with the configuration.
    pub fn check(&self) -> anyhow::Result<()> {
        self.relay.validate()?;

        let config = &self.relay;
        internal!(
            "Relay mode {:?} ({:?}), {} smart host(s), {} binding(s), {} connection(s) per IP",
            config.relay_mode,
            config.balance_mode,
            config.smart_hosts.len(),
            config.bindings.len(),
            config.max_connections_per_ip
        );

        if config.relay_mode == RelayMode::Dns && !config.smart_hosts.is_empty() {
            tracing::warn!("Smart hosts are configured but ignored in DNS relay mode");
        }

        Ok(())
    }

    /// Relay `submission` to each of its recipients, one session per
    /// recipient, and report how each went.
    ///
    /// CTRL+C or SIGTERM abandons the sessions still running; their
    /// recipients are reported as failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the DNS resolver cannot be set up or the signal
    /// handlers cannot be installed.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn send(self, submission: Submission) -> anyhow::Result<Vec<Outcome>> {
        logging::init();

        let server = RelayServer::new(RelayContext::from_config(self.relay)?);

        let queue = MemoryQueue::new();
        for recipient in &submission.to {
            queue.enqueue(
                RelayQueueItem::new(
                    submission.from.clone(),
                    recipient.clone(),
                    submission.message_id.clone(),
                    submission.body.clone(),
                )
                .with_dsn(submission.dsn.clone()),
            );
        }
        queue.close();

        internal!(
            "Relaying {} to {} recipient(s)",
            submission.message_id,
            submission.to.len()
        );

        let relay_queue: Arc<dyn RelayQueue> = Arc::new(queue.clone());
        tokio::select! {
            () = server.serve(relay_queue, SHUTDOWN_BROADCAST.subscribe()) => {}
            r = shutdown() => r?,
        }

        internal!("Shutting down...");

        Ok(submission
            .to
            .iter()
            .map(|recipient| Outcome {
                recipient: recipient.clone(),
                status: queue
                    .status(&submission.message_id, recipient)
                    .unwrap_or(RelayStatus::Pending),
            })
            .collect())
    }
}
