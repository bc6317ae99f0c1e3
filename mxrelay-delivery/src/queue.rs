//! The queue collaborator: where relay items come from and where outcomes go

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{error::RelayError, session::SessionInfo, types::RelayQueueItem};

/// Supplies relay items and receives the outcome of each attempt.
///
/// The relay makes exactly one attempt per item; whether and when to try
/// again is up to the queue.
#[async_trait]
pub trait RelayQueue: Send + Sync {
    /// The next item to relay, or `None` once the queue is closed and drained.
    async fn next(&self) -> Option<RelayQueueItem>;

    /// Called once per item handed out by [`RelayQueue::next`].
    async fn complete(&self, session: &SessionInfo, outcome: Result<(), &RelayError>);
}

/// Where an item of a [`MemoryQueue`] stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStatus {
    Pending,
    InProgress,
    Relayed,
    Failed { reason: String, permanent: bool },
}

type QueueKey = (String, String);

/// An in-memory [`RelayQueue`]
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<RelayQueueItem>>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayQueueItem>>>,
    /// Status per (message id, recipient)
    status: Arc<DashMap<QueueKey, RelayStatus>>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            status: Arc::new(DashMap::new()),
        }
    }

    /// Add an item. Returns `false` if the queue has been closed.
    pub fn enqueue(&self, item: RelayQueueItem) -> bool {
        let key = (item.message_id.clone(), item.to.clone());

        let sent = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(item).is_ok());

        if sent {
            self.status.insert(key, RelayStatus::Pending);
        }

        sent
    }

    /// Stop accepting items. [`RelayQueue::next`] returns `None` once the
    /// remaining items are handed out.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    #[must_use]
    pub fn status(&self, message_id: &str, to: &str) -> Option<RelayStatus> {
        self.status
            .get(&(message_id.to_string(), to.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Items that have not reached a final status
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.status
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value(),
                    RelayStatus::Pending | RelayStatus::InProgress
                )
            })
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.status.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }
}

#[async_trait]
impl RelayQueue for MemoryQueue {
    async fn next(&self) -> Option<RelayQueueItem> {
        let item = self.receiver.lock().await.recv().await?;

        self.status.insert(
            (item.message_id.clone(), item.to.clone()),
            RelayStatus::InProgress,
        );

        Some(item)
    }

    async fn complete(&self, session: &SessionInfo, outcome: Result<(), &RelayError>) {
        let status = match outcome {
            Ok(()) => RelayStatus::Relayed,
            Err(error) => RelayStatus::Failed {
                reason: error.to_string(),
                permanent: error.is_permanent(),
            },
        };

        self.status
            .insert((session.message_id.clone(), session.to.clone()), status);
    }
}
