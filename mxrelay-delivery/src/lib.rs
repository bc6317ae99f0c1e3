//! Outbound relay engine
//!
//! This crate provides:
//! - Target resolution through MX lookup or a smart host list
//! - Per remote IP admission control and local binding selection
//! - Target selection with load balance and fail-over policies
//! - The relay session state machine, one delivery attempt per queued item
//! - A server that runs sessions from a queue and reports their outcomes

pub mod admission;
mod config;
mod dns;
mod error;
pub mod queue;
mod resolver;
pub mod selector;
mod server;
pub mod session;
pub mod transport;
mod types;

// Re-export configuration types
pub use config::{BalanceMode, ConfigError, RelayConfig, RelayMode, SmartHost};
// Re-export DNS types
pub use dns::{DnsConfig, DnsError, DnsResolver, HostAddresses, Resolve};
// Re-export error types
pub use error::{NoTargetReason, RelayError, ResolutionError};
// Re-export core types
pub use admission::{AdmissionController, AdmissionPermit};
pub use queue::{MemoryQueue, RelayQueue, RelayStatus};
pub use resolver::{SMTP_PORT, resolve_targets};
pub use server::{RelayContext, RelayServer, SessionCompleted};
pub use session::{SessionHandle, SessionId, SessionInfo, SessionState};
pub use transport::{ConnectRequest, SmtpConnection, SmtpConnector, TcpConnector};
pub use types::{
    AddressFamily, BodyReader, DsnParameters, IpBindInfo, MessageBody, RelayQueueItem,
    RelayTarget,
};
