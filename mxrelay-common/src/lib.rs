pub mod domain;
pub mod logging;

pub use domain::Domain;
pub use tracing;

/// Lifecycle signal broadcast from the controller to long running tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
