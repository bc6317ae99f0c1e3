pub mod controller;

pub use controller::{Outcome, Relay, SHUTDOWN_BROADCAST, Submission};
