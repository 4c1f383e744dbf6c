//! Job execution backends for buildchain.
//!
//! Provides dispatcher implementations that actually run jobs:
//! - Local processes (development and single-host runs)

pub mod local;

pub use local::{Completion, LocalProcessDispatcher};
