//! `gearshift-core`: shared model for the gearshift dispatcher.
//!
//! Holds the [`task::Task`] directive, its ISO-8601 [`interval::RepeatInterval`],
//! the [`clock::Clock`] used for every "is it due yet" decision, configuration
//! loading, and the error taxonomy every other crate reports through.

pub mod clock;
pub mod config;
pub mod error;
pub mod interval;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GearshiftConfig;
pub use error::{GearshiftError, Result};
pub use interval::RepeatInterval;
pub use task::{Priority, Task};
