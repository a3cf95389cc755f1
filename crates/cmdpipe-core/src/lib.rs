//! `cmdpipe` Core Library
//!
//! Shared functionality for `cmdpipe` components:
//! - Configuration resolution and hierarchy
//! - Environment overlay entries with confidential display
//! - Bounded stderr snapshots for diagnostics
//! - Common error types and tracing setup

pub mod config;
pub mod env;
pub mod error;
pub mod escape;
pub mod snapshot;
pub mod tracing_init;

pub use config::Config;
pub use env::EnvVar;
pub use error::{Error, Result};
pub use snapshot::ErrorRecorder;
