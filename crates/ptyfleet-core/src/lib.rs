//! `ptyfleet` Core Library
//!
//! Shared functionality for the worker runner:
//! - Status channel protocol (line format, completion sentinel)
//! - Pid records and the on-disk workspace layout
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod layout;
pub mod pid_record;
pub mod status;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use layout::{WorkerId, WorkspaceLayout};
pub use status::{COMPLETION_SENTINEL, StatusChannel};
