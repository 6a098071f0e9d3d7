//! Core abstractions for the session broker.
//!
//! This crate provides the fundamental building blocks:
//! - `Event` / `EventLog` - Append-only JSON Lines audit trail
//! - `ActivityHistory` - Bounded view of recent activity
//! - `OperationContext` - Caller-supplied context stored with each event
//! - `Diagnostic` - Summary failures and text generation calls per session
//! - `BrokerConfig` - Process-wide configuration
//! - Storage and text generation traits

pub mod clock;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod event_log;
pub mod fs;
pub mod history;
pub mod traits;

pub use config::BrokerConfig;
pub use context::OperationContext;
pub use diagnostics::{Diagnostic, DiagnosticLog};
pub use error::ErrorKind;
pub use event::{Event, EventKind};
pub use event_log::{EventLog, EventLogError};
pub use history::{ActivityHistory, HistoryEntry};
pub use traits::{Session, SessionId, SessionStorage, TextGenerator};
