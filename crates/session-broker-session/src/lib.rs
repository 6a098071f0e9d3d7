//! Session orchestration and storage for the session broker.
//!
//! Provides:
//! - `SessionManager` - Lifecycle, instructions and recorded commands
//! - `Summarizer` / `SummaryWorker` - Background rolling summaries
//! - Storage implementations (filesystem, memory)

pub mod generator;
pub mod locks;
pub mod manager;
pub mod storage;
pub mod summarizer;
pub mod worker;

pub use generator::OpenAiGenerator;
pub use manager::{
    CdOutcome, HistoryView, ManagerError, OpenedSession, SessionManager, SessionSnapshot,
};
pub use summarizer::{SummaryError, SummaryUpdate, Summarizer};
pub use worker::{SummaryJob, SummaryQueue, SummaryWorker};
