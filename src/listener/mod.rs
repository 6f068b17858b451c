//! The reusable worker loop every stage service is built on.
//!
//! A listener service consumes two queues: its job-document queue (new
//! stage jobs and deletes) and its listener queue (trigger messages from
//! the previous stage, routed per job id). Jobs persist to disk between
//! the two so a crash loses nothing but in-flight handler work.

mod service;

pub use service::{ListenerArgs, ListenerService, ServiceError};

use serde::{Deserialize, Serialize};

/// Explicit lifecycle state stamped into the persisted job record.
///
/// A record found on disk at startup always rehydrates as `Persisted`,
/// whatever state it crashed in; re-execution tolerance is a handler
/// obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Persisted,
    Running,
}
