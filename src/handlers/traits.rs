use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use super::context::HandlerContext;
use crate::messages::JobStatus;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{service} jobs require a(n) {key} key in the job doc")]
    MissingJobKey { service: String, key: String },

    #[error("handler configuration invalid: {0}")]
    Configuration(String),
}

/// One stage execution for one cloud.
///
/// `run_job` is infallible at the boundary: implementations catch their own
/// failures, record human-readable messages through `add_error_msg`-style
/// bookkeeping, set `status`, and return. Partial rollback (for example
/// removing images already created in peer regions) is the handler's
/// responsibility before it returns.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Perform the stage's side effects and settle `status`/`status_msg`.
    async fn run_job(&mut self, ctx: &HandlerContext);

    fn status(&self) -> JobStatus;

    /// Outputs to merge into the forwarded listener message.
    fn status_msg(&self) -> &Map<String, Value>;

    fn error_msgs(&self) -> &[String];
}

impl std::fmt::Debug for dyn StageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandler").finish()
    }
}
