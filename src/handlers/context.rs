use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::credentials::{CredentialsBundle, CredentialsClient, CredentialsError};
use crate::messages::JobDocument;

/// Per-execution view handed to a handler's `run_job`.
///
/// Carries the accumulated pipeline state from the previous stage, the
/// credentials client for this service, and a job-scoped log callback.
pub struct HandlerContext {
    job_id: String,
    cloud: String,
    requesting_user: String,
    incoming_status_msg: Map<String, Value>,
    credentials: Option<Arc<CredentialsClient>>,
}

impl HandlerContext {
    pub fn new(
        doc: &JobDocument,
        incoming_status_msg: Map<String, Value>,
        credentials: Option<Arc<CredentialsClient>>,
    ) -> Self {
        Self {
            job_id: doc.id().map(str::to_owned).unwrap_or_default(),
            cloud: doc.cloud().unwrap_or_default().to_owned(),
            requesting_user: doc
                .get("requesting_user")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            incoming_status_msg,
            credentials,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Accumulated state from earlier stages (`image_file`, ...).
    pub fn incoming(&self) -> &Map<String, Value> {
        &self.incoming_status_msg
    }

    /// Fetch the credential bundle for the given accounts. The bundle is
    /// only valid for this execution; do not stash it anywhere.
    pub async fn request_credentials(
        &self,
        accounts: &[String],
    ) -> Result<CredentialsBundle, CredentialsError> {
        match &self.credentials {
            Some(client) => {
                client
                    .request_credentials(&self.job_id, &self.cloud, accounts, &self.requesting_user)
                    .await
            }
            None => Err(CredentialsError::NotConfigured),
        }
    }

    // Job-scoped log callback surface

    pub fn info(&self, msg: &str) {
        info!(job_id = %self.job_id, "{msg}");
    }

    pub fn warning(&self, msg: &str) {
        warn!(job_id = %self.job_id, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        error!(job_id = %self.job_id, "{msg}");
    }
}
