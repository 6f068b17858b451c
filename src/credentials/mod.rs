//! Credential fetch, two flavors: the broker request/response client used
//! by stage handlers inside `run_job`, and the JWT-authenticated HTTP
//! client the job creator uses for account checks.
//!
//! Bundles are opaque per-account secret maps. They are fetched once per
//! stage execution, held in memory only while the handler runs, and never
//! persisted or cached across jobs.

mod rpc;
mod web;

pub use rpc::{CredentialsBundle, CredentialsClient, CredentialsError, CREDENTIALS_EXCHANGE};
pub use web::{CredentialsWebClient, WebClientError};
