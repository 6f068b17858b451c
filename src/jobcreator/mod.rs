//! The job creator: pipeline orchestration and job lifecycle commands.

mod cloud_job;
mod schema;
mod service;

pub use cloud_job::{create_job, credentials_message, stage_message, CloudJob, CloudJobError};
pub use schema::{validate_add_account, validate_delete_account, validate_job, SchemaError};
pub use service::{JobCreatorService, SERVICE_EXCHANGE};
