use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline;

/// Service configuration, one flat document shared by every service.
///
/// Loaded from `/etc/mash/mash_config.yaml` by default; any key can be
/// overridden per deployment through `MASH__<KEY>` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_job_directory_base")]
    pub job_directory_base: PathBuf,

    #[serde(default = "default_amqp_host")]
    pub amqp_host: String,
    #[serde(default = "default_amqp_user")]
    pub amqp_user: String,
    /// AMQP password (loaded from environment, not from the config file)
    #[serde(skip)]
    pub amqp_pass: Option<String>,
    #[serde(default = "default_amqp_heartbeat")]
    pub amqp_heartbeat: u64,

    /// JWT signing secret (loaded from environment, not from the config file)
    #[serde(skip)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_ssl: bool,
    #[serde(default)]
    pub smtp_user: Option<String>,
    /// SMTP password (loaded from environment, not from the config file)
    #[serde(skip)]
    pub smtp_pass: Option<String>,
    #[serde(default = "default_notification_subject")]
    pub notification_subject: String,

    #[serde(default = "default_credentials_url")]
    pub credentials_url: String,
    #[serde(default = "default_database_api_url")]
    pub database_api_url: String,
    #[serde(default = "default_credentials_timeout_seconds")]
    pub credentials_timeout_seconds: u64,

    #[serde(default = "default_ssh_private_key_file")]
    pub ssh_private_key_file: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    #[serde(default = "default_img_proof_timeout")]
    pub img_proof_timeout: u64,
    #[serde(default = "default_obs_poll_interval_seconds")]
    pub obs_poll_interval_seconds: u64,

    #[serde(default = "default_azure_max_workers")]
    pub azure_max_workers: usize,
    #[serde(default = "default_azure_max_retry_attempts")]
    pub azure_max_retry_attempts: u32,
    #[serde(default = "default_max_oci_attempts")]
    pub max_oci_attempts: u32,
    #[serde(default = "default_max_oci_wait_seconds")]
    pub max_oci_wait_seconds: u64,

    #[serde(default = "default_base_thread_pool_count")]
    pub base_thread_pool_count: usize,
    #[serde(default = "default_publish_thread_pool_count")]
    pub publish_thread_pool_count: usize,

    #[serde(default)]
    pub email_allowlist: Vec<String>,
    #[serde(default)]
    pub domain_allowlist: Vec<String>,
    #[serde(default = "default_auth_methods")]
    pub auth_methods: Vec<String>,

    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_non_credential_services")]
    pub non_credential_services: Vec<String>,

    /// Free-form per-cloud data merged into stage messages by the creator
    #[serde(default)]
    pub provider_data: HashMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        // Round-tripping an empty object applies every serde field default
        serde_json::from_value(Value::Object(Default::default()))
            .unwrap_or_else(|_| unreachable!("field defaults are total"))
    }
}

impl Config {
    pub fn log_file(&self, service: &str) -> PathBuf {
        self.log_dir.join(format!("{service}_service.log"))
    }

    pub fn job_directory(&self, service: &str) -> PathBuf {
        self.job_directory_base.join(format!("{service}_jobs"))
    }

    pub fn needs_credentials(&self, service: &str) -> bool {
        !self
            .non_credential_services
            .iter()
            .any(|name| name == service)
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/mash/")
}

fn default_job_directory_base() -> PathBuf {
    PathBuf::from("/var/lib/mash/")
}

fn default_amqp_host() -> String {
    "localhost".to_string()
}

fn default_amqp_user() -> String {
    "guest".to_string()
}

fn default_amqp_heartbeat() -> u64 {
    600
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_notification_subject() -> String {
    "[MASH] Job Status Update".to_string()
}

fn default_credentials_url() -> String {
    "http://localhost:8080/".to_string()
}

fn default_database_api_url() -> String {
    "http://localhost:5007/".to_string()
}

fn default_credentials_timeout_seconds() -> u64 {
    60
}

fn default_ssh_private_key_file() -> PathBuf {
    PathBuf::from("/var/lib/mash/ssh_private_key")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/var/lib/mash/images/")
}

fn default_img_proof_timeout() -> u64 {
    600
}

fn default_obs_poll_interval_seconds() -> u64 {
    300
}

fn default_azure_max_workers() -> usize {
    5
}

fn default_azure_max_retry_attempts() -> u32 {
    5
}

fn default_max_oci_attempts() -> u32 {
    100
}

fn default_max_oci_wait_seconds() -> u64 {
    2400
}

fn default_base_thread_pool_count() -> usize {
    10
}

fn default_publish_thread_pool_count() -> usize {
    50
}

fn default_auth_methods() -> Vec<String> {
    vec!["password".to_string()]
}

fn default_services() -> Vec<String> {
    pipeline::PIPELINE.iter().map(|s| s.to_string()).collect()
}

fn default_non_credential_services() -> Vec<String> {
    pipeline::NON_CREDENTIAL_SERVICES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
