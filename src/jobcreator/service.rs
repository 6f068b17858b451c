use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::cloud_job::{create_job, credentials_message, stage_message};
use super::schema;
use crate::broker::{Broker, Delivery};
use crate::config::Config;
use crate::credentials::{CredentialsWebClient, CREDENTIALS_EXCHANGE};
use crate::listener::ServiceError;
use crate::messages::CreatorMessage;
use crate::pipeline;

pub const SERVICE_EXCHANGE: &str = "jobcreator";
const JOB_DOCUMENT_KEY: &str = "job_document";
const ADD_ACCOUNT_KEY: &str = "add_account";
const DELETE_ACCOUNT_KEY: &str = "delete_account";

/// Orchestrates the pipeline: validates user job requests, resolves
/// account info through the credentials service, fans each accepted job
/// out as one stage message per participating service, and owns the
/// job-wide delete cascade.
pub struct JobCreatorService {
    config: Config,
    broker: Broker,
    provider_data: Value,
    /// Jobs awaiting their credentials account check.
    jobs: HashMap<String, Map<String, Value>>,
    web: Option<CredentialsWebClient>,
}

impl JobCreatorService {
    pub fn new(config: Config, broker: Broker) -> Self {
        // The HTTP flavor needs the shared JWT secret; without it the
        // account check goes over the broker instead.
        let web = CredentialsWebClient::new(
            config.credentials_url.clone(),
            config.jwt_secret.clone(),
        )
        .ok();

        let provider_data = serde_json::to_value(&config.provider_data)
            .unwrap_or(Value::Null);

        Self {
            config,
            broker,
            provider_data,
            jobs: HashMap::new(),
            web,
        }
    }

    pub async fn run(mut self) -> Result<(), ServiceError> {
        let service_queue = format!("{SERVICE_EXCHANGE}.job_document");
        let listener_queue = format!("{SERVICE_EXCHANGE}.listener");

        self.broker.declare_exchange(SERVICE_EXCHANGE);
        self.broker.declare_exchange(CREDENTIALS_EXCHANGE);
        for service in pipeline::PIPELINE {
            self.broker.declare_exchange(service);
        }

        self.broker.declare_queue(&service_queue);
        self.broker.declare_queue(&listener_queue);
        self.broker
            .bind(SERVICE_EXCHANGE, &service_queue, JOB_DOCUMENT_KEY)?;
        self.broker
            .bind(SERVICE_EXCHANGE, &listener_queue, ADD_ACCOUNT_KEY)?;
        self.broker
            .bind(SERVICE_EXCHANGE, &listener_queue, DELETE_ACCOUNT_KEY)?;

        let mut service_messages = self.broker.consume(&service_queue)?;
        let mut account_messages = self.broker.consume(&listener_queue)?;

        info!(service = SERVICE_EXCHANGE, "service started");

        loop {
            tokio::select! {
                delivery = service_messages.recv() => match delivery {
                    Some(delivery) => self.handle_service_message(delivery).await,
                    None => return Err(ServiceError::BrokerClosed),
                },
                delivery = account_messages.recv() => match delivery {
                    Some(delivery) => self.handle_account_message(delivery),
                    None => return Err(ServiceError::BrokerClosed),
                },
            }
        }
    }

    async fn handle_service_message(&mut self, delivery: Delivery) {
        match CreatorMessage::parse(&delivery.body) {
            Ok(CreatorMessage::NewJob(doc)) => self.process_new_job(doc).await,
            Ok(CreatorMessage::StartJob { id, accounts_info }) => {
                self.send_job(&id, &accounts_info);
            }
            Ok(CreatorMessage::Delete(job_id)) => self.publish_delete_job_message(&job_id),
            Ok(CreatorMessage::InvalidJob(job_id)) => {
                warn!(job_id, "job failed, accounts do not exist");
                self.jobs.remove(&job_id);
            }
            Err(error) => {
                error!("invalid message received: {error}");
            }
        }
        // Validation failures are settled here; never redeliver
        delivery.ack();
    }

    /// Validate a new job request and start the account check. With a
    /// configured credentials HTTP endpoint the check is synchronous;
    /// otherwise it goes over the broker and the answer arrives later as a
    /// `start_job` message.
    async fn process_new_job(&mut self, doc: Map<String, Value>) {
        let Some(cloud) = doc.get("cloud").and_then(Value::as_str).map(str::to_owned)
        else {
            error!("invalid message received: job doc has no cloud key");
            return;
        };

        if let Err(error) = schema::validate_job(&cloud, &Value::Object(doc.clone())) {
            error!("invalid message received: {error}");
            return;
        }

        let job_id = doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let check = json!({
            "credentials_job_check": {
                "id": job_id,
                "cloud": cloud,
                "cloud_accounts": account_names(&doc),
                "cloud_groups": doc.get("cloud_groups").cloned().unwrap_or(json!([])),
                "requesting_user": doc.get("requesting_user").cloned().unwrap_or_default(),
            }
        });

        if let Some(web) = &self.web {
            let requesting_user = doc
                .get("requesting_user")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            match web
                .post("accounts/check", &requesting_user, &check)
                .await
            {
                Ok(response) => {
                    let accounts_info = response
                        .get("accounts_info")
                        .cloned()
                        .unwrap_or(response);
                    self.jobs.insert(job_id.clone(), doc);
                    self.send_job(&job_id, &accounts_info);
                }
                Err(error) => {
                    // The credentials service is authoritative, no retry
                    error!(job_id, "account check failed: {error}");
                }
            }
            return;
        }

        self.jobs.insert(job_id, doc);
        let body = serde_json::to_vec(&check).unwrap_or_default();
        if let Err(error) = self
            .broker
            .publish(CREDENTIALS_EXCHANGE, JOB_DOCUMENT_KEY, body)
        {
            error!("credentials account check publish failed: {error}");
        }
    }

    /// The account check passed: build the cloud job and emit one message
    /// per participating stage, credentials first, stopping at the job's
    /// last service.
    fn send_job(&mut self, job_id: &str, accounts_info: &Value) {
        let Some(doc) = self.jobs.remove(job_id) else {
            warn!(job_id, "start_job for unknown job");
            return;
        };

        let job = match create_job(job_id, &doc, accounts_info, &self.provider_data) {
            Ok(job) => job,
            Err(error) => {
                error!(job_id, "invalid message received: {error}");
                return;
            }
        };

        info!(job_id, "started a new job");

        // Credentials job always sent, for all jobs
        if let Err(error) = self.broker.publish(
            CREDENTIALS_EXCHANGE,
            JOB_DOCUMENT_KEY,
            credentials_message(job.as_ref()),
        ) {
            warn!(job_id, "credentials job publish failed: {error}");
        }

        let last_service = job.base().last_service;
        for service in &self.config.services {
            let Ok(service) = pipeline::normalize(service) else {
                continue;
            };
            let Some(body) = stage_message(job.as_ref(), service) else {
                continue;
            };
            if let Err(error) = self.broker.publish(service, JOB_DOCUMENT_KEY, body) {
                warn!(job_id, service, "stage job publish failed: {error}");
            }
            if service == last_service {
                break;
            }
        }
    }

    /// Flush a job out of the whole pipeline: every stage plus the
    /// credentials service evicts its local state.
    fn publish_delete_job_message(&self, job_id: &str) {
        info!(job_id, "deleting job");

        for service in pipeline::PIPELINE {
            let mut body = Map::new();
            body.insert(format!("{service}_job_delete"), json!(job_id));
            let raw = serde_json::to_vec(&Value::Object(body)).unwrap_or_default();
            if let Err(error) = self.broker.publish(service, JOB_DOCUMENT_KEY, raw) {
                warn!(job_id, service, "delete publish failed: {error}");
            }
        }

        let body = json!({ "credentials_job_delete": job_id });
        let raw = serde_json::to_vec(&body).unwrap_or_default();
        if let Err(error) = self
            .broker
            .publish(CREDENTIALS_EXCHANGE, JOB_DOCUMENT_KEY, raw)
        {
            warn!(job_id, "credentials delete publish failed: {error}");
        }
    }

    /// Account lifecycle messages are validated here and relayed to the
    /// credentials service untouched.
    fn handle_account_message(&self, delivery: Delivery) {
        let parsed: Result<Value, _> = serde_json::from_slice(&delivery.body);
        let Ok(message) = parsed else {
            warn!("invalid message received: {:?}", delivery.body);
            delivery.ack();
            return;
        };

        match delivery.routing_key.as_str() {
            ADD_ACCOUNT_KEY => {
                let provider = message
                    .get("provider")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match schema::validate_add_account(provider, &message) {
                    Ok(()) => self.relay_account_message(ADD_ACCOUNT_KEY, &message),
                    Err(error) => error!("add account message is invalid: {error}"),
                }
            }
            DELETE_ACCOUNT_KEY => match schema::validate_delete_account(&message) {
                Ok(()) => self.relay_account_message(DELETE_ACCOUNT_KEY, &message),
                Err(error) => error!("delete account message is invalid: {error}"),
            },
            other => {
                warn!("received unknown message type: {other}");
            }
        }
        delivery.ack();
    }

    fn relay_account_message(&self, routing_key: &str, message: &Value) {
        let body = serde_json::to_vec(message).unwrap_or_default();
        if let Err(error) = self.broker.publish(CREDENTIALS_EXCHANGE, routing_key, body) {
            warn!(routing_key, "account message relay failed: {error}");
        }
    }
}

/// Account names referenced by a job request, whatever the cloud's shape.
fn account_names(doc: &Map<String, Value>) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(accounts) = doc.get("cloud_accounts").and_then(Value::as_array) {
        names.extend(
            accounts
                .iter()
                .filter_map(|account| account.get("name").and_then(Value::as_str))
                .map(str::to_owned),
        );
    }
    if let Some(account) = doc.get("cloud_account").and_then(Value::as_str) {
        names.push(account.to_string());
    }
    if let Some(testing) = doc.get("testing_account").and_then(Value::as_str) {
        names.push(testing.to_string());
    }
    names
}
