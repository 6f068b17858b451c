use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};

use super::JobState;
use crate::broker::{Broker, BrokerError, Delivery};
use crate::config::Config;
use crate::credentials::CredentialsClient;
use crate::handlers::{HandlerContext, JobFactory, StageHandler};
use crate::messages::{JobDocument, JobStatus, ListenerMessage, ServiceMessage};
use crate::notify::{Notification, NotificationSink};
use crate::pipeline;
use crate::store::JobStore;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("broker connection lost")]
    BrokerClosed,

    #[error("broker setup failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("job store setup failed: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("credentials client setup failed: {0}")]
    Credentials(#[from] crate::credentials::CredentialsError),

    #[error("{0} is not a pipeline service")]
    UnknownService(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Per-service wiring for the shared worker loop.
pub struct ListenerArgs {
    /// Keys the incoming listener message must carry for this stage to run
    /// (checked at merge time; a miss is a configuration failure).
    pub listener_msg_args: Vec<String>,
    /// Handler output keys propagated downstream. Empty means all.
    pub status_msg_args: Vec<String>,
    pub job_factory: JobFactory,
}

struct JobEntry {
    doc: JobDocument,
    handler: Option<Box<dyn StageHandler>>,
    state: JobState,
    /// Delete arrived while the handler was running; discard its result.
    deleted: bool,
}

/// Result of one handler execution, reported back to the service loop.
struct RunOutcome {
    job_id: String,
    handler: Box<dyn StageHandler>,
    trigger: ListenerMessage,
}

const FORWARD_RETRIES: u32 = 20;
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

pub struct ListenerService {
    service: &'static str,
    prev_service: Option<&'static str>,
    next_service: Option<&'static str>,
    config: Config,
    args: ListenerArgs,
    broker: Broker,
    store: JobStore,
    credentials: Option<Arc<CredentialsClient>>,
    sink: Arc<NotificationSink>,
    jobs: HashMap<String, JobEntry>,
    pool: Arc<Semaphore>,
    results_tx: mpsc::UnboundedSender<RunOutcome>,
    results_rx: Option<mpsc::UnboundedReceiver<RunOutcome>>,
}

impl ListenerService {
    pub fn new(
        service_exchange: &str,
        config: Config,
        args: ListenerArgs,
        broker: Broker,
    ) -> Result<Self> {
        let service = pipeline::normalize(service_exchange)
            .map_err(|_| ServiceError::UnknownService(service_exchange.to_string()))?;

        let store = JobStore::open(config.job_directory(service))?;

        let credentials = if config.needs_credentials(service) {
            Some(Arc::new(CredentialsClient::start(
                service,
                broker.clone(),
                Duration::from_secs(config.credentials_timeout_seconds),
            )?))
        } else {
            None
        };

        let sink = Arc::new(NotificationSink::new(&config));
        let pool = Arc::new(Semaphore::new(config.base_thread_pool_count));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Ok(Self {
            service,
            prev_service: pipeline::prev_service(service),
            next_service: pipeline::next_service(service),
            config,
            args,
            broker,
            store,
            credentials,
            sink,
            jobs: HashMap::new(),
            pool,
            results_tx,
            results_rx: Some(results_rx),
        })
    }

    /// Declare topology, rehydrate persisted jobs, and enter the consume
    /// loop. Returns only when the broker goes away; the caller exits
    /// non-zero and leaves restarts to the supervisor.
    pub async fn run(mut self) -> Result<()> {
        let job_document_queue = format!("{}.job_document", self.service);
        let listener_queue = format!("{}.listener", self.service);

        self.broker.declare_exchange(self.service);
        self.broker.declare_queue(&job_document_queue);
        self.broker.declare_queue(&listener_queue);
        self.broker
            .bind(self.service, &job_document_queue, "job_document")?;

        let mut job_documents = self.broker.consume(&job_document_queue)?;
        let mut listener_messages = self.broker.consume(&listener_queue)?;
        let Some(mut results) = self.results_rx.take() else {
            return Err(ServiceError::BrokerClosed);
        };

        self.restart_jobs().await;

        info!(service = self.service, "service started");

        loop {
            tokio::select! {
                delivery = job_documents.recv() => match delivery {
                    Some(delivery) => self.handle_job_document(delivery).await,
                    None => return Err(ServiceError::BrokerClosed),
                },
                delivery = listener_messages.recv() => match delivery {
                    Some(delivery) => self.handle_listener_message(delivery).await,
                    None => return Err(ServiceError::BrokerClosed),
                },
                outcome = results.recv() => match outcome {
                    // The loop holds a sender, so recv never yields None
                    Some(outcome) => self.handle_run_outcome(outcome).await,
                    None => return Err(ServiceError::BrokerClosed),
                },
            }
        }
    }

    /// Replay every persisted job through the registration path a fresh
    /// job document takes, minus any downstream publishing.
    async fn restart_jobs(&mut self) {
        let docs = match self.store.list_all() {
            Ok(docs) => docs,
            Err(error) => {
                warn!(service = self.service, %error, "job restart scan failed");
                return;
            }
        };

        for doc in docs {
            info!(
                service = self.service,
                job_id = doc.id().unwrap_or("?"),
                "restarting persisted job"
            );
            self.register_job(doc, true).await;
        }
    }

    async fn handle_job_document(&mut self, delivery: Delivery) {
        match ServiceMessage::parse(self.service, &delivery.body) {
            Ok(ServiceMessage::Job(doc)) => {
                self.register_job(doc, false).await;
            }
            Ok(ServiceMessage::Delete(job_id)) => {
                self.delete_job(&job_id);
            }
            Err(error) => {
                error!(service = self.service, "invalid message received: {error}");
            }
        }
        delivery.ack();
    }

    /// Persist the document, build the handler, and register the job.
    /// `replay` suppresses downstream effects during crash recovery.
    async fn register_job(&mut self, mut doc: JobDocument, replay: bool) {
        let job_id = match doc.id() {
            Ok(id) => id.to_string(),
            Err(error) => {
                error!(service = self.service, "invalid message received: {error}");
                return;
            }
        };

        if self.jobs.contains_key(&job_id) {
            warn!(
                service = self.service,
                job_id, "job already registered, ignoring duplicate"
            );
            return;
        }

        doc.insert("state", json!(JobState::Persisted));
        if !replay {
            // Best-effort persistence: execution continues without it
            if let Err(error) = self.store.persist(&mut doc) {
                warn!(service = self.service, job_id, %error, "job persistence failed");
            }
        }

        let handler = match self.args.job_factory.create(&doc, &self.config) {
            Ok(handler) => handler,
            Err(error) => {
                error!(service = self.service, job_id, "job setup failed: {error}");
                let mut failure = ListenerMessage::new(&job_id, JobStatus::Failed);
                failure.errors.push(error.to_string());
                if !replay {
                    self.finish_job(&doc, failure).await;
                } else if let Err(error) = self.store.delete(&job_id) {
                    warn!(service = self.service, job_id, %error, "job file removal failed");
                }
                return;
            }
        };

        if let Some(prev) = self.prev_service {
            let listener_queue = format!("{}.listener", self.service);
            let routing_key = format!("{prev}.{job_id}");
            if let Err(error) = self.broker.bind(self.service, &listener_queue, &routing_key) {
                warn!(service = self.service, job_id, %error, "listener binding failed");
            }
        }

        info!(service = self.service, job_id, "job registered");
        self.jobs.insert(
            job_id,
            JobEntry {
                doc,
                handler: Some(handler),
                state: JobState::Persisted,
                deleted: false,
            },
        );
    }

    fn delete_job(&mut self, job_id: &str) {
        let Some(entry) = self.jobs.get_mut(job_id) else {
            warn!(
                service = self.service,
                job_id, "job does not exist, can not delete it"
            );
            return;
        };

        if let Err(error) = self.store.delete(job_id) {
            warn!(service = self.service, job_id, %error, "job file removal failed");
        }

        if entry.state == JobState::Running {
            // The handler is not interrupted mid-call; its result is
            // discarded when it reports back.
            entry.deleted = true;
            info!(
                service = self.service,
                job_id, "job deleted while running, result will be discarded"
            );
            return;
        }

        self.unbind_listener(job_id);
        self.jobs.remove(job_id);
        info!(service = self.service, job_id, "job deleted");
    }

    async fn handle_listener_message(&mut self, delivery: Delivery) {
        let message = match ListenerMessage::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(error) => {
                error!(service = self.service, "invalid message received: {error}");
                delivery.ack();
                return;
            }
        };

        let Some(entry) = self.jobs.get_mut(&message.id) else {
            // Listener message can overtake the job document; give the
            // document one more chance to arrive, then drop.
            if !delivery.redelivered {
                tokio::spawn(async move {
                    tokio::time::sleep(REQUEUE_DELAY).await;
                    delivery.requeue();
                });
            } else {
                warn!(
                    service = self.service,
                    job_id = message.id,
                    "listener message for unknown job, dropping"
                );
                delivery.ack();
            }
            return;
        };

        if entry.state == JobState::Running {
            warn!(
                service = self.service,
                job_id = message.id,
                "job already running, dropping duplicate trigger"
            );
            delivery.ack();
            return;
        }

        if !message.status.is_success() {
            // The previous stage failed; propagate without running ours so
            // the terminal stage can still notify.
            let doc = entry.doc.clone();
            let forwarded = ListenerMessage {
                id: message.id.clone(),
                status: message.status,
                status_msg: message.status_msg.clone(),
                errors: message.errors.clone(),
            };
            info!(
                service = self.service,
                job_id = message.id,
                "propagating upstream failure"
            );
            self.finish_job(&doc, forwarded).await;
            delivery.ack();
            return;
        }

        if let Err(error) = message.require_keys(&self.args.listener_msg_args) {
            let doc = entry.doc.clone();
            error!(
                service = self.service,
                job_id = message.id,
                "job setup failed: {error}"
            );
            let mut failure = ListenerMessage::new(&message.id, JobStatus::Failed);
            failure.status_msg = message.status_msg.clone();
            failure.errors = message.errors.clone();
            failure.errors.push(error.to_string());
            self.finish_job(&doc, failure).await;
            delivery.ack();
            return;
        }

        self.start_job(message).await;
        delivery.ack();
    }

    /// Run the handler on the worker pool. At most one execution per job
    /// id: the entry's state flips to running before the task spawns.
    async fn start_job(&mut self, trigger: ListenerMessage) {
        let Some(entry) = self.jobs.get_mut(&trigger.id) else {
            return;
        };
        let Some(mut handler) = entry.handler.take() else {
            warn!(
                service = self.service,
                job_id = trigger.id,
                "job has no handler to run"
            );
            return;
        };

        entry.state = JobState::Running;
        entry.doc.insert("state", json!(JobState::Running));
        let mut doc = entry.doc.clone();
        if let Err(error) = self.store.persist(&mut doc) {
            warn!(service = self.service, job_id = trigger.id, %error, "job persistence failed");
        }

        let ctx = HandlerContext::new(
            &entry.doc,
            trigger.status_msg.clone(),
            self.credentials.clone(),
        );
        let pool = Arc::clone(&self.pool);
        let results = self.results_tx.clone();

        info!(service = self.service, job_id = trigger.id, "job running");
        tokio::spawn(async move {
            let Ok(_permit) = pool.acquire().await else {
                return;
            };
            handler.run_job(&ctx).await;
            let _ = results.send(RunOutcome {
                job_id: ctx.job_id().to_string(),
                handler,
                trigger,
            });
        });
    }

    async fn handle_run_outcome(&mut self, outcome: RunOutcome) {
        let Some(entry) = self.jobs.get(&outcome.job_id) else {
            return;
        };

        if entry.deleted {
            info!(
                service = self.service,
                job_id = outcome.job_id,
                "discarding result of deleted job"
            );
            self.unbind_listener(&outcome.job_id);
            self.jobs.remove(&outcome.job_id);
            return;
        }

        let doc = entry.doc.clone();
        let handler = outcome.handler;

        let mut forwarded = outcome.trigger;
        forwarded.status = handler.status();
        forwarded.merge_status_msg(&filter_status_msg(
            handler.status_msg(),
            &self.args.status_msg_args,
        ));
        forwarded
            .errors
            .extend(handler.error_msgs().iter().cloned());

        info!(
            service = self.service,
            job_id = forwarded.id,
            status = %forwarded.status,
            "job finished"
        );
        self.finish_job(&doc, forwarded).await;
    }

    /// Terminal bookkeeping for this stage: forward unless we are the
    /// job's last service, apply the notification policy, drop all state.
    async fn finish_job(&mut self, doc: &JobDocument, message: ListenerMessage) {
        let job_id = message.id.clone();
        let last_service = doc.last_service().unwrap_or("deprecate").to_string();
        let is_terminal = last_service == self.service;

        if !is_terminal {
            if let Some(next) = self.next_service {
                self.forward(next, &message).await;
            }
        }

        let note = Notification {
            job_id: job_id.clone(),
            to: doc.notification_email().map(str::to_owned),
            notification_type: doc.notification_type(),
            status: message.status,
            utctime: doc
                .get("utctime")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("now")
                .to_string(),
            service: self.service.to_string(),
            last_service,
            error_msgs: message.errors.clone(),
        };
        self.sink.notify(&note).await;

        if let Err(error) = self.store.delete(&job_id) {
            warn!(service = self.service, job_id, %error, "job file removal failed");
        }
        self.unbind_listener(&job_id);
        self.jobs.remove(&job_id);
    }

    /// Publish the listener message to the next stage's exchange, routed
    /// `<this_service>.<job_id>`. The next stage binds that key when it
    /// registers the job; a short bounded retry rides out the window where
    /// our handler finishes first.
    async fn forward(&self, next: &str, message: &ListenerMessage) {
        let routing_key = format!("{}.{}", self.service, message.id);
        let body = message.to_vec();

        for attempt in 0..FORWARD_RETRIES {
            match self.broker.publish(next, &routing_key, body.clone()) {
                Ok(()) => return,
                Err(BrokerError::Unroutable { .. }) if attempt + 1 < FORWARD_RETRIES => {
                    tokio::time::sleep(FORWARD_RETRY_DELAY).await;
                }
                Err(error) => {
                    error!(
                        service = self.service,
                        job_id = message.id,
                        %error,
                        "listener message forward failed"
                    );
                    return;
                }
            }
        }
    }

    fn unbind_listener(&self, job_id: &str) {
        if let Some(prev) = self.prev_service {
            let listener_queue = format!("{}.listener", self.service);
            let _ = self
                .broker
                .unbind(self.service, &listener_queue, &format!("{prev}.{job_id}"));
        }
    }
}

fn filter_status_msg(
    status_msg: &serde_json::Map<String, serde_json::Value>,
    status_msg_args: &[String],
) -> serde_json::Map<String, serde_json::Value> {
    if status_msg_args.is_empty() {
        return status_msg.clone();
    }
    status_msg
        .iter()
        .filter(|(key, _)| status_msg_args.iter().any(|arg| arg == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
