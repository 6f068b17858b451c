use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::conditions::{evaluate_conditions, evaluate_disallows, Condition};
use super::repo::RepoScanner;
use crate::broker::{Broker, BrokerError, Delivery};
use crate::config::Config;
use crate::listener::{JobState, ServiceError};
use crate::messages::{JobDocument, JobStatus, ListenerMessage, ServiceMessage, UtcTime};
use crate::notify::{Notification, NotificationSink};
use crate::pipeline;
use crate::store::JobStore;

pub const SERVICE_EXCHANGE: &str = "obs";

const FORWARD_RETRIES: u32 = 20;
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_CONDITIONS_WAIT_SECONDS: u64 = 900;

/// The pipeline's entry stage. Instead of a listener queue, every job owns
/// a periodic watcher polling the upstream build repository; a matching
/// artifact produces the first listener message of the pipeline.
pub struct ObsWatchdogService {
    config: Config,
    broker: Broker,
    store: JobStore,
    sink: Arc<NotificationSink>,
    jobs: HashMap<String, WatchEntry>,
    publish_pool: Arc<Semaphore>,
    results_tx: mpsc::UnboundedSender<WatchOutcome>,
    results_rx: Option<mpsc::UnboundedReceiver<WatchOutcome>>,
}

struct WatchEntry {
    doc: JobDocument,
    nonstop: bool,
    watcher: JoinHandle<()>,
}

struct WatchOutcome {
    job_id: String,
    message: ListenerMessage,
}

impl ObsWatchdogService {
    pub fn new(config: Config, broker: Broker) -> Result<Self, ServiceError> {
        let store = JobStore::open(config.job_directory(SERVICE_EXCHANGE))?;
        let sink = Arc::new(NotificationSink::new(&config));
        let publish_pool = Arc::new(Semaphore::new(config.publish_thread_pool_count));
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            broker,
            store,
            sink,
            jobs: HashMap::new(),
            publish_pool,
            results_tx,
            results_rx: Some(results_rx),
        })
    }

    pub async fn run(mut self) -> Result<(), ServiceError> {
        let job_document_queue = format!("{SERVICE_EXCHANGE}.job_document");

        self.broker.declare_exchange(SERVICE_EXCHANGE);
        if let Some(next) = pipeline::next_service(SERVICE_EXCHANGE) {
            self.broker.declare_exchange(next);
        }
        self.broker.declare_queue(&job_document_queue);
        self.broker
            .bind(SERVICE_EXCHANGE, &job_document_queue, "job_document")?;

        let mut job_documents = self.broker.consume(&job_document_queue)?;
        let Some(mut results) = self.results_rx.take() else {
            return Err(ServiceError::BrokerClosed);
        };

        self.restart_jobs();

        info!(service = SERVICE_EXCHANGE, "service started");

        loop {
            tokio::select! {
                delivery = job_documents.recv() => match delivery {
                    Some(delivery) => self.handle_job_document(delivery),
                    None => return Err(ServiceError::BrokerClosed),
                },
                outcome = results.recv() => match outcome {
                    Some(outcome) => self.handle_watch_outcome(outcome).await,
                    None => return Err(ServiceError::BrokerClosed),
                },
            }
        }
    }

    fn restart_jobs(&mut self) {
        let docs = match self.store.list_all() {
            Ok(docs) => docs,
            Err(error) => {
                warn!(service = SERVICE_EXCHANGE, %error, "job restart scan failed");
                return;
            }
        };
        for doc in docs {
            info!(
                service = SERVICE_EXCHANGE,
                job_id = doc.id().unwrap_or("?"),
                "restarting persisted job"
            );
            self.register_job(doc, true);
        }
    }

    fn handle_job_document(&mut self, delivery: Delivery) {
        match ServiceMessage::parse(SERVICE_EXCHANGE, &delivery.body) {
            Ok(ServiceMessage::Job(doc)) => self.register_job(doc, false),
            Ok(ServiceMessage::Delete(job_id)) => self.delete_job(&job_id),
            Err(error) => {
                error!(service = SERVICE_EXCHANGE, "invalid message received: {error}");
            }
        }
        delivery.ack();
    }

    fn register_job(&mut self, mut doc: JobDocument, replay: bool) {
        let job_id = match doc.id() {
            Ok(id) => id.to_string(),
            Err(error) => {
                error!(service = SERVICE_EXCHANGE, "invalid message received: {error}");
                return;
            }
        };

        if self.jobs.contains_key(&job_id) {
            warn!(
                service = SERVICE_EXCHANGE,
                job_id, "job already registered, ignoring duplicate"
            );
            return;
        }

        let (utctime, image, download_url) =
            match (doc.utctime(), doc.get("image"), doc.get("download_url")) {
                (Ok(utctime), Some(image), Some(url)) => (
                    utctime,
                    image.as_str().unwrap_or_default().to_string(),
                    url.as_str().unwrap_or_default().to_string(),
                ),
                _ => {
                    error!(
                        service = SERVICE_EXCHANGE,
                        job_id, "job setup failed: obs jobs require utctime, image and download_url"
                    );
                    return;
                }
            };

        doc.insert("state", json!(JobState::Persisted));
        if !replay {
            if let Err(error) = self.store.persist(&mut doc) {
                warn!(service = SERVICE_EXCHANGE, job_id, %error, "job persistence failed");
            }
        }

        let watch = Watch {
            job_id: job_id.clone(),
            image,
            scanner: RepoScanner::new(download_url),
            conditions: doc
                .get("conditions")
                .and_then(|value| serde_json::from_value(value.clone()).ok())
                .unwrap_or_default(),
            disallow_licenses: string_list(doc.get("disallow_licenses")),
            disallow_packages: string_list(doc.get("disallow_packages")),
            nonstop: utctime.is_nonstop(),
            poll_interval: Duration::from_secs(self.config.obs_poll_interval_seconds),
            conditions_wait: Duration::from_secs(
                doc.get("conditions_wait_time")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_CONDITIONS_WAIT_SECONDS),
            ),
        };

        let results = self.results_tx.clone();
        let watcher = tokio::spawn(async move {
            if let UtcTime::At(at) = utctime {
                let delay = (at - chrono::Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay).await;
            }
            watch.run(results).await;
        });

        info!(service = SERVICE_EXCHANGE, job_id, "watchdog started");
        self.jobs.insert(
            job_id,
            WatchEntry {
                doc,
                nonstop: utctime.is_nonstop(),
                watcher,
            },
        );
    }

    /// A delete stops the watcher outright; there is no handler mid-call
    /// to wait out on this stage.
    fn delete_job(&mut self, job_id: &str) {
        let Some(entry) = self.jobs.remove(job_id) else {
            warn!(
                service = SERVICE_EXCHANGE,
                job_id, "job does not exist, can not delete it"
            );
            return;
        };
        entry.watcher.abort();
        if let Err(error) = self.store.delete(job_id) {
            warn!(service = SERVICE_EXCHANGE, job_id, %error, "job file removal failed");
        }
        info!(service = SERVICE_EXCHANGE, job_id, "job deleted");
    }

    /// The result handler: forward the listener message downstream, then
    /// drop the job unless it watches non-stop.
    async fn handle_watch_outcome(&mut self, outcome: WatchOutcome) {
        let Some(entry) = self.jobs.get(&outcome.job_id) else {
            return;
        };
        let doc = entry.doc.clone();
        let nonstop = entry.nonstop;
        let message = outcome.message;

        let last_service = doc.last_service().unwrap_or("deprecate");
        let is_terminal = last_service == SERVICE_EXCHANGE;

        if !is_terminal {
            if let Some(next) = pipeline::next_service(SERVICE_EXCHANGE) {
                let _permit = self.publish_pool.acquire().await;
                forward(&self.broker, next, &message).await;
            }
        }

        let note = Notification {
            job_id: message.id.clone(),
            to: doc.notification_email().map(str::to_owned),
            notification_type: doc.notification_type(),
            status: message.status,
            utctime: doc
                .get("utctime")
                .and_then(Value::as_str)
                .unwrap_or("now")
                .to_string(),
            service: SERVICE_EXCHANGE.to_string(),
            last_service: last_service.to_string(),
            error_msgs: message.errors.clone(),
        };
        self.sink.notify(&note).await;

        let keep_watching = nonstop && message.status.is_success();
        if !keep_watching {
            if let Some(entry) = self.jobs.remove(&outcome.job_id) {
                entry.watcher.abort();
            }
            if let Err(error) = self.store.delete(&outcome.job_id) {
                warn!(
                    service = SERVICE_EXCHANGE,
                    job_id = outcome.job_id,
                    %error,
                    "job file removal failed"
                );
            }
        }
    }
}

/// One job's polling loop, run on its own task.
struct Watch {
    job_id: String,
    image: String,
    scanner: RepoScanner,
    conditions: Vec<Condition>,
    disallow_licenses: Vec<String>,
    disallow_packages: Vec<String>,
    nonstop: bool,
    poll_interval: Duration,
    conditions_wait: Duration,
}

impl Watch {
    async fn run(self, results: mpsc::UnboundedSender<WatchOutcome>) {
        let started = tokio::time::Instant::now();
        let mut last_published_build: Option<String> = None;

        loop {
            match self.scanner.scan(&self.image).await {
                Ok(Some(build)) => {
                    let mut failures =
                        evaluate_conditions(&self.conditions, &build.version, &build.packages);
                    failures.extend(evaluate_disallows(
                        &build.packages,
                        &self.disallow_licenses,
                        &self.disallow_packages,
                    ));

                    if failures.is_empty() {
                        let already_seen =
                            last_published_build.as_deref() == Some(&build.build_number);
                        if !already_seen {
                            last_published_build = Some(build.build_number.clone());

                            let mut message =
                                ListenerMessage::new(&self.job_id, JobStatus::Success);
                            message
                                .status_msg
                                .insert("image_file".into(), json!(build.image_file));
                            message
                                .status_msg
                                .insert("build_time".into(), json!(build.build_number));
                            message
                                .status_msg
                                .insert("version".into(), json!(build.version));

                            if results
                                .send(WatchOutcome {
                                    job_id: self.job_id.clone(),
                                    message,
                                })
                                .is_err()
                                || !self.nonstop
                            {
                                return;
                            }
                        }
                    } else if self.give_up(started) {
                        self.send_failure(&results, failures);
                        return;
                    } else {
                        debug!(
                            job_id = self.job_id,
                            "build found but conditions not met yet"
                        );
                    }
                }
                Ok(None) => {
                    if self.give_up(started) {
                        self.send_failure(
                            &results,
                            vec![format!("no build matching {} appeared", self.image)],
                        );
                        return;
                    }
                }
                Err(error) => {
                    warn!(job_id = self.job_id, %error, "repository poll failed");
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Non-stop jobs never give up; scheduled jobs fail once the
    /// conditions wait time runs out.
    fn give_up(&self, started: tokio::time::Instant) -> bool {
        !self.nonstop && started.elapsed() >= self.conditions_wait
    }

    fn send_failure(&self, results: &mpsc::UnboundedSender<WatchOutcome>, errors: Vec<String>) {
        let mut message = ListenerMessage::new(&self.job_id, JobStatus::Failed);
        message.errors = errors;
        let _ = results.send(WatchOutcome {
            job_id: self.job_id.clone(),
            message,
        });
    }
}

async fn forward(broker: &Broker, next: &str, message: &ListenerMessage) {
    let routing_key = format!("{SERVICE_EXCHANGE}.{}", message.id);
    let body = message.to_vec();

    for attempt in 0..FORWARD_RETRIES {
        match broker.publish(next, &routing_key, body.clone()) {
            Ok(()) => return,
            Err(BrokerError::Unroutable { .. }) if attempt + 1 < FORWARD_RETRIES => {
                tokio::time::sleep(FORWARD_RETRY_DELAY).await;
            }
            Err(error) => {
                error!(
                    job_id = message.id,
                    %error,
                    "listener message forward failed"
                );
                return;
            }
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
