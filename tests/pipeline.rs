//! Cross-service orchestration tests.
//!
//! Every test wires real services onto one shared in-process broker, with
//! a stub credentials service and an embedded HTTP build repository where
//! the flow needs them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Path;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use mash::broker::{Broker, Delivery};
use mash::config::Config;
use mash::handlers::{HandlerContext, JobFactory, StageHandler};
use mash::jobcreator::JobCreatorService;
use mash::listener::{ListenerArgs, ListenerService};
use mash::messages::{JobDocument, JobStatus, ListenerMessage};
use mash::obs::ObsWatchdogService;

const JOB_ID: &str = "00000000-0000-0000-0000-000000000001";

fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.job_directory_base = temp.path().join("lib");
    config.log_dir = temp.path().join("log");
    config.obs_poll_interval_seconds = 1;
    config.credentials_timeout_seconds = 5;
    config
}

/// Bind an observer queue alongside the real consumer; direct exchanges
/// fan out to every binding with a matching key.
fn spy_queue(broker: &Broker, exchange: &str, routing_key: &str) -> mpsc::UnboundedReceiver<Delivery> {
    let queue = format!("spy.{exchange}.{routing_key}");
    broker.declare_exchange(exchange);
    broker.declare_queue(&queue);
    broker.bind(exchange, &queue, routing_key).unwrap();
    broker.consume(&queue).unwrap()
}

/// Minimal credentials service: answers every account check by releasing
/// the job with a fixed accounts_info record.
fn start_credentials_stub(broker: &Broker) {
    broker.declare_exchange("credentials");
    broker.declare_exchange("jobcreator");
    broker.declare_queue("credentials.service");
    broker
        .bind("credentials", "credentials.service", "job_document")
        .unwrap();
    let mut requests = broker.consume("credentials.service").unwrap();

    let broker = broker.clone();
    tokio::spawn(async move {
        while let Some(delivery) = requests.recv().await {
            let body: Value = serde_json::from_slice(&delivery.body).unwrap_or_default();
            if let Some(check) = body.get("credentials_job_check") {
                let response = json!({
                    "start_job": {
                        "id": check["id"],
                        "accounts_info": {
                            "acnt1": {"region": "us-east-1", "partition": "aws"}
                        }
                    }
                });
                let _ = broker.publish(
                    "jobcreator",
                    "job_document",
                    serde_json::to_vec(&response).unwrap(),
                );
            }
            delivery.ack();
        }
    });
}

/// Embedded build repository serving an index page and package metadata.
async fn start_build_repo() -> String {
    const ARTIFACT: &str = "test-image-oem.x86_64-1.42.2-Build7.2.raw.xz";

    async fn index() -> String {
        format!(
            "<html><body>\
             <a href=\"{ARTIFACT}\">{ARTIFACT}</a>\
             <a href=\"{ARTIFACT}.sha256\">{ARTIFACT}.sha256</a>\
             <a href=\"test-image-oem.packages\">packages</a>\
             </body></html>"
        )
    }

    async fn file(Path(name): Path<String>) -> String {
        if name == "test-image-oem.packages" {
            "openssl|4.13.1|1.1|OpenSSL\nkernel-default|5.14.21|1.1|GPL-2.0-only\n".to_string()
        } else {
            "binary".to_string()
        }
    }

    let app = Router::new()
        .route("/", get(index))
        .route("/{name}", get(file));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

struct ScriptedHandler {
    status: JobStatus,
    status_msg: Map<String, Value>,
    error_msgs: Vec<String>,
    ran: Option<Arc<AtomicBool>>,
    delay: Duration,
}

#[async_trait]
impl StageHandler for ScriptedHandler {
    async fn run_job(&mut self, _ctx: &HandlerContext) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if let Some(ran) = &self.ran {
            ran.store(true, Ordering::SeqCst);
        }
    }

    fn status(&self) -> JobStatus {
        self.status
    }

    fn status_msg(&self) -> &Map<String, Value> {
        &self.status_msg
    }

    fn error_msgs(&self) -> &[String] {
        &self.error_msgs
    }
}

fn scripted_factory(
    service: &str,
    status: JobStatus,
    status_msg: Value,
    errors: Vec<String>,
    ran: Option<Arc<AtomicBool>>,
    delay: Duration,
) -> JobFactory {
    JobFactory::new(service).register("ec2", move |_doc: &JobDocument, _config: &Config| {
        Ok(Box::new(ScriptedHandler {
            status,
            status_msg: status_msg.as_object().cloned().unwrap_or_default(),
            error_msgs: errors.clone(),
            ran: ran.clone(),
            delay,
        }) as Box<dyn StageHandler>)
    })
}

fn passthrough_args(service: &str, listener_msg_args: &[&str]) -> ListenerArgs {
    ListenerArgs {
        listener_msg_args: listener_msg_args.iter().map(|s| s.to_string()).collect(),
        status_msg_args: vec![],
        job_factory: JobFactory::new(service),
    }
}

fn start_stage(broker: &Broker, config: &Config, service: &str, args: ListenerArgs) {
    let service = ListenerService::new(service, config.clone(), args, broker.clone()).unwrap();
    tokio::spawn(service.run());
}

fn ec2_request() -> Value {
    json!({
        "id": JOB_ID,
        "cloud": "ec2",
        "requesting_user": "user1",
        "last_service": "publish",
        "utctime": "now",
        "image": "test-image-oem",
        "cloud_image_name": "new-image-123",
        "image_description": "New Image #123",
        "distro": "sles",
        "download_url": "https://download.example.com/images",
        "cloud_accounts": [{"name": "acnt1", "region": "us-east-1"}]
    })
}

async fn recv_listener_message(
    queue: &mut mpsc::UnboundedReceiver<Delivery>,
    wait: Duration,
) -> ListenerMessage {
    let delivery = timeout(wait, queue.recv())
        .await
        .expect("timed out waiting for listener message")
        .expect("queue closed");
    let message = ListenerMessage::from_slice(&delivery.body).unwrap();
    delivery.ack();
    message
}

async fn wait_until_empty(dir: &std::path::Path, wait: Duration) {
    let result = timeout(wait, async {
        loop {
            let occupied = std::fs::read_dir(dir)
                .map(|entries| entries.count() > 0)
                .unwrap_or(false);
            if !occupied {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "job directory not drained: {}", dir.display());
}

/// Happy path: user request through the creator, the OBS watchdog finds
/// the build, and every stage up to publish runs and forwards the
/// accumulated state.
#[tokio::test]
async fn test_full_pipeline_ec2_job() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let broker = Broker::new();

    let repo = start_build_repo().await;
    start_credentials_stub(&broker);

    tokio::spawn(
        ObsWatchdogService::new(config.clone(), broker.clone())
            .unwrap()
            .run(),
    );
    start_stage(&broker, &config, "upload", passthrough_args("upload", &["image_file"]));
    start_stage(
        &broker,
        &config,
        "create",
        ListenerArgs {
            listener_msg_args: vec!["image_file".to_string()],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "create",
                JobStatus::Success,
                json!({"cloud_image_name": "new-image-123", "source_regions": {"us-east-1": "ami-123"}}),
                vec![],
                None,
                Duration::ZERO,
            ),
        },
    );
    start_stage(
        &broker,
        &config,
        "test",
        passthrough_args("test", &["cloud_image_name"]),
    );
    start_stage(
        &broker,
        &config,
        "raw_image_upload",
        passthrough_args("raw_image_upload", &[]),
    );
    start_stage(
        &broker,
        &config,
        "replicate",
        passthrough_args("replicate", &["source_regions"]),
    );
    start_stage(&broker, &config, "publish", passthrough_args("publish", &[]));

    let mut spy = spy_queue(&broker, "publish", &format!("replicate.{JOB_ID}"));

    let creator = JobCreatorService::new(config.clone(), broker.clone());
    tokio::spawn(creator.run());
    sleep(Duration::from_millis(100)).await;

    // The job request points at the embedded build repository
    let mut request = ec2_request();
    request["download_url"] = json!(repo);
    broker
        .publish(
            "jobcreator",
            "job_document",
            serde_json::to_vec(&request).unwrap(),
        )
        .unwrap();

    let message = recv_listener_message(&mut spy, Duration::from_secs(30)).await;
    assert_eq!(message.id, JOB_ID);
    assert_eq!(message.status, JobStatus::Success);
    // State accumulated across stages: the watchdog's artifact plus the
    // create stage's outputs
    let image_file = message.status_msg["image_file"].as_str().unwrap();
    assert!(image_file.ends_with("test-image-oem.x86_64-1.42.2-Build7.2.raw.xz"));
    assert_eq!(message.status_msg["cloud_image_name"], "new-image-123");
    assert_eq!(message.status_msg["source_regions"]["us-east-1"], "ami-123");

    // The terminal stage settles without forwarding and drops its state
    wait_until_empty(&config.job_directory("publish"), Duration::from_secs(10)).await;
}

/// A failing stage rolls the pipeline into failure propagation: later
/// stages forward the failure without running their handlers.
#[tokio::test]
async fn test_handler_failure_propagates_without_running_later_stages() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let broker = Broker::new();

    let test_ran = Arc::new(AtomicBool::new(false));
    let publish_ran = Arc::new(AtomicBool::new(false));

    start_stage(
        &broker,
        &config,
        "create",
        ListenerArgs {
            listener_msg_args: vec![],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "create",
                JobStatus::Failed,
                json!({"source_regions": {"us-east-1": null}}),
                vec!["Image creation in account acnt1 failed".to_string()],
                None,
                Duration::ZERO,
            ),
        },
    );
    start_stage(
        &broker,
        &config,
        "test",
        ListenerArgs {
            listener_msg_args: vec![],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "test",
                JobStatus::Success,
                json!({}),
                vec![],
                Some(Arc::clone(&test_ran)),
                Duration::ZERO,
            ),
        },
    );
    start_stage(
        &broker,
        &config,
        "raw_image_upload",
        passthrough_args("raw_image_upload", &[]),
    );
    start_stage(
        &broker,
        &config,
        "replicate",
        passthrough_args("replicate", &[]),
    );
    start_stage(
        &broker,
        &config,
        "publish",
        ListenerArgs {
            listener_msg_args: vec![],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "publish",
                JobStatus::Success,
                json!({}),
                vec![],
                Some(Arc::clone(&publish_ran)),
                Duration::ZERO,
            ),
        },
    );

    let mut spy = spy_queue(&broker, "publish", &format!("replicate.{JOB_ID}"));
    sleep(Duration::from_millis(100)).await;

    // Seed stage job documents directly; the creator fan-out is covered
    // elsewhere
    for service in ["create", "test", "raw_image_upload", "replicate", "publish"] {
        let doc = json!({
            format!("{service}_job"): {
                "id": JOB_ID,
                "cloud": "ec2",
                "utctime": "now",
                "last_service": "publish",
                "requesting_user": "user1"
            }
        });
        broker
            .publish(service, "job_document", serde_json::to_vec(&doc).unwrap())
            .unwrap();
    }
    sleep(Duration::from_millis(200)).await;

    // Trigger the create stage as if upload had succeeded
    let mut trigger = ListenerMessage::new(JOB_ID, JobStatus::Success);
    trigger.status_msg.insert("image_file".into(), json!("img.raw"));
    broker
        .publish("create", &format!("upload.{JOB_ID}"), trigger.to_vec())
        .unwrap();

    let message = recv_listener_message(&mut spy, Duration::from_secs(15)).await;
    assert_eq!(message.status, JobStatus::Failed);
    assert!(message
        .errors
        .iter()
        .any(|error| error.contains("Image creation in account acnt1 failed")));
    // The failed create stage still reported its cleanup state
    assert!(message.status_msg["source_regions"]["us-east-1"].is_null());

    wait_until_empty(&config.job_directory("publish"), Duration::from_secs(10)).await;
    assert!(!test_ran.load(Ordering::SeqCst), "test handler ran on failure");
    assert!(
        !publish_ran.load(Ordering::SeqCst),
        "publish handler ran on failure"
    );
}

/// Kill a service between job receipt and handler completion; on restart
/// the persisted job re-registers and a re-sent trigger runs it.
#[tokio::test]
async fn test_crash_recovery_rehydrates_persisted_jobs() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);

    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<JobDocument>();

    let make_args = |tx: mpsc::UnboundedSender<JobDocument>| ListenerArgs {
        listener_msg_args: vec![],
        status_msg_args: vec![],
        job_factory: JobFactory::new("upload").register(
            "ec2",
            move |doc: &JobDocument, _config: &Config| {
                let _ = tx.send(doc.clone());
                Ok(Box::new(ScriptedHandler {
                    status: JobStatus::Success,
                    status_msg: Map::new(),
                    error_msgs: vec![],
                    ran: None,
                    delay: Duration::ZERO,
                }) as Box<dyn StageHandler>)
            },
        ),
    };

    // First life: receive the job document, then die
    let broker = Broker::new();
    let service = ListenerService::new(
        "upload",
        config.clone(),
        make_args(started_tx.clone()),
        broker.clone(),
    )
    .unwrap();
    let life_one = tokio::spawn(service.run());

    sleep(Duration::from_millis(100)).await;
    let doc = json!({
        "upload_job": {
            "id": JOB_ID,
            "cloud": "ec2",
            "utctime": "now",
            "last_service": "upload",
            "requesting_user": "user1"
        }
    });
    broker
        .publish("upload", "job_document", serde_json::to_vec(&doc).unwrap())
        .unwrap();

    let registered = timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registered.id().unwrap(), JOB_ID);

    life_one.abort();
    let job_file = config.job_directory("upload").join(format!("job-{JOB_ID}.json"));
    assert!(job_file.exists(), "job file must survive the crash");

    // Second life: a fresh broker connection, same job directory
    let broker = Broker::new();
    let service = ListenerService::new(
        "upload",
        config.clone(),
        make_args(started_tx),
        broker.clone(),
    )
    .unwrap();
    tokio::spawn(service.run());

    // Rehydration runs the registration callback exactly once more, with
    // the persisted contents
    let rehydrated = timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rehydrated.id().unwrap(), JOB_ID);
    assert_eq!(
        rehydrated.get("last_service").unwrap(),
        registered.get("last_service").unwrap()
    );
    assert!(started_rx.try_recv().is_err());

    // A re-sent trigger completes the job on the new incarnation
    let trigger = ListenerMessage::new(JOB_ID, JobStatus::Success);
    broker
        .publish("upload", &format!("obs.{JOB_ID}"), trigger.to_vec())
        .unwrap();

    wait_until_empty(&config.job_directory("upload"), Duration::from_secs(10)).await;
}

/// A delete during execution lets the handler finish but discards its
/// output: nothing is forwarded and the persisted file is gone.
#[tokio::test]
async fn test_delete_discards_running_job_result() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let broker = Broker::new();

    let ran = Arc::new(AtomicBool::new(false));
    start_stage(
        &broker,
        &config,
        "upload",
        ListenerArgs {
            listener_msg_args: vec![],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "upload",
                JobStatus::Success,
                json!({"image_file": "img.raw"}),
                vec![],
                Some(Arc::clone(&ran)),
                Duration::from_millis(500),
            ),
        },
    );

    // If the discarded result were forwarded anyway, this spy would see it
    let mut spy = spy_queue(&broker, "create", &format!("upload.{JOB_ID}"));
    sleep(Duration::from_millis(100)).await;

    let doc = json!({
        "upload_job": {
            "id": JOB_ID,
            "cloud": "ec2",
            "utctime": "now",
            "last_service": "publish",
            "requesting_user": "user1"
        }
    });
    broker
        .publish("upload", "job_document", serde_json::to_vec(&doc).unwrap())
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let trigger = ListenerMessage::new(JOB_ID, JobStatus::Success);
    broker
        .publish("upload", &format!("obs.{JOB_ID}"), trigger.to_vec())
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    // Delete lands while the handler sleeps
    let delete = json!({"upload_job_delete": JOB_ID});
    broker
        .publish("upload", "job_document", serde_json::to_vec(&delete).unwrap())
        .unwrap();

    wait_until_empty(&config.job_directory("upload"), Duration::from_secs(5)).await;
    sleep(Duration::from_secs(1)).await;

    assert!(ran.load(Ordering::SeqCst), "handler must run to completion");
    assert!(
        spy.try_recv().is_err(),
        "discarded job result must not be forwarded"
    );
}

/// Non-stop OBS job: the watchdog publishes when conditions match and
/// keeps the job alive, polling for further builds until deleted.
#[tokio::test]
async fn test_obs_nonstop_watchdog() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let broker = Broker::new();

    let repo = start_build_repo().await;
    tokio::spawn(
        ObsWatchdogService::new(config.clone(), broker.clone())
            .unwrap()
            .run(),
    );

    let mut spy = spy_queue(&broker, "upload", &format!("obs.{JOB_ID}"));
    sleep(Duration::from_millis(100)).await;

    let doc = json!({
        "obs_job": {
            "id": JOB_ID,
            "image": "test-image-oem",
            "download_url": repo,
            "utctime": "always",
            "last_service": "publish",
            "conditions": [
                {"package_name": "openssl", "version": "4.13.1", "condition": ">="}
            ]
        }
    });
    broker
        .publish("obs", "job_document", serde_json::to_vec(&doc).unwrap())
        .unwrap();

    let message = recv_listener_message(&mut spy, Duration::from_secs(15)).await;
    assert_eq!(message.status, JobStatus::Success);
    assert!(message.status_msg["image_file"]
        .as_str()
        .unwrap()
        .ends_with(".raw.xz"));
    assert_eq!(message.status_msg["build_time"], "7.2");

    // Non-stop jobs persist and keep watching
    let job_file = config.job_directory("obs").join(format!("job-{JOB_ID}.json"));
    sleep(Duration::from_secs(2)).await;
    assert!(job_file.exists(), "non-stop job must stay registered");

    let delete = json!({"obs_job_delete": JOB_ID});
    broker
        .publish("obs", "job_document", serde_json::to_vec(&delete).unwrap())
        .unwrap();
    wait_until_empty(&config.job_directory("obs"), Duration::from_secs(5)).await;
}

/// With a JWT secret configured, the creator checks accounts over HTTP
/// and fans the job out without waiting for a broker round-trip.
#[tokio::test]
async fn test_jobcreator_http_account_check() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);

    async fn accounts_check(
        headers: axum::http::HeaderMap,
        body: String,
    ) -> axum::Json<Value> {
        // The creator must authenticate with a bearer token
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert!(auth.starts_with("Bearer "), "missing JWT: {auth}");

        let check: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(check["credentials_job_check"]["cloud"], "ec2");

        axum::Json(json!({
            "accounts_info": {
                "acnt1": {"region": "us-east-1", "partition": "aws"}
            }
        }))
    }

    let app = Router::new().route("/accounts/check", axum::routing::post(accounts_check));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    config.jwt_secret = Some("super.secret".to_string());
    config.credentials_url = format!("http://{addr}/");

    let broker = Broker::new();
    let mut obs_spy = spy_queue(&broker, "obs", "job_document");
    // The credentials job is still published over the broker
    let mut creds_spy = spy_queue(&broker, "credentials", "job_document");

    tokio::spawn(JobCreatorService::new(config, broker.clone()).run());
    sleep(Duration::from_millis(100)).await;

    broker
        .publish(
            "jobcreator",
            "job_document",
            serde_json::to_vec(&ec2_request()).unwrap(),
        )
        .unwrap();

    let delivery = timeout(Duration::from_secs(10), creds_spy.recv())
        .await
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(message["credentials_job"]["id"], JOB_ID);

    let delivery = timeout(Duration::from_secs(10), obs_spy.recv())
        .await
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(message["obs_job"]["id"], JOB_ID);
    assert_eq!(message["obs_job"]["image"], "test-image-oem");
}

/// Listener messages that overtake their job document are requeued once,
/// then run as soon as the document lands.
#[tokio::test]
async fn test_listener_message_before_job_document() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let broker = Broker::new();

    let ran = Arc::new(AtomicBool::new(false));
    start_stage(
        &broker,
        &config,
        "create",
        ListenerArgs {
            listener_msg_args: vec![],
            status_msg_args: vec![],
            job_factory: scripted_factory(
                "create",
                JobStatus::Success,
                json!({}),
                vec![],
                Some(Arc::clone(&ran)),
                Duration::ZERO,
            ),
        },
    );
    sleep(Duration::from_millis(100)).await;

    // The listener queue only exists after service start; bind the
    // trigger key manually so the early message routes at all
    broker
        .bind("create", "create.listener", &format!("upload.{JOB_ID}"))
        .unwrap();

    let trigger = ListenerMessage::new(JOB_ID, JobStatus::Success);
    broker
        .publish("create", &format!("upload.{JOB_ID}"), trigger.to_vec())
        .unwrap();

    let doc = json!({
        "create_job": {
            "id": JOB_ID,
            "cloud": "ec2",
            "utctime": "now",
            "last_service": "create",
            "requesting_user": "user1"
        }
    });
    broker
        .publish("create", "job_document", serde_json::to_vec(&doc).unwrap())
        .unwrap();

    let result = timeout(Duration::from_secs(5), async {
        while !ran.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "requeued trigger should run the handler");
}
