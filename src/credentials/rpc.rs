use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

use crate::broker::{Broker, BrokerError};

pub const CREDENTIALS_EXCHANGE: &str = "credentials";

/// `{account_name -> {key -> secret}}`, opaque to the core.
pub type CredentialsBundle = Map<String, Value>;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credentials unavailable: no response within {0:?}")]
    Timeout(Duration),

    #[error("credentials unavailable: {0}")]
    Broker(#[from] BrokerError),

    #[error("credentials response malformed: {0}")]
    Malformed(String),

    #[error("a credentials request for job {0} is already in flight")]
    DuplicateRequest(String),

    #[error("this service runs without credentials")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, CredentialsError>;

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CredentialsBundle>>>>;

/// Request/response credentials fetch over the broker.
///
/// One client per service. Requests publish to the credentials exchange
/// with the service's request key; a background router consumes the
/// service's reply queue and completes the matching pending request by job
/// id. Correlation state is a mutex-guarded map of oneshot senders.
pub struct CredentialsClient {
    service: String,
    broker: Broker,
    timeout: Duration,
    pending: PendingMap,
}

impl CredentialsClient {
    pub fn start(service: &str, broker: Broker, timeout: Duration) -> Result<Self> {
        let reply_queue = format!("{service}.credentials");
        broker.declare_exchange(CREDENTIALS_EXCHANGE);
        broker.declare_queue(&reply_queue);
        broker.bind(
            CREDENTIALS_EXCHANGE,
            &reply_queue,
            &format!("response.{service}"),
        )?;

        let pending: PendingMap = Arc::default();
        let mut replies = broker.consume(&reply_queue)?;

        let router_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(delivery) = replies.recv().await {
                route_reply(&router_pending, &delivery.body);
                delivery.ack();
            }
        });

        Ok(Self {
            service: service.to_string(),
            broker,
            timeout,
            pending,
        })
    }

    /// Fetch the credential bundle for the given accounts, blocking the
    /// calling handler until the credentials service answers or the
    /// timeout (default 60 s) elapses.
    pub async fn request_credentials(
        &self,
        job_id: &str,
        cloud: &str,
        accounts: &[String],
        requesting_user: &str,
    ) -> Result<CredentialsBundle> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            if pending.contains_key(job_id) {
                return Err(CredentialsError::DuplicateRequest(job_id.to_string()));
            }
            pending.insert(job_id.to_string(), tx);
        }

        let request = json!({
            "credentials_request": {
                "id": job_id,
                "cloud": cloud,
                "accounts": accounts,
                "requesting_user": requesting_user
            }
        });

        let published = self.broker.publish(
            CREDENTIALS_EXCHANGE,
            &format!("request.{}", self.service),
            serde_json::to_vec(&request).unwrap_or_default(),
        );
        if let Err(error) = published {
            self.lock_pending().remove(job_id);
            return Err(error.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(bundle)) => Ok(bundle),
            Ok(Err(_)) => Err(CredentialsError::Malformed(
                "reply channel dropped".to_string(),
            )),
            Err(_) => {
                self.lock_pending().remove(job_id);
                Err(CredentialsError::Timeout(self.timeout))
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<CredentialsBundle>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn route_reply(pending: &PendingMap, body: &[u8]) {
    let parsed: std::result::Result<Map<String, Value>, _> = serde_json::from_slice(body);
    let Ok(outer) = parsed else {
        warn!("dropping malformed credentials response");
        return;
    };

    let Some(response) = outer.get("credentials_response").and_then(Value::as_object) else {
        warn!("dropping credentials message without credentials_response key");
        return;
    };

    let Some(id) = response.get("id").and_then(Value::as_str) else {
        warn!("dropping credentials response without job id");
        return;
    };

    let bundle = response
        .get("credentials")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let sender = {
        let mut guard = match pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(id)
    };

    match sender {
        Some(tx) => {
            let _ = tx.send(bundle);
        }
        None => warn!(job_id = id, "credentials response for unknown job"),
    }
}
