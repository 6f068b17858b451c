use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("message to exchange {exchange} with key {routing_key} is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    #[error("queue {0} is already being consumed")]
    AlreadyConsumed(String),

    #[error("broker connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// One message handed to a consumer. Dropping it without `ack` or
/// `requeue` discards it, matching manual-acknowledgement semantics where
/// the consumer owns the delivery once received.
#[derive(Debug)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: &'static str,
    /// Set when this delivery already went around once via `requeue`.
    pub redelivered: bool,
    requeue_tx: mpsc::UnboundedSender<Delivery>,
}

impl Delivery {
    pub fn ack(self) {}

    /// Put the message back on its queue with the redelivered flag set.
    /// A second requeue of the same message is a silent drop.
    pub fn requeue(mut self) {
        if self.redelivered {
            return;
        }
        self.redelivered = true;
        let tx = self.requeue_tx.clone();
        let _ = tx.send(self);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueSlot {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

#[derive(Default)]
struct Inner {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueSlot>,
    closed: bool,
}

/// Process-scoped broker client. All services in one process (and all
/// integration tests) share a single instance; the mutex doubles as the
/// lock-protected publisher the single-channel model requires.
#[derive(Clone, Default)]
pub struct Broker {
    inner: Arc<Mutex<Inner>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_exchange(&self, name: &str) {
        let mut inner = self.lock();
        inner.exchanges.entry(name.to_string()).or_default();
    }

    pub fn declare_queue(&self, name: &str) {
        let mut inner = self.lock();
        inner.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueSlot { tx, rx: Some(rx) }
        });
    }

    pub fn bind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let bindings = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    pub fn unbind(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.lock();
        let bindings = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;
        bindings.retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        Ok(())
    }

    /// Publish with mandatory semantics: routing to zero queues is an
    /// error rather than a silent drop.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(BrokerError::Closed);
        }

        let bindings = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_string()))?;

        let targets: Vec<&Binding> = bindings
            .iter()
            .filter(|b| b.routing_key == routing_key)
            .collect();

        if targets.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        for binding in targets {
            let slot = inner
                .queues
                .get(&binding.queue)
                .ok_or_else(|| BrokerError::UnknownQueue(binding.queue.clone()))?;

            let delivery = Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                content_type: CONTENT_TYPE_JSON,
                redelivered: false,
                requeue_tx: slot.tx.clone(),
            };
            slot.tx.send(delivery).map_err(|_| BrokerError::Closed)?;
        }

        debug!(exchange, routing_key, "message published");
        Ok(())
    }

    /// Hand the queue's receiver to its single consumer.
    pub fn consume(&self, queue: &str) -> Result<mpsc::UnboundedReceiver<Delivery>> {
        let mut inner = self.lock();
        let slot = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        slot.rx
            .take()
            .ok_or_else(|| BrokerError::AlreadyConsumed(queue.to_string()))
    }

    /// Drop every queue sender. Consumers observe end-of-stream and exit
    /// their loops; further publishes fail with `Closed`.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for slot in inner.queues.values_mut() {
            let (tx, _) = mpsc::unbounded_channel();
            slot.tx = tx;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a publisher panicked; propagating
        // the inner state is still sound for this process-local broker.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
