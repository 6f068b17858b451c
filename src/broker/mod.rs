//! Durable-exchange / durable-queue messaging substrate.
//!
//! Every service owns one [`Broker`] handle and funnels all publishes
//! through it. Exchanges are direct: a published message is routed to every
//! queue bound with an exactly matching routing key. Queues have a single
//! consumer, manual acknowledgement, and a one-shot requeue for the
//! arrived-before-registration case.

mod client;

pub use client::{Broker, BrokerError, Delivery, Result, CONTENT_TYPE_JSON};
