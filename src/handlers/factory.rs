use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::noop::NoOpHandler;
use super::traits::{HandlerError, StageHandler};
use crate::config::Config;
use crate::messages::JobDocument;

/// Builds a stage handler from a job document. Construction performs the
/// stage's `post_init` contract: missing stage-specific keys fail here.
pub type HandlerConstructor =
    dyn Fn(&JobDocument, &Config) -> Result<Box<dyn StageHandler>, HandlerError> + Send + Sync;

/// Maps a cloud identifier to this service's handler for that cloud.
///
/// A cloud with no entry falls back to the no-op handler; that is how a
/// stage opts out per cloud rather than failing jobs it has no work for.
pub struct JobFactory {
    service: String,
    constructors: HashMap<String, Arc<HandlerConstructor>>,
}

impl JobFactory {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            constructors: HashMap::new(),
        }
    }

    pub fn register<F>(mut self, cloud: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&JobDocument, &Config) -> Result<Box<dyn StageHandler>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(cloud.into(), Arc::new(constructor));
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn create(
        &self,
        doc: &JobDocument,
        config: &Config,
    ) -> Result<Box<dyn StageHandler>, HandlerError> {
        let cloud = doc.cloud().unwrap_or_default();
        match self.constructors.get(cloud) {
            Some(constructor) => constructor(doc, config),
            None => {
                debug!(
                    service = %self.service,
                    cloud,
                    "no handler registered, using no-op"
                );
                Ok(Box::new(NoOpHandler::new()))
            }
        }
    }
}
