use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::status::JobStatus;

/// Payload forwarded from stage N to stage N+1.
///
/// `status_msg` is additive: each stage merges its own outputs (image file,
/// source regions, blob name, ...) into whatever the previous stages put
/// there, so the terminal stage sees the accumulated pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerMessage {
    pub id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub status_msg: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ListenerMessage {
    pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id: id.into(),
            status,
            status_msg: Map::new(),
            errors: Vec::new(),
        }
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // Serialization of a Map cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Merge another stage's outputs over this message's accumulated state.
    /// Later writers win on key collisions.
    pub fn merge_status_msg(&mut self, updates: &Map<String, Value>) {
        for (key, value) in updates {
            self.status_msg.insert(key.clone(), value.clone());
        }
    }

    /// Structural check applied at merge time: the keys a stage needs from
    /// its predecessor must be present before its handler runs.
    pub fn require_keys(&self, keys: &[String]) -> Result<(), String> {
        for key in keys {
            if !self.status_msg.contains_key(key) {
                return Err(format!(
                    "listener message requires a(n) {key} key in status_msg"
                ));
            }
        }
        Ok(())
    }
}
