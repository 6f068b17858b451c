use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::status::NotificationType;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("job document requires a(n) {0} key")]
    MissingKey(String),

    #[error("job document key {key} has an unexpected value: {value}")]
    InvalidValue { key: String, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Schedule selector from the `utctime` field.
///
/// `"now"` runs as soon as possible, `"always"` keeps the job alive for
/// repeated runs (non-stop OBS watching), and an RFC 3339 timestamp
/// schedules a single run at that instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UtcTime {
    Now,
    Always,
    At(DateTime<Utc>),
}

impl UtcTime {
    pub fn parse(raw: &str) -> Result<Self, DocumentError> {
        match raw {
            "now" => Ok(UtcTime::Now),
            "always" => Ok(UtcTime::Always),
            other => DateTime::parse_from_rfc3339(other)
                .map(|ts| UtcTime::At(ts.with_timezone(&Utc)))
                .map_err(|_| DocumentError::InvalidValue {
                    key: "utctime".into(),
                    value: other.into(),
                }),
        }
    }

    pub fn is_nonstop(self) -> bool {
        matches!(self, UtcTime::Always)
    }
}

/// One stage's view of a job: the JSON object carried under the
/// `<service>_job` key and persisted to the job directory.
///
/// The set of stage-specific fields is open, so the document stays an
/// ordered map with typed accessors for the fields the framework itself
/// needs. Serialization is canonical (sorted keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDocument(Map<String, Value>);

impl JobDocument {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, DocumentError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn id(&self) -> Result<&str, DocumentError> {
        self.str_field("id")
    }

    pub fn cloud(&self) -> Option<&str> {
        self.0.get("cloud").and_then(Value::as_str)
    }

    pub fn last_service(&self) -> Result<&str, DocumentError> {
        self.str_field("last_service")
    }

    pub fn utctime(&self) -> Result<UtcTime, DocumentError> {
        UtcTime::parse(self.str_field("utctime")?)
    }

    pub fn notification_email(&self) -> Option<&str> {
        self.0.get("notification_email").and_then(Value::as_str)
    }

    pub fn notification_type(&self) -> NotificationType {
        self.0
            .get("notification_type")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn job_file(&self) -> Option<&str> {
        self.0.get("job_file").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Structural presence check for the keys a stage expects to receive.
    pub fn require_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<(), DocumentError> {
        for key in keys {
            if !self.0.contains_key(key.as_ref()) {
                return Err(DocumentError::MissingKey(key.as_ref().to_string()));
            }
        }
        Ok(())
    }

    fn str_field(&self, key: &str) -> Result<&str, DocumentError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| DocumentError::MissingKey(key.to_string()))?;
        value.as_str().ok_or_else(|| DocumentError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_doc() -> JobDocument {
        let value = json!({
            "id": "4711",
            "cloud": "ec2",
            "last_service": "publish",
            "utctime": "now",
            "notification_email": "user@fake.com",
            "notification_type": "periodic"
        });
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_typed_accessors() {
        let doc = sample_doc();
        assert_eq!(doc.id().unwrap(), "4711");
        assert_eq!(doc.cloud(), Some("ec2"));
        assert_eq!(doc.last_service().unwrap(), "publish");
        assert_eq!(doc.utctime().unwrap(), UtcTime::Now);
        assert_eq!(doc.notification_email(), Some("user@fake.com"));
        assert_eq!(doc.notification_type(), NotificationType::Periodic);
    }

    #[test]
    fn test_missing_key() {
        let doc = JobDocument::default();
        assert!(matches!(doc.id(), Err(DocumentError::MissingKey(_))));
    }

    #[test]
    fn test_utctime_variants() {
        assert_eq!(UtcTime::parse("now").unwrap(), UtcTime::Now);
        assert!(UtcTime::parse("always").unwrap().is_nonstop());

        let at = UtcTime::parse("2017-10-11T17:50:26+00:00").unwrap();
        match at {
            UtcTime::At(ts) => assert_eq!(ts.timestamp(), 1507744226),
            other => panic!("expected scheduled time, got {other:?}"),
        }

        assert!(UtcTime::parse("whenever").is_err());
    }

    #[test]
    fn test_canonical_serialization() {
        let mut doc = JobDocument::default();
        doc.insert("zebra", json!(1));
        doc.insert("alpha", json!(2));

        // serde_json maps sort keys, giving the canonical on-disk form
        let raw = serde_json::to_string(&doc).unwrap();
        assert_eq!(raw, r#"{"alpha":2,"zebra":1}"#);
    }

    #[test]
    fn test_require_keys() {
        let doc = sample_doc();
        assert!(doc.require_keys(&["id", "cloud"]).is_ok());
        assert!(doc.require_keys(&["image_file"]).is_err());
    }
}
