use serde_json::{Map, Value};
use thiserror::Error;

use super::document::JobDocument;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON deserialize error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no idea what to do with: {0}")]
    UnknownShape(String),

    #[error("{0} message carries a non-object payload")]
    BadPayload(String),
}

/// Inbound message on a stage service's job-document queue.
///
/// The wire body is a one-key object: `{"<svc>_job": {...}}` carries a new
/// stage job, `{"<svc>_job_delete": "<id>"}` evicts one.
#[derive(Debug)]
pub enum ServiceMessage {
    Job(JobDocument),
    Delete(String),
}

impl ServiceMessage {
    pub fn parse(service: &str, raw: &[u8]) -> Result<Self, ParseError> {
        let body: Map<String, Value> = serde_json::from_slice(raw)?;

        let job_key = format!("{service}_job");
        if let Some(payload) = body.get(&job_key) {
            let fields = payload
                .as_object()
                .ok_or_else(|| ParseError::BadPayload(job_key.clone()))?;
            return Ok(ServiceMessage::Job(JobDocument::new(fields.clone())));
        }

        let delete_key = format!("{service}_job_delete");
        if let Some(id) = body.get(&delete_key).and_then(Value::as_str) {
            return Ok(ServiceMessage::Delete(id.to_string()));
        }

        Err(ParseError::UnknownShape(
            String::from_utf8_lossy(raw).into_owned(),
        ))
    }
}

/// Inbound message on the job creator's service queue.
#[derive(Debug)]
pub enum CreatorMessage {
    /// Raw user job request, pending schema validation.
    NewJob(Map<String, Value>),
    /// Credentials response releasing a pending job into the pipeline.
    StartJob { id: String, accounts_info: Value },
    /// The account check rejected the job before fan-out.
    InvalidJob(String),
    /// Flush the job with this id out of the whole pipeline.
    Delete(String),
}

impl CreatorMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let body: Map<String, Value> = serde_json::from_slice(raw)?;

        if let Some(id) = body.get("job_delete").and_then(Value::as_str) {
            return Ok(CreatorMessage::Delete(id.to_string()));
        }

        if let Some(id) = body.get("invalid_job").and_then(Value::as_str) {
            return Ok(CreatorMessage::InvalidJob(id.to_string()));
        }

        if let Some(start) = body.get("start_job") {
            let start = start
                .as_object()
                .ok_or_else(|| ParseError::BadPayload("start_job".into()))?;
            let id = start
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| ParseError::BadPayload("start_job".into()))?;
            let accounts_info = start.get("accounts_info").cloned().unwrap_or(Value::Null);
            return Ok(CreatorMessage::StartJob {
                id: id.to_string(),
                accounts_info,
            });
        }

        Ok(CreatorMessage::NewJob(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_job() {
        let raw = br#"{"obs_job": {"id": "4711", "image": "test-image-docker", "utctime": "always"}}"#;
        match ServiceMessage::parse("obs", raw).unwrap() {
            ServiceMessage::Job(doc) => {
                assert_eq!(doc.id().unwrap(), "4711");
                assert_eq!(doc.get("image").unwrap(), "test-image-docker");
            }
            other => panic!("expected job message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stage_delete() {
        let raw = br#"{"obs_job_delete": "4711"}"#;
        match ServiceMessage::parse("obs", raw).unwrap() {
            ServiceMessage::Delete(id) => assert_eq!(id, "4711"),
            other => panic!("expected delete message, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        // A delete addressed to another stage is not ours to act on
        let raw = br#"{"test_job_delete": "4711"}"#;
        assert!(ServiceMessage::parse("obs", raw).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ServiceMessage::parse("obs", b"foo").is_err());
    }

    #[test]
    fn test_creator_message_variants() {
        let delete = CreatorMessage::parse(br#"{"job_delete": "1"}"#).unwrap();
        assert!(matches!(delete, CreatorMessage::Delete(id) if id == "1"));

        let invalid = CreatorMessage::parse(br#"{"invalid_job": "2"}"#).unwrap();
        assert!(matches!(invalid, CreatorMessage::InvalidJob(id) if id == "2"));

        let start = CreatorMessage::parse(
            br#"{"start_job": {"id": "3", "accounts_info": {"acct": {}}}}"#,
        )
        .unwrap();
        match start {
            CreatorMessage::StartJob { id, accounts_info } => {
                assert_eq!(id, "3");
                assert!(accounts_info.is_object());
            }
            other => panic!("expected start_job, got {other:?}"),
        }

        let new = CreatorMessage::parse(br#"{"cloud": "ec2"}"#).unwrap();
        assert!(matches!(new, CreatorMessage::NewJob(_)));
    }
}
