//! Canonical pipeline order and the legacy-name table.
//!
//! Older job documents used per-service names that drifted from the
//! exchange names (`testing` vs `test`, `publisher` vs `publish`). All
//! intake paths normalize through this table once; everything downstream
//! sees canonical names only.

use thiserror::Error;

/// Stage services in pipeline order. The job creator walks this list when
/// fanning a job out; listener services use it to find their neighbors.
pub const PIPELINE: &[&str] = &[
    "obs",
    "upload",
    "create",
    "test",
    "raw_image_upload",
    "replicate",
    "publish",
    "deprecate",
];

/// Services that run without cloud credentials.
pub const NON_CREDENTIAL_SERVICES: &[&str] = &["obs"];

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("unknown pipeline service: {0}")]
    UnknownService(String),
}

/// Map legacy service names onto the canonical exchange names.
pub fn normalize(name: &str) -> Result<&'static str, PipelineError> {
    let canonical = match name {
        "uploader" => "upload",
        "testing" => "test",
        "replication" => "replicate",
        "publisher" => "publish",
        "deprecation" | "cleanup" => "deprecate",
        other => other,
    };

    PIPELINE
        .iter()
        .find(|service| **service == canonical)
        .copied()
        .ok_or_else(|| PipelineError::UnknownService(name.to_string()))
}

pub fn position(service: &str) -> Option<usize> {
    PIPELINE.iter().position(|name| *name == service)
}

/// The stage a service forwards its listener messages to.
pub fn next_service(service: &str) -> Option<&'static str> {
    position(service).and_then(|idx| PIPELINE.get(idx + 1)).copied()
}

/// The stage whose listener messages a service consumes.
pub fn prev_service(service: &str) -> Option<&'static str> {
    match position(service)? {
        0 => None,
        idx => PIPELINE.get(idx - 1).copied(),
    }
}

/// Whether `service` participates in a job terminating at `last_service`.
pub fn includes(service: &str, last_service: &str) -> bool {
    match (position(service), position(last_service)) {
        (Some(at), Some(last)) => at <= last,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_legacy_names() {
        assert_eq!(normalize("testing").unwrap(), "test");
        assert_eq!(normalize("publisher").unwrap(), "publish");
        assert_eq!(normalize("deprecation").unwrap(), "deprecate");
        assert_eq!(normalize("replication").unwrap(), "replicate");
        assert_eq!(normalize("uploader").unwrap(), "upload");
        assert_eq!(normalize("publish").unwrap(), "publish");
    }

    #[test]
    fn test_normalize_unknown() {
        assert_eq!(
            normalize("pint"),
            Err(PipelineError::UnknownService("pint".into()))
        );
    }

    #[test]
    fn test_neighbors() {
        assert_eq!(next_service("obs"), Some("upload"));
        assert_eq!(next_service("create"), Some("test"));
        assert_eq!(next_service("deprecate"), None);
        assert_eq!(prev_service("obs"), None);
        assert_eq!(prev_service("test"), Some("create"));
    }

    #[test]
    fn test_includes_is_monotone() {
        assert!(includes("obs", "test"));
        assert!(includes("test", "test"));
        assert!(!includes("publish", "test"));
        assert!(!includes("nonesuch", "test"));
    }
}
