use async_trait::async_trait;
use serde_json::{Map, Value};

use super::context::HandlerContext;
use super::traits::StageHandler;
use crate::messages::JobStatus;

/// Handler for clouds that need no work at a given stage.
///
/// Reports success immediately so the listener message passes through
/// unchanged. An EC2 upload step is the canonical user: EC2 image creation
/// performs upload and create in one stage, so upload opts out.
#[derive(Debug, Default)]
pub struct NoOpHandler {
    status_msg: Map<String, Value>,
}

impl NoOpHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StageHandler for NoOpHandler {
    async fn run_job(&mut self, ctx: &HandlerContext) {
        ctx.info("no-op job, forwarding unchanged");
    }

    fn status(&self) -> JobStatus {
        JobStatus::Success
    }

    fn status_msg(&self) -> &Map<String, Value> {
        &self.status_msg
    }

    fn error_msgs(&self) -> &[String] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::JobDocument;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_reports_success() {
        let doc: JobDocument =
            serde_json::from_value(json!({"id": "1", "cloud": "ec2"})).unwrap();
        let ctx = HandlerContext::new(&doc, Map::new(), None);

        let mut handler = NoOpHandler::new();
        handler.run_job(&ctx).await;

        assert_eq!(handler.status(), JobStatus::Success);
        assert!(handler.status_msg().is_empty());
        assert!(handler.error_msgs().is_empty());
    }
}
