//! topic-worker: reference worker that answers course outline requests.
//!
//! Speaks the procbridge line protocol on stdin/stdout; logs go to stderr.

use std::process;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use procbridge::outline::outline;
use procbridge::{RequestHandler, RequestMessage, TopicRequest, logging, run_worker};

struct CourseOutliner;

#[async_trait]
impl RequestHandler for CourseOutliner {
    async fn handle(&self, request: RequestMessage) -> Result<Value, String> {
        let topic: TopicRequest = request
            .payload()
            .map_err(|e| format!("invalid request: {e}"))?;
        tracing::debug!(request_id = %request.id, main_topic = %topic.main_topic, "Building outline");
        outline(&topic)
    }
}

#[tokio::main]
async fn main() {
    logging::init_tracing();
    tracing::info!(pid = process::id(), "topic-worker started");

    if let Err(e) = run_worker(Arc::new(CourseOutliner)).await {
        tracing::error!(error = %e, "topic-worker failed");
        process::exit(1);
    }
}
