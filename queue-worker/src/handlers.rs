use async_trait::async_trait;
use queue_core::Handler;
use serde_json::Value;
use tracing::info;

/// Illustrative handler registered by default so the worker has something
/// runnable out of the box. Real deployments register their own handlers
/// before calling `start_worker`.
pub struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn call(&self, payload: Value) -> Result<(), String> {
        info!(?payload, "log handler processed task");
        Ok(())
    }
}
