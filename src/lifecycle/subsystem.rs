use async_trait::async_trait;

use crate::error::Result;

/// A long-running piece of the server the orchestrator can stop at shutdown
#[async_trait]
pub trait Subsystem: Send + Sync {
    fn name(&self) -> &str;

    /// Stop accepting work and wait for in-flight work to finish
    async fn stop(&self) -> Result<()>;

    fn is_healthy(&self) -> bool;
}
