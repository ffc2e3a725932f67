//! Tool execution engine
//!
//! Runs one round of tool calls. Every call yields exactly one result, in
//! the order the model asked for them; a failing call never takes its
//! siblings down with it.

use crate::error::OrchestrationError;
use crate::models::{ToolCall, ToolResult};
use crate::tools::ToolRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives start/end notifications for UI indicators
pub trait ToolObserver: Send + Sync {
    fn on_tool_start(&self, name: &str);
    fn on_tool_end(&self, name: &str);
}

/// Observer that ignores everything
pub struct NoopObserver;

impl ToolObserver for NoopObserver {
    fn on_tool_start(&self, _name: &str) {}
    fn on_tool_end(&self, _name: &str) {}
}

/// Executes tool batches against a registry
#[derive(Clone)]
pub struct ToolExecutor {
    tool_registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(tool_registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            tool_registry,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.tool_registry
    }

    /// Execute all calls concurrently and return results in request order.
    ///
    /// Calls still running when `token` is cancelled come back as `Aborted`.
    pub async fn execute_all(
        &self,
        calls: &[ToolCall],
        observer: &dyn ToolObserver,
        token: &CancellationToken,
    ) -> Vec<ToolResult> {
        debug!(call_count = calls.len(), "Starting tool batch");

        let futures = calls
            .iter()
            .map(|call| self.execute_one(call, observer, token));
        let results = futures::future::join_all(futures).await;

        debug!(
            result_count = results.len(),
            failed = results.iter().filter(|r| r.is_error()).count(),
            "Tool batch completed"
        );

        results
    }

    async fn execute_one(
        &self,
        call: &ToolCall,
        observer: &dyn ToolObserver,
        token: &CancellationToken,
    ) -> ToolResult {
        if token.is_cancelled() {
            return ToolResult::aborted(call);
        }

        observer.on_tool_start(&call.name);
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!(tool_name = %call.name, call_id = %call.call_id, "Tool call aborted");
                ToolResult::aborted(call)
            }
            result = self.run_with_timeout(call) => result,
        };

        debug!(
            tool_name = %call.name,
            call_id = %call.call_id,
            failed = result.is_error(),
            execution_time_ms = start.elapsed().as_millis() as u64,
            "Tool call finished"
        );
        observer.on_tool_end(&call.name);

        result
    }

    async fn run_with_timeout(&self, call: &ToolCall) -> ToolResult {
        let tool = match self.tool_registry.resolve(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool_name = %call.name, "Tool not registered");
                return ToolResult::failure(call, e.to_string());
            }
        };

        match tokio::time::timeout(self.timeout, tool.execute(&call.args)).await {
            Ok(Ok(data)) => ToolResult::success(call, data),
            Ok(Err(e)) => {
                warn!(tool_name = %call.name, error = %e, "Tool execution failed");
                ToolResult::failure(call, e.to_string())
            }
            Err(_) => {
                let e = OrchestrationError::ToolTimeout {
                    name: call.name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(tool_name = %call.name, "Tool execution timed out");
                ToolResult::failure(call, e.to_string())
            }
        }
    }
}
