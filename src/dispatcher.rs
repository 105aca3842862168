use futures_util::future::{join_all, Either};
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::constants::DUPLICATE_CALL_ERROR;
use crate::tools::{error_json, ToolExecutor};
use crate::types::{ToolCall, ToolResult};

/// Runs one round of tool calls against a [`ToolExecutor`].
#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn ToolExecutor> {
        &self.executor
    }

    /// Executes `calls` concurrently and returns one result per call, in
    /// input order. A call whose `name:arguments` key already appeared
    /// earlier in the round is answered with a duplicate marker instead of
    /// being executed again.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut seen = HashSet::new();
        let pending: Vec<_> = calls
            .iter()
            .map(|call| {
                if seen.insert(call.dedup_key()) {
                    Either::Left(self.execute_one(call))
                } else {
                    tracing::warn!(
                        "[🔧] Duplicate tool call {} ({}) in round, not executing",
                        call.id,
                        call.function.name
                    );
                    let result = ToolResult::new(call.id.clone(), error_json(DUPLICATE_CALL_ERROR));
                    Either::Right(futures_util::future::ready(result))
                }
            })
            .collect();
        join_all(pending).await
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolResult {
        let name = call.function.name.as_str();
        let arguments = call.function.arguments.as_str();
        tracing::info!("[⚙️  -> 🔧] Executing {} ({})", name, call.id);

        let outcome = AssertUnwindSafe(self.executor.execute(name, arguments))
            .catch_unwind()
            .await;

        let content = match outcome {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                tracing::error!("[🔧] Tool {} failed: {}", name, e);
                error_json(format!("Tool execution failed: {}", e))
            }
            Err(panic_payload) => {
                let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!("[🔧] Tool {} panicked: {}", name, message);
                error_json(format!("Tool execution failed: {}", message))
            }
        };
        ToolResult::new(call.id.clone(), content)
    }
}
