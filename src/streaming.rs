//! The upstream relay.
//!
//! One [`Relay::run`] call serves one user turn:
//!
//! ```text
//! StreamA --(no tool calls)--------------------------------------> Done
//! StreamA -> ToolsAccumulated -> Dispatching -> StreamB ---------> Done
//! any state ------------------------------------------------------> Error
//! ```
//!
//! Events reach the client strictly in the order they are produced. Exactly
//! one `[DONE]` closes a successful session. A failure before any tool ran
//! ends the session with a single `error` event and no `[DONE]`; a failure of
//! the follow-up stream is reported and still followed by `[DONE]`. A first
//! stream that ends without `[DONE]` completes normally when it carried only
//! text, and fails without dispatching when it carried tool calls.

use futures_util::StreamExt;
use std::future::Future;
use tokio::sync::mpsc;

use crate::accumulator::ToolCallAccumulator;
use crate::constants::MAX_STREAM_LINES;
use crate::dispatcher::ToolDispatcher;
use crate::framer::sse_data_lines;
use crate::logging::StreamMetric;
use crate::specs::openai::{OpenAiMessage, OpenAiRequest};
use crate::types::*;
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    StreamA,
    ToolsAccumulated,
    Dispatching,
    StreamB,
    Done,
    Error,
}

#[derive(Clone)]
pub struct Relay {
    upstream: UpstreamClient,
    dispatcher: ToolDispatcher,
}

/// State owned by a single relay run. Never shared between turns.
struct RelaySession {
    tx: mpsc::Sender<RelayEvent>,
    state: StreamState,
}

impl RelaySession {
    fn new(tx: mpsc::Sender<RelayEvent>) -> Self {
        Self {
            tx,
            state: StreamState::StreamA,
        }
    }

    fn transition(&mut self, next: StreamState) {
        tracing::debug!("[⚙️ ] Relay state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn emit(&self, event: RelayEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ObservedError::from(RelayError::Aborted))
    }

    /// Runs `fut` unless the client goes away first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.tx.closed() => Err(RelayError::Aborted.into()),
            out = fut => Ok(out),
        }
    }

    async fn fail(&mut self, error: &ObservedError) -> Result<()> {
        tracing::error!("[☁️  -> ⚙️ ] Relay failed in {:?}: {}", self.state, error.inner);
        self.transition(StreamState::Error);
        self.emit(RelayEvent::Error(error.inner.event_message())).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.emit(RelayEvent::Done).await?;
        self.transition(StreamState::Done);
        Ok(())
    }
}

fn is_aborted(error: &ObservedError) -> bool {
    matches!(error.inner, RelayError::Aborted)
}

/// History for the follow-up completion: the original turn, the assistant's
/// tool-call message, then one tool message per result.
pub fn follow_up_messages(
    history: Vec<OpenAiMessage>,
    calls: Vec<ToolCall>,
    results: &[ToolResult],
) -> Vec<OpenAiMessage> {
    let mut messages = history;
    messages.reserve(results.len() + 1);
    messages.push(OpenAiMessage::assistant_tool_calls(calls));
    messages.extend(
        results
            .iter()
            .map(|r| OpenAiMessage::tool(r.tool_call_id.clone(), r.content.clone())),
    );
    messages
}

impl Relay {
    pub fn new(upstream: UpstreamClient, dispatcher: ToolDispatcher) -> Self {
        Self {
            upstream,
            dispatcher,
        }
    }

    /// Relays one user turn into `tx` and returns the state it ended in.
    pub async fn run(&self, history: Vec<OpenAiMessage>, tx: mpsc::Sender<RelayEvent>) -> StreamState {
        let mut session = RelaySession::new(tx);
        tracing::info!("[🌐 -> ⚙️ ] Relaying turn [History: {}]", history.len());

        match self.drive(&mut session, history).await {
            Ok(()) => {}
            Err(e) if is_aborted(&e) => {
                tracing::debug!("[🌐 <- ⚙️ ] Client went away during {:?}", session.state);
                session.transition(StreamState::Error);
            }
            Err(e) => {
                tracing::error!("[⚙️ ] Relay stopped: {}", e.inner);
                session.transition(StreamState::Error);
            }
        }
        session.state
    }

    async fn drive(&self, session: &mut RelaySession, history: Vec<OpenAiMessage>) -> Result<()> {
        let tools = self.dispatcher.executor().definitions();
        let request = self.upstream.build_request(history.clone(), Some(tools));

        let mut accumulator = ToolCallAccumulator::new();
        let saw_done = match self
            .relay_stream(session, &request, Some(&mut accumulator), "A")
            .await
        {
            Ok(saw_done) => saw_done,
            Err(e) if is_aborted(&e) => return Err(e),
            Err(e) => return session.fail(&e).await,
        };

        if accumulator.is_empty() {
            return session.finish().await;
        }
        // Arguments of a cut-off stream may be incomplete; never run them.
        if !saw_done {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Dropping {} tool call(s) from a stream cut off before [DONE]",
                accumulator.len()
            );
            return session.fail(&RelayError::IncompleteStream.into()).await;
        }

        session.transition(StreamState::ToolsAccumulated);
        let calls = accumulator.finish();
        tracing::info!(
            "[☁️  -> ⚙️ ] {} tool call(s) requested: {}",
            calls.len(),
            calls
                .iter()
                .map(|c| c.function.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        session.emit(RelayEvent::ToolCalls(calls.clone())).await?;

        session.transition(StreamState::Dispatching);
        let results = session.guard(self.dispatcher.dispatch(&calls)).await?;
        session.emit(RelayEvent::ToolResults(results.clone())).await?;

        session.transition(StreamState::StreamB);
        let request = self
            .upstream
            .build_request(follow_up_messages(history, calls, &results), None);
        if let Err(e) = self.relay_stream(session, &request, None, "B").await {
            if is_aborted(&e) {
                return Err(e);
            }
            session.fail(&e).await?;
        }
        session.finish().await
    }

    /// Streams one completion, forwarding content deltas as they arrive.
    /// Tool-call deltas go into `accumulator` when one is given and are
    /// dropped otherwise. Returns once the upstream `[DONE]` or the end of the
    /// body is reached, telling which of the two it was.
    async fn relay_stream(
        &self,
        session: &RelaySession,
        request: &OpenAiRequest,
        mut accumulator: Option<&mut ToolCallAccumulator>,
        phase: &'static str,
    ) -> Result<bool> {
        let response = session.guard(self.upstream.open_stream(request)).await??;
        let mut lines = sse_data_lines(response.bytes_stream());
        let mut metrics = StreamMetric::new(phase);
        let mut saw_done = false;

        while let Some(line) = session.guard(lines.next()).await? {
            let data = line?;
            metrics.lines += 1;
            if metrics.lines > MAX_STREAM_LINES {
                tracing::error!(
                    "[☁️  -> ⚙️ ] Stream {} exceeded max line limit ({})",
                    phase,
                    MAX_STREAM_LINES
                );
                return Err(RelayError::Internal(
                    "Stream exceeded max line limit".to_string(),
                    tracing_error::SpanTrace::capture(),
                )
                .into());
            }

            let pulse = match parse_provider_line(&data) {
                LineEvent::Done => {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream {} end marker [DONE] received", phase);
                    saw_done = true;
                    break;
                }
                LineEvent::Unknown(_) => {
                    metrics.record_malformed();
                    continue;
                }
                LineEvent::Pulse(pulse) => pulse,
            };
            metrics.record_chunk(&pulse);

            let Some(delta) = pulse.delta() else {
                continue;
            };
            if let Some(tool_deltas) = &delta.tool_calls {
                match accumulator.as_deref_mut() {
                    Some(acc) => tool_deltas.iter().for_each(|d| acc.push(d)),
                    None => tracing::debug!(
                        "[☁️  -> ⚙️ ] Ignoring {} tool-call delta(s) in stream {}",
                        tool_deltas.len(),
                        phase
                    ),
                }
            }
            if let Some(content) = &delta.content {
                if !content.is_empty() {
                    session.emit(RelayEvent::Content(content.clone())).await?;
                }
            }
        }

        if !saw_done {
            tracing::warn!("[☁️  -> ⚙️ ] Stream {} ended without [DONE]", phase);
        }
        metrics.log_summary();
        Ok(saw_done)
    }
}
