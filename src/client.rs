use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::consumer::{to_wire_history, ConversationStore, Message, StreamConsumer};
use crate::specs::openai::OpenAiMessage;
use crate::types::{RelayError, Result};

pub use crate::consumer::TurnOutcome;

#[derive(Serialize)]
struct ChatBody {
    messages: Vec<OpenAiMessage>,
}

/// Talks to a relay's `/api/chat` endpoint on behalf of a conversation.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Sends `text` as the next user turn and streams the reply into `store`.
    ///
    /// Relay and transport failures end up in [`TurnOutcome::error`]; only
    /// store errors are returned as `Err`.
    pub async fn send_turn<S: ConversationStore + ?Sized>(
        &self,
        store: &S,
        conversation_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        store.add_message(conversation_id, Message::user(text))?;
        let placeholder = Message::assistant_placeholder();
        let assistant_id = placeholder.id.clone();
        store.add_message(conversation_id, placeholder)?;

        let history: Vec<Message> = store
            .messages(conversation_id)?
            .into_iter()
            .filter(|m| m.id != assistant_id)
            .collect();
        let body = ChatBody {
            messages: to_wire_history(&history),
        };

        let mut consumer = StreamConsumer::new(store, conversation_id, assistant_id);
        tracing::info!(
            "[🌐 CLIENT -> ⚙️ ] POST {} [History: {}]",
            self.chat_url(),
            body.messages.len()
        );

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.http.post(self.chat_url()).json(&body).send() => Some(r),
        };
        let response = match sent {
            None => {
                consumer.cancel();
                return Ok(consumer.into_outcome());
            }
            Some(Err(e)) => {
                consumer.fail(RelayError::Network(e).event_message());
                return Ok(consumer.into_outcome());
            }
            Some(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<serde_json::Value>().await {
                Ok(v) => v
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("API request failed ({})", status.as_u16())),
                Err(_) => format!("API request failed ({})", status.as_u16()),
            };
            consumer.fail(message);
            return Ok(consumer.into_outcome());
        }

        consumer.consume(response.bytes_stream(), cancel).await?;
        Ok(consumer.into_outcome())
    }
}
