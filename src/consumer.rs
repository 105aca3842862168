//! Client side of the relay: a conversation store and the consumer that
//! folds relay events into it.

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::framer::sse_data_lines;
use crate::specs::openai::OpenAiMessage;
use crate::str_utils::prefix_chars;
use crate::types::*;

pub const DEFAULT_CONVERSATION_TITLE: &str = "新对话";
const TITLE_MAX_CHARS: usize = 30;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            role,
            content: content.into(),
            created_at: now_ms(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, "")
    }

    pub fn tool_result(result: &ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.tool_call_id.clone()),
            ..Self::new(Role::Tool, result.content.clone())
        }
    }

    /// The message as the relay expects it in a chat request.
    pub fn to_wire(&self) -> OpenAiMessage {
        match self.role {
            Role::System => OpenAiMessage::System {
                content: self.content.clone(),
            },
            Role::User => OpenAiMessage::user(self.content.clone()),
            Role::Assistant => OpenAiMessage::Assistant {
                content: Some(self.content.clone()),
                tool_calls: self.tool_calls.clone().unwrap_or_default(),
            },
            Role::Tool => OpenAiMessage::tool(
                self.tool_call_id.clone().unwrap_or_default(),
                self.content.clone(),
            ),
        }
    }
}

pub fn to_wire_history(messages: &[Message]) -> Vec<OpenAiMessage> {
    messages.iter().map(Message::to_wire).collect()
}

/// Partial update merged into an existing message. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl MessageUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Default::default()
        }
    }

    fn apply_to(self, message: &mut Message) {
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(tool_calls) = self.tool_calls {
            message.tool_calls = Some(tool_calls);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    fn new() -> Self {
        let now = now_ms();
        Self {
            id: generate_id(),
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

pub trait ConversationStore: Send + Sync {
    fn add_message(&self, conversation_id: &str, message: Message) -> Result<()>;

    fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<()>;

    fn messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
}

fn unknown_conversation(id: &str) -> ObservedError {
    RelayError::Internal(
        format!("Unknown conversation: {}", id),
        tracing_error::SpanTrace::capture(),
    )
    .into()
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Newest first.
    conversations: Vec<Conversation>,
    current: Option<String>,
}

impl StoreInner {
    fn find_mut(&mut self, id: &str) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| unknown_conversation(id))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Creates an empty conversation, makes it current and returns its id.
    pub fn create_conversation(&self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        let mut inner = self.write();
        inner.conversations.insert(0, conversation);
        inner.current = Some(id.clone());
        tracing::debug!("[STORE] Created conversation {}", id);
        id
    }

    /// Returns false when no conversation has that id.
    pub fn select_conversation(&self, id: &str) -> bool {
        let mut inner = self.write();
        if inner.conversations.iter().any(|c| c.id == id) {
            inner.current = Some(id.to_string());
            true
        } else {
            false
        }
    }

    /// Deleting the current conversation moves the selection to the newest
    /// remaining one.
    pub fn delete_conversation(&self, id: &str) {
        let mut inner = self.write();
        inner.conversations.retain(|c| c.id != id);
        if inner.current.as_deref() == Some(id) {
            inner.current = inner.conversations.first().map(|c| c.id.clone());
        }
    }

    pub fn clear_conversations(&self) {
        let mut inner = self.write();
        inner.conversations.clear();
        inner.current = None;
    }

    pub fn current_conversation(&self) -> Option<Conversation> {
        let inner = self.read();
        let id = inner.current.as_deref()?;
        inner.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.read().conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.read().conversations.clone()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn add_message(&self, conversation_id: &str, message: Message) -> Result<()> {
        let mut inner = self.write();
        let conversation = inner.find_mut(conversation_id)?;
        if conversation.messages.is_empty()
            && message.role == Role::User
            && !message.content.is_empty()
        {
            conversation.title = prefix_chars(&message.content, TITLE_MAX_CHARS).to_string();
        }
        conversation.messages.push(message);
        conversation.updated_at = now_ms();
        Ok(())
    }

    fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<()> {
        let mut inner = self.write();
        let conversation = inner.find_mut(conversation_id)?;
        if let Some(message) = conversation.messages.iter_mut().find(|m| m.id == message_id) {
            update.apply_to(message);
        } else {
            tracing::warn!("[STORE] No message {} in {}", message_id, conversation_id);
        }
        conversation.updated_at = now_ms();
        Ok(())
    }

    fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.read()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| unknown_conversation(conversation_id))
    }
}

/// What one turn left behind once its stream ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub assistant_message_id: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub cancelled: bool,
}

/// Folds the relay's events for one turn into a conversation.
pub struct StreamConsumer<'a, S: ConversationStore + ?Sized> {
    store: &'a S,
    conversation_id: String,
    assistant_message_id: String,
    content: String,
    tool_calls: Vec<ToolCall>,
    error: Option<String>,
    loading: bool,
    cancelled: bool,
}

impl<'a, S: ConversationStore + ?Sized> StreamConsumer<'a, S> {
    /// `assistant_message_id` names the placeholder already in the store.
    pub fn new(
        store: &'a S,
        conversation_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            assistant_message_id: assistant_message_id.into(),
            content: String::new(),
            tool_calls: Vec::new(),
            error: None,
            loading: true,
            cancelled: false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Records an error that did not arrive as a relay event.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("[🌐 CLIENT] Turn failed: {}", message);
        self.error = Some(message);
        self.loading = false;
    }

    pub fn apply(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Content(delta) => {
                if delta.is_empty() {
                    return Ok(());
                }
                self.content.push_str(&delta);
                self.store.update_message(
                    &self.conversation_id,
                    &self.assistant_message_id,
                    MessageUpdate::content(self.content.clone()),
                )?;
            }
            RelayEvent::ToolCalls(calls) => {
                self.tool_calls = calls;
                self.store.update_message(
                    &self.conversation_id,
                    &self.assistant_message_id,
                    MessageUpdate::tool_calls(self.tool_calls.clone()),
                )?;
            }
            RelayEvent::ToolResults(results) => {
                for result in &results {
                    self.store
                        .add_message(&self.conversation_id, Message::tool_result(result))?;
                }
            }
            RelayEvent::Error(message) => {
                tracing::warn!("[🌐 CLIENT] Relay reported error: {}", message);
                self.error = Some(message);
            }
            RelayEvent::Done => {
                self.loading = false;
            }
        }
        Ok(())
    }

    /// Reads a relay SSE body to its end. Lines that are not relay events
    /// are ignored. Cancellation stops reading without recording an error.
    pub async fn consume<St, E>(&mut self, body: St, cancel: &CancellationToken) -> Result<()>
    where
        St: Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut lines = sse_data_lines(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("[🌐 CLIENT] Stream cancelled");
                    self.cancelled = true;
                    self.loading = false;
                    return Ok(());
                }
                line = lines.next() => line,
            };
            let Some(line) = next else {
                break;
            };
            match line {
                Ok(data) => match RelayEvent::from_data(&data) {
                    Some(event) => self.apply(event)?,
                    None => tracing::debug!("[🌐 CLIENT] Ignoring unparseable line: {}", data),
                },
                Err(e) => {
                    self.fail(RelayError::from(e).event_message());
                    break;
                }
            }
        }
        self.loading = false;
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.loading = false;
    }

    pub fn into_outcome(self) -> TurnOutcome {
        TurnOutcome {
            assistant_message_id: self.assistant_message_id,
            content: self.content,
            tool_calls: self.tool_calls,
            error: self.error,
            cancelled: self.cancelled,
        }
    }
}
