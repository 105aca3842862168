use std::collections::BTreeMap;

use crate::types::{ProviderToolCallDelta, ToolCall, ToolCallId};

#[derive(Debug, Clone, Default)]
pub struct ToolCallBuffer {
    pub id: Option<String>,
    pub name: String,
    pub arguments: String,
}

/// Reassembles index-addressed tool-call fragments from one upstream stream.
///
/// Slots are keyed by the provider's `index`. `name` and `arguments`
/// fragments are concatenated in arrival order; nothing is parsed until the
/// stream that produced them has finished.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<u32, ToolCallBuffer>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, delta: &ProviderToolCallDelta) {
        let entry = self
            .slots
            .entry(delta.index)
            .or_insert_with(|| ToolCallBuffer {
                id: delta.id.clone(),
                ..Default::default()
            });

        if entry.id.is_none() {
            entry.id = delta.id.clone();
        }

        let Some(function) = &delta.function else {
            return;
        };
        if let Some(name) = &function.name {
            entry.name.push_str(name);
        }
        if let Some(arguments) = &function.arguments {
            tracing::trace!(
                "[ACCUMULATOR] Slot {} arguments delta: {} bytes (total: {} -> {})",
                delta.index,
                arguments.len(),
                entry.arguments.len(),
                entry.arguments.len() + arguments.len()
            );
            entry.arguments.push_str(arguments);
        }
    }

    /// Finished calls ordered by index. Missing indices are compacted away.
    pub fn finish(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .map(|(index, buf)| {
                let id = match buf.id {
                    Some(id) if !id.is_empty() => id,
                    _ => {
                        let generated = ToolCallId::new().0;
                        tracing::warn!(
                            "[ACCUMULATOR] Slot {} ('{}') never received an id, using {}",
                            index,
                            buf.name,
                            generated
                        );
                        generated
                    }
                };
                ToolCall::new(id, buf.name, buf.arguments)
            })
            .collect()
    }
}
