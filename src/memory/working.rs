//! Working-memory assembly: the transient per-iteration prompt.
//!
//! Sections are collected in priority order and the tail is trimmed to the
//! token budget by dropping, oldest first, from: chat history, then tool
//! results, then notes, then injected memories. The preamble (rules +
//! directive + goals) is never dropped.

use crate::types::MemoryConfig;
use serde::Serialize;

/// Rough provider-agnostic token estimate: 4 chars ~ 1 token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// One message in the assembled context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

/// Derived per-iteration snapshot; summarized into the blob, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct WorkingContext {
    pub system_prompt: String,
    pub system_prompt_tokens: usize,
    pub messages: Vec<ContextMessage>,
    pub injected_memories: Vec<String>,
    pub total_tokens_estimate: usize,
    pub config: MemoryConfig,
}

/// Collects the context sections for one iteration.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    preamble: String,
    instruction: String,
    memories: Vec<String>,
    notes: Vec<String>,
    chat: Vec<ContextMessage>,
    results: Vec<String>,
}

impl ContextBuilder {
    pub fn new(preamble: String) -> Self {
        Self {
            preamble,
            ..Default::default()
        }
    }

    /// The final instruction message; trimmed never.
    pub fn instruction(&mut self, text: String) -> &mut Self {
        self.instruction = text;
        self
    }

    pub fn inject_memories(&mut self, memories: Vec<String>) -> &mut Self {
        self.memories = memories;
        self
    }

    /// Notes, most recent first as handed in; rendered oldest-last.
    pub fn notes(&mut self, notes: Vec<String>) -> &mut Self {
        self.notes = notes;
        self
    }

    /// Chat history in chronological order.
    pub fn chat(&mut self, chat: Vec<ContextMessage>) -> &mut Self {
        self.chat = chat;
        self
    }

    /// Recent tool-result summaries, oldest first.
    pub fn results(&mut self, results: Vec<String>) -> &mut Self {
        self.results = results;
        self
    }

    fn total_tokens(&self) -> usize {
        let mut total = estimate_tokens(&self.preamble) + estimate_tokens(&self.instruction);
        total += self.memories.iter().map(|m| estimate_tokens(m)).sum::<usize>();
        total += self.notes.iter().map(|n| estimate_tokens(n)).sum::<usize>();
        total += self
            .chat
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>();
        total += self.results.iter().map(|r| estimate_tokens(r)).sum::<usize>();
        total
    }

    /// Trim to budget and assemble the final context.
    pub fn build(mut self, config: MemoryConfig) -> WorkingContext {
        while self.total_tokens() > config.max_context_tokens {
            if !self.chat.is_empty() {
                self.chat.remove(0);
            } else if !self.results.is_empty() {
                self.results.remove(0);
            } else if !self.notes.is_empty() {
                self.notes.pop();
            } else if !self.memories.is_empty() {
                self.memories.pop();
            } else {
                break;
            }
        }

        let mut system_prompt = self.preamble.clone();
        if !self.memories.is_empty() {
            system_prompt.push_str("\n\n## Relevant memories\n");
            for memory in &self.memories {
                system_prompt.push_str(&format!("- {memory}\n"));
            }
        }
        if !self.notes.is_empty() {
            system_prompt.push_str("\n## Scratch pad (most recent first)\n");
            for note in &self.notes {
                system_prompt.push_str(&format!("- {note}\n"));
            }
        }

        let mut messages = self.chat;
        if !self.results.is_empty() {
            let mut summary = String::from("Results from the previous actions:\n");
            for (i, result) in self.results.iter().enumerate() {
                summary.push_str(&format!("{}. {}\n", i + 1, result));
            }
            messages.push(ContextMessage {
                role: "user".into(),
                content: summary,
            });
        }
        if !self.instruction.is_empty() {
            messages.push(ContextMessage {
                role: "user".into(),
                content: self.instruction,
            });
        }

        let total = estimate_tokens(&system_prompt)
            + messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum::<usize>();

        WorkingContext {
            system_prompt_tokens: estimate_tokens(&system_prompt),
            system_prompt,
            injected_memories: self.memories,
            total_tokens_estimate: total,
            messages,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ContextMessage {
        ContextMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    fn tight_config(max_tokens: usize) -> MemoryConfig {
        MemoryConfig {
            max_context_tokens: max_tokens.max(1_000),
            ..Default::default()
        }
    }

    #[test]
    fn assembles_all_sections_when_under_budget() {
        let mut builder = ContextBuilder::new("preamble".into());
        builder
            .inject_memories(vec!["memory one".into()])
            .notes(vec!["note one".into()])
            .chat(vec![msg("user", "hi"), msg("assistant", "hello")])
            .results(vec!["tool ok".into()])
            .instruction("plan now".into());
        let ctx = builder.build(MemoryConfig::default());

        assert!(ctx.system_prompt.contains("memory one"));
        assert!(ctx.system_prompt.contains("note one"));
        // chat + results summary + instruction
        assert_eq!(ctx.messages.len(), 4);
        assert_eq!(ctx.messages.last().unwrap().content, "plan now");
        assert_eq!(ctx.injected_memories, vec!["memory one".to_string()]);
    }

    #[test]
    fn trims_chat_before_anything_else() {
        let filler = "x".repeat(4_000); // ~1000 tokens each
        let mut builder = ContextBuilder::new("p".into());
        builder
            .inject_memories(vec![filler.clone()])
            .notes(vec![filler.clone()])
            .chat(vec![
                msg("user", &filler),
                msg("user", &filler),
                msg("user", "latest"),
            ])
            .results(vec![filler.clone()]);
        // Budget fits roughly three filler blocks plus small pieces.
        let ctx = builder.build(tight_config(3_200));

        // Oldest chat dropped first; the latest message survives.
        let chat_contents: Vec<&str> = ctx
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert!(chat_contents.contains(&"latest"));
        // Memories and notes survive while chat still had entries to drop.
        assert!(!ctx.injected_memories.is_empty());
        assert!(ctx.system_prompt.contains("Scratch pad"));
    }

    #[test]
    fn preamble_is_never_dropped() {
        let huge = "y".repeat(40_000);
        let builder = ContextBuilder::new(huge.clone());
        let ctx = builder.build(tight_config(1_000));
        assert_eq!(ctx.system_prompt, huge);
        assert!(ctx.total_tokens_estimate > 1_000);
    }

    #[test]
    fn token_estimate_is_quarter_of_chars() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
