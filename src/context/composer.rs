//! Prompt composition.
//!
//! Output depends only on the inputs: the same query, documents and history
//! always render the same prompt, byte for byte.

use std::fmt::Write as _;

use crate::history::{ConversationTurn, Role};
use crate::llm::{GenerationParameters, GenerationRequest};
use crate::rag::RetrievedDocument;

pub const RESPONSE_MARKER: &str = "### Response:";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant for a dental clinic. \
Provide clear, concise and accurate answers based only on the information available below.";

const INSTRUCTIONS: &[&str] = &[
    "Respond to the user's query based on the information provided above.",
    "If the query asks about a specific service, branch or social media platform, provide relevant details.",
    "If the query is general or unclear, politely clarify and offer to help further.",
    "If the information above does not answer the question, say so instead of guessing.",
];

#[derive(Debug, Clone)]
pub struct PromptComposer {
    system_prompt: String,
    history_window: usize,
    parameters: GenerationParameters,
}

impl PromptComposer {
    pub fn new(
        system_prompt: impl Into<String>,
        history_window: usize,
        parameters: GenerationParameters,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            history_window,
            parameters,
        }
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    pub fn parameters(&self) -> &GenerationParameters {
        &self.parameters
    }

    pub fn compose(
        &self,
        query: &str,
        retrieved: &[RetrievedDocument],
        history: &[ConversationTurn],
    ) -> GenerationRequest {
        let mut documents: Vec<&RetrievedDocument> = retrieved.iter().collect();
        documents.sort_by_key(|d| d.result.rank);

        let skip = history.len().saturating_sub(self.history_window);
        let history = &history[skip..];

        let mut prompt = String::new();
        prompt.push_str(self.system_prompt.trim());
        prompt.push_str("\n\n### Information available:\n");
        if documents.is_empty() {
            prompt.push_str("(no matching clinic information)\n");
        }
        for (i, doc) in documents.iter().enumerate() {
            match doc.document.category() {
                Some(category) => {
                    let _ = writeln!(prompt, "{}. [{}] {}", i + 1, category, doc.document.text.trim());
                }
                None => {
                    let _ = writeln!(prompt, "{}. {}", i + 1, doc.document.text.trim());
                }
            }
        }

        if !history.is_empty() {
            prompt.push_str("\n### Conversation so far:\n");
            for turn in history {
                let speaker = match turn.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                let _ = writeln!(prompt, "{}: {}", speaker, turn.text.trim());
            }
        }

        prompt.push_str("\n### Instructions:\n");
        for line in INSTRUCTIONS {
            let _ = writeln!(prompt, "- {}", line);
        }

        prompt.push_str("\n### User's question:\n");
        prompt.push_str(query.trim());
        prompt.push_str("\nNote: The answer is in the same language as the question.\n");
        prompt.push_str(RESPONSE_MARKER);

        GenerationRequest {
            prompt_text: prompt,
            parameters: self.parameters.clone(),
        }
    }
}

/// Keeps the text after the last "Response:" marker, if the model echoed
/// the prompt.
pub fn extract_answer(raw: &str) -> String {
    raw.rsplit("Response:")
        .next()
        .unwrap_or(raw)
        .trim()
        .to_string()
}
