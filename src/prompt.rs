use serde::Serialize;

use crate::record::SearchResult;

pub const SYSTEM_PROMPT: &str = "You are an expert customer support agent. Your goal is to provide a clear, \
concise, and friendly answer to the user's query based *only* on the provided context from the knowledge base. \
Do not invent new information. If the context does not contain the answer, state that you couldn't find the \
information and suggest they rephrase the question. Format your answer for readability.";

/// Reply used instead of a generation call when retrieval found nothing.
pub const NO_CONTEXT_REPLY: &str = "I couldn't find any relevant information in the knowledge base.";

/// Messages handed to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessages {
    pub system: String,
    pub user: String,
}

pub fn build_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("Query: {}\nSolution: {}", r.record.query, r.record.solution))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `None` when there is no retrieved context to ground an answer on.
pub fn build_prompt(user_query: &str, results: &[SearchResult]) -> Option<PromptMessages> {
    if results.is_empty() {
        return None;
    }
    Some(PromptMessages {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "User Query: \"{}\"\n\nContext from knowledge base:\n{}",
            user_query,
            build_context(results)
        ),
    })
}
