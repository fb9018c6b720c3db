//! Render context, history and the latest question into one prompt.
//!
//! History is never truncated here. Keeping a conversation within the
//! model's context window is the caller's job.

use crate::grounding::REFUSAL_MESSAGE;
use crate::models::{ChatMessage, ScoredChunk};

const CONTEXT_HEADER: &str = "# Context Documents (DO NOT DISCARD)";

/// Build the single-turn prompt sent to the language model.
///
/// Sections, in order: system instructions, agent policy, numbered context
/// documents, conversation history as `ROLE: content` lines, the latest
/// user message, and the task line.
pub fn assemble_prompt(context: &[ScoredChunk], history: &[ChatMessage], latest: &str) -> String {
    let mut out = String::new();

    out.push_str("SYSTEM: You are an official support assistant.\n");
    out.push_str("Answer only from the information in CONTEXT.\n");
    out.push_str("If CONTEXT does not contain the answer, reply with exactly:\n");
    out.push_str(REFUSAL_MESSAGE);
    out.push_str("\n\n");

    out.push_str("AGENT POLICY:\n");
    out.push_str("- Answer in a polite, professional tone.\n");
    out.push_str("- Do not guess.\n");
    out.push_str("- Use bullet points where they help.\n\n");

    out.push_str("CONTEXT:\n");
    out.push_str(&render_context(context));
    out.push_str("\n\n");

    out.push_str("CONVERSATION HISTORY:\n");
    let lines: Vec<String> = history
        .iter()
        .map(|m| format!("{}: {}", m.role.as_upper(), m.content))
        .collect();
    out.push_str(&lines.join("\n"));
    out.push_str("\n\n");

    out.push_str("USER: ");
    out.push_str(latest);
    out.push_str("\n\n");

    out.push_str("TASK: Answer the user's question using only the information in CONTEXT above.");
    out
}

/// Numbered markdown list of context documents.
fn render_context(context: &[ScoredChunk]) -> String {
    let mut out = String::from(CONTEXT_HEADER);
    out.push_str("\n\n");
    let entries: Vec<String> = context
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. [{}]({})\n{}",
                i + 1,
                c.chunk.title,
                c.chunk.url,
                c.chunk.content
            )
        })
        .collect();
    out.push_str(&entries.join("\n\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentChunk, Role};

    fn chunk(url: &str, title: &str, content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: DocumentChunk {
                id: url.into(),
                namespace: "ns".into(),
                url: url.into(),
                title: title.into(),
                content: content.into(),
                chunk_index: 0,
                content_hash: String::new(),
            },
            score: 0.8,
            namespace: "ns".into(),
        }
    }

    #[test]
    fn test_sections_in_order() {
        let context = vec![
            chunk("https://a", "Alpha", "alpha text"),
            chunk("https://b", "Beta", "beta text"),
        ];
        let history = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi there"),
            ChatMessage::user("what is alpha?"),
        ];
        let prompt = assemble_prompt(&context, &history, "what is alpha?");

        let order = [
            "SYSTEM:",
            REFUSAL_MESSAGE,
            "AGENT POLICY:",
            "CONTEXT:",
            "1. [Alpha](https://a)\nalpha text",
            "2. [Beta](https://b)\nbeta text",
            "CONVERSATION HISTORY:",
            "USER: hello\nASSISTANT: hi there\nUSER: what is alpha?",
            "\n\nUSER: what is alpha?\n\nTASK:",
        ];
        let mut pos = 0;
        for needle in order {
            let found = prompt[pos..]
                .find(needle)
                .unwrap_or_else(|| panic!("missing or out of order: {needle}"));
            pos += found + needle.len();
        }
    }

    #[test]
    fn test_deterministic() {
        let context = vec![chunk("https://a", "A", "x")];
        let history = vec![ChatMessage::new(Role::System, "sys"), ChatMessage::user("q")];
        assert_eq!(
            assemble_prompt(&context, &history, "q"),
            assemble_prompt(&context, &history, "q")
        );
    }

    #[test]
    fn test_history_not_truncated() {
        let history: Vec<ChatMessage> = (0..200)
            .map(|i| ChatMessage::user(format!("message number {i}")))
            .collect();
        let prompt = assemble_prompt(&[], &history, "last");
        assert!(prompt.contains("USER: message number 0\n"));
        assert!(prompt.contains("USER: message number 199\n"));
    }

    #[test]
    fn test_empty_context_keeps_header() {
        let prompt = assemble_prompt(&[], &[ChatMessage::user("q")], "q");
        assert!(prompt.contains("CONTEXT:\n# Context Documents (DO NOT DISCARD)\n\n"));
    }
}
