//! Context compaction for conversation history.
//!
//! Older messages are folded into one summary message once the prompt grows
//! past a token budget or the history grows past `max_history`. These are
//! pure functions over `&[Message]`; the agent loop obtains the summary from
//! the provider and applies it through the session manager.

use std::ops::Range;

use crate::session::{estimate_tokens, Message, Role};

/// Tool results longer than this are truncated inside the summary request.
const MAX_TOOL_RESULT_CHARS: usize = 1000;

const SUMMARY_INSTRUCTIONS: &str = "Summarize the following conversation fragment concisely. \
Preserve all key facts, decisions, tool results, and context the assistant will need \
to continue the conversation. Output only the summary, no preamble.";

/// Returns true when `tokens` reaches `threshold` of `context_window`.
///
/// # Examples
/// ```
/// use picoclaw::agent::compaction::needs_compaction;
///
/// assert!(needs_compaction(900, 1000, 0.8));
/// assert!(!needs_compaction(100, 1000, 0.8));
/// ```
pub fn needs_compaction(tokens: usize, context_window: usize, threshold: f64) -> bool {
    context_window > 0 && tokens as f64 >= context_window as f64 * threshold
}

/// Decide whether a working list of messages should be compacted.
///
/// Fires on the token estimate or on the stored history length.
pub fn should_compact(
    working: &[Message],
    history_len: usize,
    context_window: usize,
    threshold: f64,
    max_history: usize,
) -> bool {
    needs_compaction(estimate_tokens(working), context_window, threshold)
        || (max_history > 0 && history_len > max_history)
}

/// Select the span of `history` to fold into a summary.
///
/// Leading summaries are never re-summarized and the last `keep_recent`
/// messages are kept verbatim. The end of the span moves earlier until it
/// does not fall between an assistant tool-call message and its results.
/// Returns `None` when fewer than two messages would be folded.
///
/// # Examples
/// ```
/// use picoclaw::agent::compaction::plan_compaction;
/// use picoclaw::session::Message;
///
/// let history: Vec<Message> = (0..10).map(|i| Message::user(&i.to_string())).collect();
/// assert_eq!(plan_compaction(&history, 4), Some(0..6));
/// assert_eq!(plan_compaction(&history, 10), None);
/// ```
pub fn plan_compaction(history: &[Message], keep_recent: usize) -> Option<Range<usize>> {
    if keep_recent >= history.len() {
        return None;
    }
    let start = history.iter().take_while(|m| m.is_summary()).count();
    let mut end = history.len() - keep_recent;

    while end > start && end < history.len() && history[end].is_tool_result() {
        end -= 1;
    }

    if end <= start || end - start < 2 {
        return None;
    }
    Some(start..end)
}

/// Build the request sent to the provider to summarize `span`.
pub fn build_summary_request(span: &[Message]) -> Vec<Message> {
    let transcript = span
        .iter()
        .map(render_for_summary)
        .collect::<Vec<_>>()
        .join("\n");

    vec![
        Message::system(SUMMARY_INSTRUCTIONS),
        Message::user(&transcript),
    ]
}

fn render_for_summary(msg: &Message) -> String {
    match msg.role {
        Role::Tool => {
            let id = msg.tool_call_id.as_deref().unwrap_or("tool");
            format!("[tool:{}] {}", id, truncate_chars(&msg.content, MAX_TOOL_RESULT_CHARS))
        }
        Role::Assistant if msg.has_tool_calls() => {
            let names = msg
                .tool_calls
                .iter()
                .flatten()
                .map(|tc| tc.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("[assistant -> tool_calls: {}] {}", names, msg.content)
        }
        role => format!("[{}] {}", role, msg.content),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, ToolCall};

    fn users(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(&format!("m{}", i))).collect()
    }

    #[test]
    fn test_needs_compaction_threshold() {
        assert!(needs_compaction(800, 1000, 0.8));
        assert!(!needs_compaction(799, 1000, 0.8));
        assert!(!needs_compaction(10, 0, 0.8));
    }

    #[test]
    fn test_should_compact_on_history_length() {
        let msgs = users(3);
        assert!(should_compact(&msgs, 11, 1_000_000, 0.8, 10));
        assert!(!should_compact(&msgs, 10, 1_000_000, 0.8, 10));
        assert!(!should_compact(&msgs, 500, 1_000_000, 0.8, 0));
    }

    #[test]
    fn test_twenty_messages_keep_five_folds_fifteen() {
        let mut session = Session::new("k");
        for m in users(20) {
            session.add_message(m);
        }
        let span = plan_compaction(&session.messages, 5).unwrap();
        assert_eq!(span, 0..15);

        assert!(session.compact_span(span.start, span.end, "summary"));
        assert_eq!(session.message_count(), 6);
        assert!(session.messages[0].is_summary());
        assert_eq!(session.messages[1].content, "m15");
        assert_eq!(session.logical_count(), 20);
        assert_eq!(session.consolidated_count, 15);
    }

    #[test]
    fn test_boundary_never_splits_tool_pair() {
        let mut history = users(4);
        history.push(Message::assistant_with_tools(
            "",
            vec![
                ToolCall::new("a", "echo", "{}"),
                ToolCall::new("b", "echo", "{}"),
            ],
        ));
        history.push(Message::tool_result("a", "1"));
        history.push(Message::tool_result("b", "2"));
        history.push(Message::assistant("done"));

        // A tail of 2 would start at the second tool result.
        let span = plan_compaction(&history, 2).unwrap();
        assert_eq!(span, 0..4);
        assert!(!history[span.end].is_tool_result());
        assert!(history[span.end].has_tool_calls());
    }

    #[test]
    fn test_leading_summary_not_resummarized() {
        let mut history = vec![Message::summary("old", 10)];
        history.extend(users(6));
        let span = plan_compaction(&history, 2).unwrap();
        assert_eq!(span, 1..5);
    }

    #[test]
    fn test_noop_cases() {
        assert_eq!(plan_compaction(&users(3), 3), None);
        assert_eq!(plan_compaction(&users(3), 10), None);
        // Only one message would be folded.
        assert_eq!(plan_compaction(&users(3), 2), None);
        let mut history = vec![Message::summary("s", 3)];
        history.extend(users(2));
        assert_eq!(plan_compaction(&history, 1), None);
    }

    #[test]
    fn test_summary_request_truncates_tool_results() {
        let long = "x".repeat(MAX_TOOL_RESULT_CHARS + 50);
        let span = vec![
            Message::user("find it"),
            Message::assistant_with_tools("", vec![ToolCall::new("c1", "read_file", "{}")]),
            Message::tool_result("c1", &long),
        ];
        let request = build_summary_request(&span);
        assert_eq!(request.len(), 2);
        assert_eq!(request[0].role, Role::System);
        let body = &request[1].content;
        assert!(body.contains("[user] find it"));
        assert!(body.contains("tool_calls: read_file"));
        assert!(body.contains("...[truncated]"));
        assert!(body.len() < long.len());
    }
}
