//! Token estimation and context budgeting.
//!
//! Estimates are provider-agnostic: roughly four characters per token plus a
//! small per-message overhead. The budget is `max_tokens - reserved_tokens`;
//! [`TokenBudget::fit`] trims history until the estimate fits.

use super::{ChatMessage, ContentPart, LlmError, MessageContent, Role, ToolDefinition};

/// Fixed cost charged per message for role/framing tokens.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;
/// Flat estimate for one image part.
pub const IMAGE_TOKENS: u64 = 85;

const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Estimate tokens for a string.
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate tokens for a single message.
pub fn estimate_message_tokens(message: &ChatMessage) -> u64 {
    let mut tokens = MESSAGE_OVERHEAD_TOKENS;
    if let Some(content) = &message.content {
        tokens += match content {
            MessageContent::Text(text) => estimate_text_tokens(text),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => estimate_text_tokens(text),
                    ContentPart::ImageUrl { .. } => IMAGE_TOKENS,
                })
                .sum(),
        };
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            tokens += estimate_text_tokens(&call.function.name)
                + estimate_text_tokens(&call.function.arguments);
        }
    }
    tokens
}

/// Estimate tokens for a whole conversation.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for the tool schemas sent alongside the messages.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> u64 {
    if tools.is_empty() {
        return 0;
    }
    serde_json::to_string(tools)
        .map(|json| estimate_text_tokens(&json))
        .unwrap_or_default()
}

/// Prompt-side token budget derived from generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    pub max_tokens: u64,
    pub reserved_tokens: u64,
}

impl TokenBudget {
    pub fn new(max_tokens: u64, reserved_tokens: u64) -> Self {
        Self {
            max_tokens,
            reserved_tokens,
        }
    }

    /// The same budget with `tokens` more held back, e.g. for tool schemas.
    pub fn reserving(self, tokens: u64) -> Self {
        Self::new(self.max_tokens, self.reserved_tokens.saturating_add(tokens))
    }

    /// Tokens available to the prompt.
    pub fn available(&self) -> u64 {
        self.max_tokens.saturating_sub(self.reserved_tokens)
    }

    /// Trim `messages` so the estimate fits [`available`](Self::available).
    ///
    /// System messages and the most recent turn (the last message, plus the
    /// assistant call its trailing tool results answer) are always kept. The
    /// oldest other messages are dropped first and replaced by a single
    /// notice. If that is not enough, kept messages are cut newest first,
    /// text and tool-call arguments alike, each with a visible marker. Fails
    /// with `ContextTooLarge` only when the system messages plus the markers
    /// do not fit.
    pub fn fit(&self, messages: Vec<ChatMessage>) -> Result<Vec<ChatMessage>, LlmError> {
        let limit = self.available();
        if estimate_messages_tokens(&messages) <= limit {
            return Ok(messages);
        }

        let system_tokens: u64 = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(estimate_message_tokens)
            .sum();
        if system_tokens > limit {
            return Err(LlmError::context_too_large(format!(
                "system prompt needs ~{} tokens, budget is {}",
                system_tokens, limit
            )));
        }

        let Some(last_index) = messages.len().checked_sub(1) else {
            return Ok(messages);
        };
        // The most recent turn includes the assistant message whose tool
        // results trail the conversation.
        let mut tail_start = last_index;
        while tail_start > 0 && messages[tail_start].role == Role::Tool {
            tail_start -= 1;
        }
        let mut droppable: Vec<usize> = (0..tail_start)
            .filter(|&i| messages[i].role != Role::System)
            .collect();

        // Drop oldest first, reserving room for the omission notice.
        let mut dropped = 0usize;
        let mut removed = vec![false; messages.len()];
        let mut total = estimate_messages_tokens(&messages);
        while total + notice_tokens(dropped) > limit && !droppable.is_empty() {
            let idx = droppable.remove(0);
            total -= estimate_message_tokens(&messages[idx]);
            removed[idx] = true;
            dropped += 1;
        }
        // A tool result must not outlive the assistant turn that requested it.
        while let Some(&idx) = droppable.first() {
            if messages[idx].role != Role::Tool {
                break;
            }
            droppable.remove(0);
            total -= estimate_message_tokens(&messages[idx]);
            removed[idx] = true;
            dropped += 1;
        }

        let mut fitted: Vec<ChatMessage> = Vec::with_capacity(messages.len() - dropped + 1);
        let mut notice_inserted = false;
        for (i, message) in messages.into_iter().enumerate() {
            if removed[i] {
                continue;
            }
            if dropped > 0 && !notice_inserted && message.role != Role::System {
                fitted.push(omission_notice(dropped));
                notice_inserted = true;
            }
            fitted.push(message);
        }

        let mut total = estimate_messages_tokens(&fitted);
        if total > limit {
            for message in fitted.iter_mut().rev() {
                if total <= limit {
                    break;
                }
                if message.role == Role::System {
                    continue;
                }
                total -= shrink_message(message, total - limit);
            }
            if total > limit {
                return Err(LlmError::context_too_large(format!(
                    "history needs ~{} tokens after trimming, budget is {}",
                    total, limit
                )));
            }
        }

        tracing::debug!(
            dropped,
            remaining = fitted.len(),
            estimate = estimate_messages_tokens(&fitted),
            limit,
            "Trimmed context to fit token budget"
        );
        Ok(fitted)
    }
}

fn omission_notice(dropped: usize) -> ChatMessage {
    ChatMessage::new(
        Role::User,
        format!(
            "[{} earlier message(s) omitted to fit the context window]",
            dropped
        ),
    )
}

fn notice_tokens(dropped: usize) -> u64 {
    if dropped == 0 {
        0
    } else {
        // Sized for the widest count we could print.
        estimate_message_tokens(&omission_notice(usize::MAX))
    }
}

/// Cut `text` so its estimate drops by up to `overflow` tokens, appending
/// the marker. Returns the new text and the tokens saved, or `None` when
/// cutting would not make it shorter.
fn cut_text(text: &str, overflow: u64) -> Option<(String, u64)> {
    let current = estimate_text_tokens(text);
    let marker = estimate_text_tokens(TRUNCATION_MARKER);
    let keep = current.saturating_sub(overflow + marker);
    let shortened = keep + marker;
    if shortened >= current {
        return None;
    }
    // keep * 4 chars is a whole number of tokens, so the estimate is exact.
    let mut cut: String = text.chars().take((keep * 4) as usize).collect();
    cut.push_str(TRUNCATION_MARKER);
    Some((cut, current - shortened))
}

/// Shorten `message` by up to `overflow` tokens: its text first, then its
/// tool-call arguments. Returns the tokens saved.
fn shrink_message(message: &mut ChatMessage, overflow: u64) -> u64 {
    let before = estimate_message_tokens(message);
    if let Some((text, _)) = cut_text(&message.text_content(), overflow) {
        // Images are dropped along with the cut text.
        message.content = Some(MessageContent::Text(text));
    }
    let mut saved = before.saturating_sub(estimate_message_tokens(message));

    for call in message.tool_calls.iter_mut().flatten() {
        if saved >= overflow {
            break;
        }
        if let Some((arguments, cut)) = cut_text(&call.function.arguments, overflow - saved) {
            call.function.arguments = arguments;
            saved += cut;
        }
    }
    saved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    fn msg(role: Role, chars: usize) -> ChatMessage {
        ChatMessage::new(role, "x".repeat(chars))
    }

    /// An assistant tool call with `arg_chars` of arguments and its result.
    fn tool_turn(id: &str, arg_chars: usize, result_chars: usize) -> [ChatMessage; 2] {
        let arguments = format!("{{\"content\":\"{}\"}}", "a".repeat(arg_chars));
        [
            ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCall::function(id, "write_file", arguments)],
            ),
            ChatMessage::tool_result(id, "r".repeat(result_chars), &[]),
        ]
    }

    #[test]
    fn test_estimate() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        assert_eq!(estimate_message_tokens(&msg(Role::User, 40)), 14);
    }

    #[test]
    fn test_fits_untouched() {
        let budget = TokenBudget::new(1000, 100);
        let messages = vec![msg(Role::System, 40), msg(Role::User, 40)];
        let fitted = budget.fit(messages.clone()).unwrap();
        assert_eq!(fitted, messages);
    }

    #[test]
    fn test_drops_oldest_and_keeps_latest() {
        let budget = TokenBudget::new(200, 50);
        let mut messages = vec![ChatMessage::new(Role::System, "You are helpful.")];
        for i in 0..20 {
            messages.push(ChatMessage::new(Role::User, format!("{} {}", i, "y".repeat(60))));
        }
        let last = messages.last().cloned().unwrap();

        let fitted = budget.fit(messages).unwrap();
        assert!(estimate_messages_tokens(&fitted) <= budget.available());
        assert_eq!(fitted.first().unwrap().role, Role::System);
        assert_eq!(fitted.last().unwrap(), &last);
        assert!(fitted[1].text_content().contains("omitted"));
    }

    #[test]
    fn test_never_exceeds_budget_for_many_shapes() {
        for available in [60u64, 120, 300, 900] {
            let budget = TokenBudget::new(available + 10, 10);
            for count in 1..30usize {
                let mut messages = vec![msg(Role::System, 20)];
                for i in 0..count {
                    let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                    messages.push(msg(role, (i * 37) % 400 + 1));
                }
                // Finish on a tool call whose arguments dwarf the budget.
                let mut with_tool_tail = messages.clone();
                with_tool_tail.extend(tool_turn("big", count * 300, 20));

                for shape in [messages, with_tool_tail] {
                    let fitted = budget.fit(shape).unwrap();
                    assert!(
                        estimate_messages_tokens(&fitted) <= budget.available(),
                        "available={} count={}",
                        available,
                        count
                    );
                }
            }
        }
    }

    #[test]
    fn test_large_tool_call_arguments_are_cut() {
        let budget = TokenBudget::new(4096, 2500);
        let mut messages = vec![
            ChatMessage::new(Role::System, "You write files."),
            ChatMessage::new(Role::User, "write a long file"),
        ];
        messages.extend(tool_turn("call_1", 8000, 16));

        let fitted = budget.fit(messages).unwrap();
        assert!(estimate_messages_tokens(&fitted) <= budget.available());
        let last = fitted.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.text_content(), "r".repeat(16));

        let call = &fitted[fitted.len() - 2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "write_file");
        assert!(call.function.arguments.ends_with("[truncated]"));
    }

    #[test]
    fn test_oversized_latest_is_truncated_not_dropped() {
        let budget = TokenBudget::new(100, 20);
        let messages = vec![msg(Role::System, 40), msg(Role::User, 2000)];
        let fitted = budget.fit(messages).unwrap();
        assert_eq!(fitted.len(), 2);
        assert!(fitted[1].text_content().ends_with("[truncated]"));
        assert!(estimate_messages_tokens(&fitted) <= budget.available());
    }

    #[test]
    fn test_system_prompt_too_large() {
        let budget = TokenBudget::new(100, 50);
        let err = budget
            .fit(vec![msg(Role::System, 1000), msg(Role::User, 4)])
            .unwrap_err();
        assert_eq!(err.kind, super::super::LlmErrorKind::ContextTooLarge);
    }
}
