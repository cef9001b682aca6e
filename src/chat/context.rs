// src/chat/context.rs
// Conversation context assembly and pruning

/// A message as seen by the context pruner.
#[derive(Debug, Clone)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
    pub sql_query: Option<String>,
}

impl ContextMessage {
    /// Assistant messages carrying SQL results are more valuable context
    /// than plain text and are discarded last.
    fn has_sql_results(&self) -> bool {
        if self.role != "assistant" {
            return false;
        }
        match &self.sql_query {
            Some(sql) => {
                let trimmed = sql.trim();
                !trimmed.is_empty() && trimmed != "null"
            }
            None => false,
        }
    }
}

fn estimate_tokens(messages: &[ContextMessage]) -> usize {
    messages.iter().map(|m| m.content.len()).sum::<usize>() / 4
}

/// Prune conversation context to fit within limits.
///
/// System messages are always kept. The most recent `max_messages`
/// user/assistant messages survive the count cap; if the estimated token
/// count (total chars / 4) still exceeds `max_tokens`, the oldest plain-text
/// messages go first, then the oldest SQL-bearing ones.
pub fn prune_context(
    messages: Vec<ContextMessage>,
    max_messages: usize,
    max_tokens: usize,
) -> Vec<ContextMessage> {
    if messages.is_empty() {
        return messages;
    }

    let (system_msgs, mut rest): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(|m| m.role == "system");

    if rest.len() > max_messages {
        rest.drain(..rest.len() - max_messages);
    }

    while !rest.is_empty()
        && estimate_tokens(&system_msgs) + estimate_tokens(&rest) > max_tokens
    {
        match rest.iter().position(|m| !m.has_sql_results()) {
            Some(plain_idx) => {
                rest.remove(plain_idx);
            }
            None => {
                rest.remove(0);
            }
        }
    }

    let mut result = system_msgs;
    result.extend(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ContextMessage {
        ContextMessage {
            role: role.into(),
            content: content.into(),
            sql_query: None,
        }
    }

    fn sql_msg(content: &str) -> ContextMessage {
        ContextMessage {
            role: "assistant".into(),
            content: content.into(),
            sql_query: Some("SELECT 1".into()),
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(prune_context(Vec::new(), 50, 200_000).is_empty());
    }

    #[test]
    fn test_under_limits_untouched() {
        let messages = vec![msg("user", "hi"), msg("assistant", "hello")];
        let pruned = prune_context(messages, 50, 200_000);
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_message_count_cap_keeps_most_recent() {
        let messages: Vec<_> = (0..60).map(|i| msg("user", &format!("m{i}"))).collect();
        let pruned = prune_context(messages, 50, 200_000);
        assert_eq!(pruned.len(), 50);
        assert_eq!(pruned[0].content, "m10");
        assert_eq!(pruned[49].content, "m59");
    }

    #[test]
    fn test_token_budget_drops_plain_text_before_sql() {
        // Each message is ~400 chars = ~100 tokens; budget allows two.
        let long = "x".repeat(400);
        let messages = vec![
            msg("user", &long),
            sql_msg(&long),
            msg("assistant", &long),
        ];
        let pruned = prune_context(messages, 50, 200);
        assert_eq!(pruned.len(), 2);
        assert!(pruned.iter().any(|m| m.sql_query.is_some()));
    }

    #[test]
    fn test_token_budget_falls_back_to_oldest_sql() {
        let long = "x".repeat(400);
        let messages = vec![sql_msg(&long), sql_msg(&long), sql_msg(&long)];
        let pruned = prune_context(messages, 50, 200);
        assert_eq!(pruned.len(), 2);
    }

    #[test]
    fn test_empty_sql_query_counts_as_plain() {
        let mut m = msg("assistant", "text");
        m.sql_query = Some("   ".into());
        assert!(!m.has_sql_results());
        let mut m = msg("assistant", "text");
        m.sql_query = Some("null".into());
        assert!(!m.has_sql_results());
    }

    #[test]
    fn test_user_message_never_counts_as_sql() {
        let mut m = msg("user", "text");
        m.sql_query = Some("SELECT 1".into());
        assert!(!m.has_sql_results());
    }
}
