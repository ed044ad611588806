use parley_ai::{Content, Message, ParleyError, Role};
use tracing::{debug, info, warn};

use crate::store::ChatStore;
use crate::tool_gateway::ToolGateway;

/// Resolves a tool call left dangling at the tail of a stored chat by an
/// interrupted turn.
///
/// Reads only persisted state. Returns the repaired assistant message, or
/// `None` when there was nothing to resolve, so running it twice in a row
/// makes the second run a no-op.
pub async fn continue_chat(
    store: &dyn ChatStore,
    gateway: &ToolGateway,
    chat_id: &str,
) -> Result<Option<Message>, ParleyError> {
    let messages = store.messages(chat_id).await?;
    let Some(last) = messages.last() else {
        return Ok(None);
    };
    if last.role != Role::Assistant {
        return Ok(None);
    }

    let Some((call_id, name, arguments)) = last.pending_tool_call() else {
        if has_interior_unresolved_call(last) {
            warn!(
                chat_id,
                message_id = last.id.as_str(),
                "unresolved tool call before the tail of the message; leaving it as is"
            );
        }
        debug!(chat_id, "nothing to continue");
        return Ok(None);
    };
    let (call_id, name, arguments) = (
        call_id.to_string(),
        name.to_string(),
        arguments.to_string(),
    );

    info!(
        chat_id,
        tool_name = name.as_str(),
        call_id = call_id.as_str(),
        "resuming interrupted tool call"
    );
    let invocation = gateway.invoke(&name, &arguments).await;

    let mut message = last.clone();
    message.contents.push(Content::tool_result(
        call_id,
        invocation.result,
        !invocation.success,
    ));
    store.update_message(chat_id, message.clone()).await?;
    Ok(Some(message))
}

/// A tool call that is followed by something other than its own result.
fn has_interior_unresolved_call(message: &Message) -> bool {
    message.contents.windows(2).any(|pair| match (&pair[0], &pair[1]) {
        (Content::ToolCall { id, .. }, Content::ToolResult { call_id, .. }) => id != call_id,
        (Content::ToolCall { .. }, _) => true,
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_answered_by_their_own_result_are_resolved() {
        let mut message = Message::empty_assistant();
        message.contents = vec![
            Content::tool_call("a", "lookup", "{}"),
            Content::tool_result("a", "[]", false),
            Content::text("done"),
        ];
        assert!(!has_interior_unresolved_call(&message));

        message.contents = vec![
            Content::tool_call("a", "lookup", "{}"),
            Content::text("interrupted"),
        ];
        assert!(has_interior_unresolved_call(&message));
    }
}
