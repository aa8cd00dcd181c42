//! Outbound delivery through the macOS scripting bridge.
//!
//! Messages are sent by handing a typed AppleScript to `osascript`. Only
//! two characters need escaping in the scripting dialect (`\` and `"`);
//! multi-line text is joined with the dialect's `linefeed` constant.

use tokio::process::Command;

use crate::{ChannelError, Result};

/// Group chats in the local store carry identifiers with this prefix.
pub const GROUP_CHAT_PREFIX: &str = "chat";

/// Escape a string for embedding in an AppleScript string literal.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Build the AppleScript expression for a (possibly multi-line) text body.
fn text_expression(text: &str) -> String {
    text.split('\n')
        .map(|line| format!("\"{}\"", escape(line)))
        .collect::<Vec<_>>()
        .join(" & linefeed & ")
}

/// Build the send script. Conversation ids with the group prefix target a
/// chat by id; anything else is a direct buddy send.
pub fn build_send_script(conversation_id: &str, text: &str) -> String {
    let body = text_expression(text);
    if conversation_id.starts_with(GROUP_CHAT_PREFIX) {
        format!(
            concat!(
                "tell application \"Messages\"\n",
                "    set targetChat to a reference to chat id \"{id}\"\n",
                "    send {body} to targetChat\n",
                "end tell\n"
            ),
            id = escape(conversation_id),
            body = body,
        )
    } else {
        format!(
            concat!(
                "tell application \"Messages\"\n",
                "    set targetService to 1st account whose service type = iMessage\n",
                "    set targetBuddy to participant \"{id}\" of targetService\n",
                "    send {body} to targetBuddy\n",
                "end tell\n"
            ),
            id = escape(conversation_id),
            body = body,
        )
    }
}

/// Run a script through `osascript`. Spawn failures are transient; a
/// non-zero exit is a permanent script error carrying stderr.
pub async fn run_osascript(script: &str) -> Result<()> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .await
        .map_err(|e| ChannelError::Other(format!("failed to run osascript: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ChannelError::Store(format!("osascript failed: {}", stderr.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backslash_and_quote_are_escaped() {
        assert_eq!(escape(r#"say "hi" \o/"#), r#"say \"hi\" \\o/"#);
        assert_eq!(escape("plain text!*~_"), "plain text!*~_");
    }

    #[test]
    fn multi_line_text_joins_with_linefeed() {
        let script = build_send_script("+15550001111", "line1\nline2");
        assert!(script.contains(r#""line1" & linefeed & "line2""#));
    }

    #[test]
    fn group_prefix_selects_chat_send() {
        let script = build_send_script("chat123456789", "hi");
        assert!(script.contains("chat id \"chat123456789\""));
        assert!(!script.contains("participant"));
    }

    #[test]
    fn direct_send_targets_a_buddy() {
        let script = build_send_script("+15550001111", "hi");
        assert!(script.contains("participant \"+15550001111\""));
        assert!(!script.contains("chat id"));
    }
}
