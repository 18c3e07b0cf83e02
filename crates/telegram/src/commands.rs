//! Slash-command parsing. Telegram commands arrive as plain message text
//! (`/done create a person`, `/done@DossierBot create a person`); the
//! engine receives the bare name plus the argument tail.

/// Parse a command message. Returns `(name, args)` for text starting with
/// `/`; `None` otherwise.
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }

    let (head, tail) = match rest.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (rest, ""),
    };

    // Group chats address commands as /done@BotName.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    if name.is_empty() || !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return None;
    }
    Some((name, tail.to_owned()))
}
