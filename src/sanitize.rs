use crate::error::JamError;

pub const MAX_NICKNAME_CHARS: usize = 24;

/// Cleans a user-supplied nickname into the form used both for display and,
/// lowercased, as the guest subject id. Allowed characters are alphanumerics
/// plus space, dot, dash and underscore; everything else is dropped.
pub fn nickname(raw: &str) -> Result<String, JamError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_'))
        .collect();
    let collapsed = collapse_whitespace(cleaned.trim());

    if collapsed.is_empty() {
        return Err(JamError::Validation("Nickname is empty".into()));
    }
    if collapsed.chars().count() > MAX_NICKNAME_CHARS {
        return Err(JamError::Validation(format!(
            "Nickname longer than {} characters",
            MAX_NICKNAME_CHARS
        )));
    }

    Ok(collapsed)
}

/// Subject identifier derived from a nickname: sanitized and lowercased so
/// "Alice" and "alice" are the same player.
pub fn subject_id(raw: &str) -> Result<String, JamError> {
    Ok(nickname(raw)?.to_lowercase())
}

/// Cleans a chat message body: control characters become spaces, whitespace
/// runs collapse, and the result must be non-empty and within `max_chars`.
pub fn message(raw: &str, max_chars: usize) -> Result<String, JamError> {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = collapse_whitespace(cleaned.trim());

    if collapsed.is_empty() {
        return Err(JamError::Validation("Message is empty".into()));
    }
    if collapsed.chars().count() > max_chars {
        return Err(JamError::Validation(format!(
            "Message longer than {} characters",
            max_chars
        )));
    }

    Ok(collapsed)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
