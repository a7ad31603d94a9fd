//! Chat payloads.
//!
//! Chat travels inside `Message` frames. An empty payload is not an empty
//! line: it asks the relay to generate text for the sender's linked identity.

/// Maximum relayed message length in characters.
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// Ticks a chat line stays above an entity before the label reverts to its
/// name (three seconds at 60 Hz).
pub const MESSAGE_TTL_TICKS: u32 = 180;

/// Body of a `Message` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatBody {
    /// Literal text to relay.
    Text(String),
    /// Empty payload: the relay should generate a line for the sender.
    Generate,
}

impl ChatBody {
    /// Builds a body from user input; blank input becomes [`ChatBody::Generate`].
    pub fn from_input(input: &str) -> Self {
        if input.is_empty() {
            ChatBody::Generate
        } else {
            ChatBody::Text(input.to_string())
        }
    }

    /// Text carried on the wire; `Generate` and empty text both encode empty.
    pub fn wire_text(&self) -> &str {
        match self {
            ChatBody::Text(text) => text,
            ChatBody::Generate => "",
        }
    }
}

/// Truncates `text` to [`MAX_MESSAGE_LENGTH`] characters.
pub fn truncate_message(text: &str) -> String {
    match text.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_requests_generation() {
        assert_eq!(ChatBody::from_input(""), ChatBody::Generate);
        assert_eq!(ChatBody::from_input("hi"), ChatBody::Text("hi".into()));
        assert_eq!(ChatBody::Generate.wire_text(), "");
    }

    #[test]
    fn truncation_counts_characters() {
        let long: String = "é".repeat(MAX_MESSAGE_LENGTH + 10);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), MAX_MESSAGE_LENGTH);
        assert_eq!(truncate_message("short"), "short");
    }
}
