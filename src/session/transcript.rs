use serde::{Deserialize, Serialize};

use crate::capability::Hypothesis;

/// Best-hypothesis-so-far transcript.
///
/// Holds the full text plus the ordered segments of the single best current
/// hypothesis. Updates replace the buffer wholesale; segments are never
/// accumulated across updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptBuffer {
    pub full_text: String,
    pub segments: Vec<String>,
}

impl TranscriptBuffer {
    /// Replace the whole buffer with a newer hypothesis.
    pub fn replace(&mut self, hypothesis: &Hypothesis) {
        self.full_text = hypothesis.text.clone();
        self.segments = hypothesis.segments.clone();
    }

    pub fn clear(&mut self) {
        self.full_text.clear();
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.full_text.is_empty() && self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypothesis(text: &str) -> Hypothesis {
        Hypothesis {
            text: text.to_string(),
            segments: text.split_whitespace().map(str::to_string).collect(),
            is_final: false,
        }
    }

    #[test]
    fn replace_overwrites_previous_hypothesis() {
        let mut buffer = TranscriptBuffer::default();

        buffer.replace(&hypothesis("h"));
        buffer.replace(&hypothesis("he llo"));
        buffer.replace(&hypothesis("hello world"));

        assert_eq!(buffer.full_text, "hello world");
        assert_eq!(buffer.segments, vec!["hello", "world"]);
    }

    #[test]
    fn clear_empties_text_and_segments() {
        let mut buffer = TranscriptBuffer::default();
        buffer.replace(&hypothesis("hello world"));

        buffer.clear();

        assert!(buffer.is_empty());
    }
}
