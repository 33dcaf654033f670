//! Static fallback responses for when the generation backend fails.
//!
//! The companion must never go silent because a model endpoint is down; a
//! short reassurance phrase keeps the conversation alive while the backend
//! recovers. Phrases rotate round-robin so repeated failures do not repeat
//! the same line.

/// Model name reported on fallback responses.
pub const FALLBACK_MODEL: &str = "static_fallback";

/// Rotation of short reassurance phrases.
pub const FALLBACK_RESPONSES: [&str; 5] = [
    "I'm here with you.",
    "I'm listening.",
    "Tell me more about that.",
    "I understand.",
    "That sounds important.",
];

/// Round-robin picker over the static phrase pool.
#[derive(Debug, Default)]
pub struct FallbackResponder {
    index: usize,
}

impl FallbackResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next phrase in rotation.
    pub fn next_phrase(&mut self) -> &'static str {
        let phrase = FALLBACK_RESPONSES[self.index];
        self.index = (self.index + 1) % FALLBACK_RESPONSES.len();
        phrase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrases_rotate_round_robin() {
        let mut responder = FallbackResponder::new();
        let first: Vec<_> = (0..FALLBACK_RESPONSES.len())
            .map(|_| responder.next_phrase())
            .collect();
        assert_eq!(first, FALLBACK_RESPONSES);
        // Wraps back to the start.
        assert_eq!(responder.next_phrase(), FALLBACK_RESPONSES[0]);
    }

    #[test]
    fn every_phrase_is_a_complete_short_sentence() {
        for phrase in FALLBACK_RESPONSES {
            assert!(phrase.ends_with('.'));
            assert!(phrase.len() < 40);
        }
    }
}
