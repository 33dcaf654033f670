//! Sentence-boundary splitting for streamed token deltas.
//!
//! Token text accumulates in a rolling buffer; a boundary is a sentence
//! terminator (`.`, `!`, `?`) immediately followed by whitespace. Completed
//! sentences are handed out as they appear so synthesis can start before
//! generation finishes. Abbreviations and decimals are not special-cased:
//! "Dr. Smith" splits after "Dr." — a known trade-off for latency.

/// Incremental splitter over streaming text deltas.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return any sentences completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut completed = Vec::new();
        while let Some((sentence_end, rest_start)) = find_boundary(&self.buffer) {
            let sentence = self.buffer[..sentence_end].trim().to_owned();
            if !sentence.is_empty() {
                completed.push(sentence);
            }
            self.buffer = self.buffer[rest_start..].to_owned();
        }
        completed
    }

    /// Flush the trailing fragment at end of stream, if any.
    pub fn finish(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buffer);
        let trimmed = remaining.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }

    /// Current unterminated fragment.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}

/// Find the first sentence boundary: a terminator followed by whitespace.
///
/// Returns `(sentence_end, rest_start)` byte offsets — the sentence is
/// `text[..sentence_end]` (terminator included) and the whitespace run is
/// consumed, so the remainder starts at `rest_start`.
fn find_boundary(text: &str) -> Option<(usize, usize)> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let after = i + c.len_utf8();
            let ws_len: usize = text[after..]
                .chars()
                .take_while(|ch| ch.is_whitespace())
                .map(char::len_utf8)
                .sum();
            if ws_len > 0 {
                return Some((after, after + ws_len));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_terminated_sentences_and_keeps_fragment() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("Hi. How are you? I'm fine");
        assert_eq!(sentences, vec!["Hi.", "How are you?"]);
        assert_eq!(splitter.buffer(), "I'm fine");
    }

    #[test]
    fn trailing_punctuation_completes_with_whitespace() {
        let mut splitter = SentenceSplitter::new();
        splitter.push("Hi. How are you? I'm fine");
        assert!(splitter.push(".").is_empty());
        let sentences = splitter.push(" ");
        assert_eq!(sentences, vec!["I'm fine."]);
        assert_eq!(splitter.buffer(), "");
    }

    #[test]
    fn accumulates_across_small_deltas() {
        let mut splitter = SentenceSplitter::new();
        let mut sentences = Vec::new();
        for delta in ["Hel", "lo the", "re", ". ", "Bye", "! ", "ok"] {
            sentences.extend(splitter.push(delta));
        }
        assert_eq!(sentences, vec!["Hello there.", "Bye!"]);
        assert_eq!(splitter.finish().as_deref(), Some("ok"));
    }

    #[test]
    fn decimal_point_does_not_split_without_whitespace() {
        let mut splitter = SentenceSplitter::new();
        assert!(splitter.push("Pi is 3.14 roughly").is_empty());
        assert_eq!(splitter.buffer(), "Pi is 3.14 roughly");
    }

    #[test]
    fn abbreviation_splits_prematurely_by_design_of_the_boundary() {
        // Known limitation: any terminator + whitespace is a boundary.
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("Dr. Smith is here. ");
        assert_eq!(sentences, vec!["Dr.", "Smith is here."]);
    }

    #[test]
    fn multiple_whitespace_is_consumed() {
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("One.   Two!\n\nThree");
        assert_eq!(sentences, vec!["One.", "Two!"]);
        assert_eq!(splitter.buffer(), "Three");
    }

    #[test]
    fn finish_returns_none_for_whitespace_only_buffer() {
        let mut splitter = SentenceSplitter::new();
        splitter.push("Done. ");
        assert!(splitter.finish().is_none());

        let mut splitter = SentenceSplitter::new();
        splitter.push("   ");
        assert!(splitter.finish().is_none());
    }

    #[test]
    fn finish_trims_the_fragment() {
        let mut splitter = SentenceSplitter::new();
        splitter.push("Okay then ");
        assert_eq!(splitter.finish().as_deref(), Some("Okay then"));
        // Splitter is reusable after finish.
        assert!(splitter.push("Next. ").len() == 1);
    }

    #[test]
    fn question_and_exclamation_terminate() {
        // The boundary needs whitespace after the terminator, so "?!" stays
        // one sentence.
        let mut splitter = SentenceSplitter::new();
        let sentences = splitter.push("Really?! Yes! ");
        assert_eq!(sentences, vec!["Really?!", "Yes!"]);
    }
}
