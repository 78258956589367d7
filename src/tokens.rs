//! Approximate token counting for streamed completions.
//!
//! The relay meters quota without shipping a full tokenizer per model:
//! ASCII text averages about four characters per token, wide scripts
//! (CJK and similar) about one token per character. The estimate is
//! deterministic and stable across chunk boundaries because the counter
//! accumulates character classes, not per-chunk estimates.

/// Final token counts for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUsage {
    /// Estimated tokens in the prompt.
    pub prompt_tokens: u64,
    /// Estimated tokens in the streamed completion.
    pub completion_tokens: u64,
    /// Sum of prompt and completion.
    pub total_tokens: u64,
}

/// Estimate the token count of `text`.
///
/// # Example
///
/// ```
/// use llm_relay::tokens::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("abcd"), 1);
/// ```
pub fn estimate_tokens(text: &str) -> u64 {
    let mut ascii = 0u64;
    let mut wide = 0u64;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }
    ascii.div_ceil(4) + wide
}

/// Incremental token counter for one stream.
///
/// Construct with the model name and prompt text, feed each delta as it
/// arrives, and call [`finalize`](Self::finalize) when the stream ends.
#[derive(Debug)]
pub struct StreamTokenCounter {
    model: String,
    prompt_tokens: u64,
    ascii_chars: u64,
    wide_chars: u64,
}

impl StreamTokenCounter {
    /// A counter with the prompt already estimated.
    pub fn new(model: impl Into<String>, prompt: &str) -> Self {
        Self {
            model: model.into(),
            prompt_tokens: estimate_tokens(prompt),
            ascii_chars: 0,
            wide_chars: 0,
        }
    }

    /// The model this counter serves.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Accumulate one streamed delta.
    pub fn feed(&mut self, delta: &str) {
        for c in delta.chars() {
            if c.is_ascii() {
                self.ascii_chars += 1;
            } else {
                self.wide_chars += 1;
            }
        }
    }

    /// Discard accumulated completion text (stream restart on retry).
    pub fn reset(&mut self) {
        self.ascii_chars = 0;
        self.wide_chars = 0;
    }

    /// Completion tokens accumulated so far.
    pub fn completion_tokens(&self) -> u64 {
        self.ascii_chars.div_ceil(4) + self.wide_chars
    }

    /// Produce the final counts.
    pub fn finalize(&self) -> TokenUsage {
        let completion_tokens = self.completion_tokens();
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens,
            total_tokens: self.prompt_tokens + completion_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_ascii_rounds_up() {
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("hello world, how are you"), 6);
    }

    #[test]
    fn test_estimate_wide_chars_count_individually() {
        assert_eq!(estimate_tokens("你好"), 2);
        // Four ASCII + two CJK.
        assert_eq!(estimate_tokens("test你好"), 3);
    }

    #[test]
    fn test_counter_stable_across_chunk_boundaries() {
        let text = "The quick brown fox jumps over the lazy dog";

        let mut whole = StreamTokenCounter::new("gpt-4o", "");
        whole.feed(text);

        let mut chunked = StreamTokenCounter::new("gpt-4o", "");
        for chunk in text.as_bytes().chunks(3) {
            chunked.feed(std::str::from_utf8(chunk).expect("ascii chunks"));
        }

        assert_eq!(whole.finalize(), chunked.finalize());
    }

    #[test]
    fn test_finalize_totals() {
        let mut counter = StreamTokenCounter::new("gpt-4o", "12345678");
        counter.feed("abcd");

        let usage = counter.finalize();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn test_reset_clears_completion_only() {
        let mut counter = StreamTokenCounter::new("gpt-4o", "12345678");
        counter.feed("some partial output");
        assert!(counter.completion_tokens() > 0);

        counter.reset();
        assert_eq!(counter.completion_tokens(), 0);
        assert_eq!(counter.finalize().prompt_tokens, 2);
    }
}
