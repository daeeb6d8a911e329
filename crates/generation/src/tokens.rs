//! Token counting seam.
//!
//! The real tokenizer belongs to the model provider; the ledger only needs a
//! stable count for the prompt at reservation time and for the output at
//! commit time.

/// Counts tokens in a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn count(&self, text: &str) -> u64;

    /// Tokens to reserve before generation starts.
    fn estimate(&self, input_prompt_tokens: u64, max_output_tokens: u64) -> u64 {
        input_prompt_tokens.saturating_add(max_output_tokens)
    }

    /// Tokens actually consumed once the output is known.
    fn actual(&self, input_prompt_tokens: u64, output_tokens: u64) -> u64 {
        input_prompt_tokens.saturating_add(output_tokens)
    }
}

/// Approximates tokens as `ceil(chars / chars_per_token)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CharRatioEstimator {
    chars_per_token: u32,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: u32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn count(&self, text: &str) -> u64 {
        let chars = text.chars().count() as u64;
        chars.div_ceil(u64::from(self.chars_per_token))
    }
}
