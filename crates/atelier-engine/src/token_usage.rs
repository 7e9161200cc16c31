use atelier_contracts::generation::TokenUsage;
use atelier_contracts::sessions::Branch;

pub const DEFAULT_CONTEXT_LIMIT: u64 = 128_000;
pub const DEFAULT_NEAR_LIMIT_RATIO: f64 = 0.85;
const CHARS_PER_TOKEN: f64 = 4.0;

/// Character-count heuristic, not a tokenizer.
#[derive(Debug, Clone, Copy)]
pub struct TokenUsageEstimator {
    near_limit_ratio: f64,
}

impl Default for TokenUsageEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_LIMIT_RATIO)
    }
}

impl TokenUsageEstimator {
    pub fn new(near_limit_ratio: f64) -> Self {
        Self { near_limit_ratio }
    }

    pub fn estimate(&self, branch: &Branch, context_limit: u64) -> TokenUsage {
        let chars: usize = branch
            .turns
            .iter()
            .map(|turn| {
                turn.prompt.as_deref().map_or(0, |text| text.chars().count())
                    + turn
                        .text_response
                        .as_deref()
                        .map_or(0, |text| text.chars().count())
            })
            .sum();
        let estimated_tokens = tokens_for_chars(chars);
        let usage_ratio = if context_limit == 0 {
            0.0
        } else {
            estimated_tokens as f64 / context_limit as f64
        };
        TokenUsage {
            estimated_tokens,
            context_limit,
            usage_ratio,
            near_limit: usage_ratio >= self.near_limit_ratio,
        }
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    tokens_for_chars(text.chars().count())
}

fn tokens_for_chars(chars: usize) -> u64 {
    if chars == 0 {
        return 0;
    }
    ((chars as f64) / CHARS_PER_TOKEN).ceil() as u64
}
