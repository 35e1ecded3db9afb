//! Run-scoped token usage accumulation.

use crate::llm::TokenUsage;

/// Accumulates usage across the model calls of one engine invocation.
///
/// Starts unset: `total()` returns `None` until a provider actually reports
/// usage, so "never reported" serializes as absent rather than zero. Once
/// set, zero is preserved as a legitimate value.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    total: Option<TokenUsage>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, usage: Option<&TokenUsage>) {
        if let Some(usage) = usage {
            self.total.get_or_insert_with(TokenUsage::default).add(usage);
        }
    }

    pub fn total(&self) -> Option<TokenUsage> {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unset() {
        let acc = UsageAccumulator::new();
        assert!(acc.total().is_none());
    }

    #[test]
    fn test_none_observations_stay_unset() {
        let mut acc = UsageAccumulator::new();
        acc.observe(None);
        assert!(acc.total().is_none());
    }

    #[test]
    fn test_zero_is_a_real_value_once_set() {
        let mut acc = UsageAccumulator::new();
        acc.observe(Some(&TokenUsage::default()));
        assert_eq!(acc.total(), Some(TokenUsage::default()));
    }

    #[test]
    fn test_accumulates() {
        let mut acc = UsageAccumulator::new();
        acc.observe(Some(&TokenUsage {
            input_tokens: 7,
            output_tokens: 3,
            total_tokens: 10,
            reasoning_tokens: 1,
        }));
        acc.observe(None);
        acc.observe(Some(&TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
            total_tokens: 5,
            reasoning_tokens: 0,
        }));
        let total = acc.total().unwrap();
        assert_eq!(total.total_tokens, 15);
        assert_eq!(total.reasoning_tokens, 1);
    }
}
