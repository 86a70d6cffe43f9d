//! Per-provider pricing table
//!
//! Used whenever a response does not carry a cost of its own: every provider
//! reports token counts but not dollars, and synthesized stream terminators
//! only have estimated token counts.

use super::TokenUsage;

/// USD price per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    /// Cost of `usage` in USD
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_mtok
            + usage.output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

// Longest prefix first within each provider.
const OPENAI: &[(&str, Pricing)] = &[
    ("gpt-4o-mini", Pricing::new(0.15, 0.60)),
    ("gpt-4o", Pricing::new(2.50, 10.00)),
    ("gpt-4.1-mini", Pricing::new(0.40, 1.60)),
    ("gpt-4.1", Pricing::new(2.00, 8.00)),
    ("o4-mini", Pricing::new(1.10, 4.40)),
];

const DEEPSEEK: &[(&str, Pricing)] = &[
    ("deepseek-reasoner", Pricing::new(0.55, 2.19)),
    ("deepseek-chat", Pricing::new(0.27, 1.10)),
];

const ANTHROPIC: &[(&str, Pricing)] = &[
    ("claude-opus", Pricing::new(15.00, 75.00)),
    ("claude-sonnet", Pricing::new(3.00, 15.00)),
    ("claude-3-5-haiku", Pricing::new(0.80, 4.00)),
    ("claude-haiku", Pricing::new(0.80, 4.00)),
];

/// Pricing for `model` served by `provider`; unknown models fall back to the
/// provider's most expensive listed tier so estimates err high.
pub fn pricing_for(provider: &str, model: &str) -> Pricing {
    let (table, fallback) = match provider {
        "anthropic" => (ANTHROPIC, Pricing::new(15.00, 75.00)),
        "deepseek" => (DEEPSEEK, Pricing::new(0.55, 2.19)),
        _ => (OPENAI, Pricing::new(2.50, 10.00)),
    };

    // Some endpoints prefix the vendor ("deepseek/deepseek-chat")
    let model = model.rsplit('/').next().unwrap_or(model);

    table
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, pricing)| *pricing)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_lookup() {
        assert_eq!(pricing_for("openai", "gpt-4o-mini-2024-07-18"), Pricing::new(0.15, 0.60));
        assert_eq!(pricing_for("openai", "gpt-4o-2024-08-06"), Pricing::new(2.50, 10.00));
        assert_eq!(
            pricing_for("anthropic", "claude-sonnet-4-20250514"),
            Pricing::new(3.00, 15.00)
        );
        assert_eq!(
            pricing_for("deepseek", "deepseek/deepseek-chat"),
            Pricing::new(0.27, 1.10)
        );
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        assert_eq!(pricing_for("anthropic", "claude-next"), Pricing::new(15.00, 75.00));
    }

    #[test]
    fn test_cost() {
        let pricing = Pricing::new(3.00, 15.00);
        let usage = TokenUsage::new(1_000_000, 100_000);
        assert!((pricing.cost(&usage) - 4.5).abs() < 1e-9);
    }
}
