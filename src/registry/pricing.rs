//! Priced capability descriptor returned by registry resolution.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::ModelEntry;

/// Per-1k-token pricing for one provider model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
    pub currency: String,
}

/// Resolved model descriptor: provider routing, pricing and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub logical_id: String,
    pub provider: String,
    pub provider_model_id: String,
    pub pricing: ModelPricing,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    pub supports_function_calling: bool,
}

impl ModelInfo {
    pub(crate) fn from_entry(logical_id: &str, provider_model_id: &str, entry: &ModelEntry) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            provider: entry.provider.clone(),
            provider_model_id: provider_model_id.to_string(),
            pricing: ModelPricing {
                input_cost_per_1k: entry.input_cost_per_1k,
                output_cost_per_1k: entry.output_cost_per_1k,
                currency: entry.currency.clone(),
            },
            context_window: entry.context_window,
            max_output_tokens: entry.max_output_tokens,
            supports_streaming: entry.supports_streaming,
            supports_function_calling: entry.supports_function_calling,
        }
    }

    /// Cost of one call given measured token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let per_k = dec!(1000);
        Decimal::from(input_tokens) / per_k * self.pricing.input_cost_per_1k
            + Decimal::from(output_tokens) / per_k * self.pricing.output_cost_per_1k
    }
}

impl ModelEntry {
    /// Conservative pricing used when validation finds an unpriced default
    /// in lenient mode.
    pub(crate) fn fallback_priced() -> Self {
        Self {
            provider: "unknown".to_string(),
            input_cost_per_1k: dec!(0.005),
            output_cost_per_1k: dec!(0.015),
            currency: "USD".to_string(),
            context_window: 128_000,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_function_calling: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_cost() {
        let info = ModelInfo::from_entry(
            "writer",
            "gpt-4o",
            &ModelEntry {
                provider: "openai".to_string(),
                input_cost_per_1k: dec!(0.0025),
                output_cost_per_1k: dec!(0.01),
                currency: "USD".to_string(),
                context_window: 128_000,
                max_output_tokens: 4_096,
                supports_streaming: true,
                supports_function_calling: true,
            },
        );

        // 2000 input tokens + 500 output tokens
        assert_eq!(info.estimate_cost(2_000, 500), dec!(0.01));
    }
}
