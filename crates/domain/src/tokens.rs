//! Token accounting — raw provider counts, derived per-turn records, and
//! cost estimation from per-model rate tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Raw usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw token counts as reported by a provider for one response.
///
/// `input_tokens` is cumulative context, not the new-input delta — providers
/// report the whole window on every response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    /// 5-minute cache tier, when the provider reports it.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_5m_tokens: u64,
    /// 1-hour cache tier, when the provider reports it.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_1h_tokens: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TokenRecord — per-turn derived figures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecordSource {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_5m_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_1h_tokens: u64,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecordComputed {
    /// The full context window the provider reported (= raw input).
    pub context_window_tokens: u64,
    /// Delta over the previous turn's context baseline, clamped at zero —
    /// compaction can make the raw number shrink.
    pub new_input_tokens: u64,
    /// How `new_input_tokens` was derived.
    pub calculation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecordMeta {
    pub turn: u32,
    pub session_id: String,
    pub extracted_at: DateTime<Utc>,
}

/// Per-turn token record: raw source counts plus computed figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub source: TokenRecordSource,
    pub computed: TokenRecordComputed,
    pub meta: TokenRecordMeta,
}

impl TokenRecord {
    /// Derive a record from raw usage and the previous context baseline.
    pub fn from_usage(
        usage: &TokenUsage,
        provider: &str,
        previous_context_baseline: u64,
        turn: u32,
        session_id: &str,
    ) -> Self {
        let context_window_tokens = usage.input_tokens;
        let new_input_tokens = context_window_tokens.saturating_sub(previous_context_baseline);
        let now = Utc::now();
        TokenRecord {
            source: TokenRecordSource {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_read_tokens: usage.cache_read_tokens,
                cache_creation_tokens: usage.cache_creation_tokens,
                cache_creation_5m_tokens: usage.cache_creation_5m_tokens,
                cache_creation_1h_tokens: usage.cache_creation_1h_tokens,
                provider: provider.to_owned(),
                timestamp: now,
            },
            computed: TokenRecordComputed {
                context_window_tokens,
                new_input_tokens,
                calculation: "cumulative_minus_baseline".into(),
            },
            meta: TokenRecordMeta {
                turn,
                session_id: session_id.to_owned(),
                extracted_at: now,
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session aggregates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Running totals accumulated onto the session row, one turn at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulatedTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost: f64,
}

impl AccumulatedTokens {
    pub fn accumulate(&mut self, record: &TokenRecord, cost: f64) {
        self.input_tokens += record.computed.new_input_tokens;
        self.output_tokens += record.source.output_tokens;
        self.cache_read_tokens += record.source.cache_read_tokens;
        self.cache_creation_tokens += record.source.cache_creation_tokens;
        self.cost += cost;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-model USD rates, expressed per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRates {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_read_per_mtok: f64,
    #[serde(default)]
    pub cache_creation_per_mtok: f64,
    #[serde(default)]
    pub cache_creation_5m_per_mtok: f64,
    #[serde(default)]
    pub cache_creation_1h_per_mtok: f64,
}

impl ModelRates {
    /// Estimate the USD cost of one response from raw usage.
    pub fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        const MTOK: f64 = 1_000_000.0;
        let mut cost = usage.input_tokens as f64 / MTOK * self.input_per_mtok
            + usage.output_tokens as f64 / MTOK * self.output_per_mtok
            + usage.cache_read_tokens as f64 / MTOK * self.cache_read_per_mtok
            + usage.cache_creation_tokens as f64 / MTOK * self.cache_creation_per_mtok;
        cost += usage.cache_creation_5m_tokens as f64 / MTOK * self.cache_creation_5m_per_mtok;
        cost += usage.cache_creation_1h_tokens as f64 / MTOK * self.cache_creation_1h_per_mtok;
        cost
    }
}

/// Pick the turn cost: a nonzero provider-reported figure wins; a zero or
/// absent one falls back to the local estimate.
pub fn resolve_cost(provider_cost: Option<f64>, local_estimate: f64) -> f64 {
    match provider_cost {
        Some(c) if c != 0.0 => c,
        _ => local_estimate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[test]
    fn new_input_is_delta_over_baseline() {
        let record = TokenRecord::from_usage(&usage(1500, 20), "mock", 1000, 2, "s1");
        assert_eq!(record.computed.context_window_tokens, 1500);
        assert_eq!(record.computed.new_input_tokens, 500);
    }

    #[test]
    fn new_input_clamped_at_zero_after_shrink() {
        // Post-compaction the cumulative input can drop below the baseline.
        let record = TokenRecord::from_usage(&usage(400, 20), "mock", 1000, 5, "s1");
        assert_eq!(record.computed.new_input_tokens, 0);
    }

    #[test]
    fn first_turn_baseline_zero() {
        let record = TokenRecord::from_usage(&usage(10, 3), "mock", 0, 1, "s1");
        assert_eq!(record.computed.new_input_tokens, 10);
    }

    #[test]
    fn accumulate_sums_turns() {
        let mut acc = AccumulatedTokens::default();
        let r1 = TokenRecord::from_usage(&usage(100, 10), "mock", 0, 1, "s1");
        let r2 = TokenRecord::from_usage(&usage(160, 25), "mock", 100, 2, "s1");
        acc.accumulate(&r1, 0.01);
        acc.accumulate(&r2, 0.02);
        assert_eq!(acc.input_tokens, 160); // 100 new + 60 new
        assert_eq!(acc.output_tokens, 35);
        assert!((acc.cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn cost_estimate_from_rates() {
        let rates = ModelRates {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            ..Default::default()
        };
        let cost = rates.estimate_cost(&usage(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn provider_cost_wins_only_when_nonzero() {
        assert_eq!(resolve_cost(Some(0.42), 0.1), 0.42);
        assert_eq!(resolve_cost(Some(0.0), 0.1), 0.1);
        assert_eq!(resolve_cost(None, 0.1), 0.1);
    }

    #[test]
    fn cache_tiers_priced_separately() {
        let rates = ModelRates {
            input_per_mtok: 1.0,
            output_per_mtok: 1.0,
            cache_creation_5m_per_mtok: 2.0,
            cache_creation_1h_per_mtok: 4.0,
            ..Default::default()
        };
        let u = TokenUsage {
            cache_creation_5m_tokens: 1_000_000,
            cache_creation_1h_tokens: 500_000,
            ..Default::default()
        };
        assert!((rates.estimate_cost(&u) - 4.0).abs() < 1e-9);
    }
}
