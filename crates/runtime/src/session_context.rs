//! Cross-turn session state carried by an active session.

use strand_domain::tokens::{TokenRecord, TokenUsage};

/// Mutable per-session context updated by the turn pipeline.
#[derive(Debug, Default)]
pub struct SessionContext {
    /// Turn counter across the session's whole life (1-based).
    pub current_turn: u32,
    /// Previous turn's `context_window_tokens`, the baseline for the next
    /// new-input computation.
    pub context_baseline: u64,
    /// Usage captured early at `response_complete`, before trailing tool
    /// work for the turn.
    pub response_usage: Option<TokenUsage>,
    /// Last finalized token record.
    pub last_record: Option<TokenRecord>,
}

impl SessionContext {
    /// Next user-visible turn number for an incoming prompt.
    pub fn next_turn(&self) -> u32 {
        self.current_turn + 1
    }

    /// Fold a finalized turn record in: advance the baseline.
    pub fn finish_turn(&mut self, record: TokenRecord) {
        self.context_baseline = record.computed.context_window_tokens;
        self.last_record = Some(record);
        self.response_usage = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_domain::tokens::TokenUsage;

    #[test]
    fn baseline_advances_per_turn() {
        let mut ctx = SessionContext::default();
        assert_eq!(ctx.context_baseline, 0);

        let usage = TokenUsage {
            input_tokens: 900,
            ..Default::default()
        };
        let record = TokenRecord::from_usage(&usage, "mock", ctx.context_baseline, 1, "s1");
        assert_eq!(record.computed.new_input_tokens, 900);
        ctx.finish_turn(record);
        assert_eq!(ctx.context_baseline, 900);

        let usage = TokenUsage {
            input_tokens: 1100,
            ..Default::default()
        };
        let record = TokenRecord::from_usage(&usage, "mock", ctx.context_baseline, 2, "s1");
        assert_eq!(record.computed.new_input_tokens, 200);
    }
}
