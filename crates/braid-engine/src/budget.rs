use braid_core::config::BudgetConfig;
use braid_core::types::{BudgetStatus, TokenUsage};

/// Tracks cumulative token usage against soft and hard thresholds.
///
/// Purely advisory: `check` reports which threshold has been crossed, but
/// never aborts anything. Aborting a run on an exhausted budget is the
/// executor's decision.
#[derive(Debug, Clone)]
pub struct TokenBudgetController {
    config: BudgetConfig,
    total: TokenUsage,
}

impl TokenBudgetController {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            total: TokenUsage::default(),
        }
    }

    /// Start from usage already spent (e.g. when resuming a checkpoint).
    pub fn with_spent(mut self, spent: TokenUsage) -> Self {
        self.total = spent;
        self
    }

    /// Add usage reported by a finished unit of work.
    pub fn release(&mut self, usage: &TokenUsage) {
        self.total.accumulate(usage);
    }

    /// Threshold reached by the running total.
    pub fn check(&self) -> BudgetStatus {
        self.status_for(self.total.total())
    }

    /// Threshold the running total would reach after spending `usage`.
    /// Nothing is recorded.
    pub fn check_with(&self, usage: &TokenUsage) -> BudgetStatus {
        self.status_for(self.total.total().saturating_add(usage.total()))
    }

    pub fn total(&self) -> TokenUsage {
        self.total
    }

    pub fn budget(&self) -> u64 {
        self.config.max_tokens
    }

    /// Tokens left before the budget is reached (None = unlimited).
    pub fn remaining(&self) -> Option<u64> {
        if self.config.is_unlimited() {
            None
        } else {
            Some(self.config.max_tokens.saturating_sub(self.total.total()))
        }
    }

    /// Whether the total is strictly over the configured maximum.
    pub fn is_exceeded(&self) -> bool {
        !self.config.is_unlimited() && self.total.total() > self.config.max_tokens
    }

    fn status_for(&self, used: u64) -> BudgetStatus {
        if self.config.is_unlimited() {
            return BudgetStatus::None;
        }
        let used = u128::from(used);
        let hard = self.threshold(self.config.hard_pct);
        let soft = self.threshold(self.config.soft_pct);
        if used >= hard {
            BudgetStatus::HardLimit
        } else if used >= soft {
            BudgetStatus::SoftLimit
        } else {
            BudgetStatus::None
        }
    }

    // Widened so huge budgets can't overflow the percentage product
    fn threshold(&self, pct: u8) -> u128 {
        u128::from(self.config.max_tokens) * u128::from(pct) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_budget_is_silent() {
        let mut budget = TokenBudgetController::new(BudgetConfig::default());
        budget.release(&TokenUsage::new(1_000_000, 1_000_000));
        assert_eq!(budget.check(), BudgetStatus::None);
        assert!(!budget.is_exceeded());
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn test_thresholds() {
        let mut budget = TokenBudgetController::new(BudgetConfig::with_max_tokens(100));
        budget.release(&TokenUsage::new(50, 10));
        assert_eq!(budget.check(), BudgetStatus::None);
        assert_eq!(budget.remaining(), Some(40));

        budget.release(&TokenUsage::new(20, 0));
        assert_eq!(budget.check(), BudgetStatus::SoftLimit);

        budget.release(&TokenUsage::new(15, 0));
        assert_eq!(budget.check(), BudgetStatus::HardLimit);
        assert!(!budget.is_exceeded());

        budget.release(&TokenUsage::new(0, 6));
        assert!(budget.is_exceeded());
        assert_eq!(budget.remaining(), Some(0));
    }

    #[test]
    fn test_check_with_records_nothing() {
        let budget = TokenBudgetController::new(BudgetConfig::with_max_tokens(100));
        assert_eq!(budget.check_with(&TokenUsage::new(90, 0)), BudgetStatus::SoftLimit);
        assert_eq!(budget.check(), BudgetStatus::None);
        assert_eq!(budget.total().total(), 0);
    }

    #[test]
    fn test_huge_budget_thresholds_do_not_overflow() {
        let max = u64::MAX - 1;
        let mut budget = TokenBudgetController::new(BudgetConfig::with_max_tokens(max));
        assert_eq!(budget.check(), BudgetStatus::None);

        budget.release(&TokenUsage::new(max / 100 * 81, 0));
        assert_eq!(budget.check(), BudgetStatus::SoftLimit);
        assert_eq!(budget.check_with(&TokenUsage::new(u64::MAX, 0)), BudgetStatus::HardLimit);
        assert!(!budget.is_exceeded());
    }

    #[test]
    fn test_exactly_at_budget_is_not_exceeded() {
        let budget = TokenBudgetController::new(BudgetConfig::with_max_tokens(10))
            .with_spent(TokenUsage::new(10, 0));
        assert!(!budget.is_exceeded());
        assert_eq!(budget.check(), BudgetStatus::HardLimit);
    }
}
