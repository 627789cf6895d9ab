//! Per-project budget ledger: totals, reservations, transaction log, and
//! one-shot alert thresholds.
//!
//! Invariant: `spent + remaining + reserved == total` at all times, modulo
//! allocation events which raise `total` and `remaining` together.

use crate::{constants::BUDGET_ALERT_THRESHOLDS, FabricError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Allocation,
    Expense,
    Refund,
    Adjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: TransactionKind,
    pub amount: f64,
    pub category: String,
    pub description: String,
}

/// Fired when spending crosses an alert threshold for the first time.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetAlert {
    pub project_id: String,
    /// Threshold as a fraction of total (0.5 = 50%).
    pub threshold: f64,
    pub spent: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSummary {
    pub total: f64,
    pub spent: f64,
    pub remaining: f64,
    pub reserved: f64,
    pub currency: String,
    pub utilization_percent: f64,
    pub transaction_count: usize,
    pub triggered_alerts: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub total: f64,
    pub spent: f64,
    pub remaining: f64,
    pub reserved: f64,
    pub currency: String,
    pub transactions: Vec<Transaction>,
    pub alert_thresholds: Vec<f64>,
    pub triggered_alerts: Vec<f64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl Budget {
    pub fn new(total: f64, currency: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        let mut budget = Self {
            total,
            spent: 0.0,
            remaining: total,
            reserved: 0.0,
            currency: currency.into(),
            transactions: Vec::new(),
            alert_thresholds: BUDGET_ALERT_THRESHOLDS.to_vec(),
            triggered_alerts: Vec::new(),
            created_at: now,
            last_updated: now,
        };
        budget.record(TransactionKind::Allocation, total, "general", "Initial budget allocation");
        budget
    }

    fn record(&mut self, kind: TransactionKind, amount: f64, category: &str, description: &str) {
        self.last_updated = chrono::Utc::now();
        self.transactions.push(Transaction {
            timestamp: self.last_updated,
            kind,
            amount,
            category: category.to_string(),
            description: description.to_string(),
        });
    }

    /// Record an expense. Rejected outright when `amount` exceeds the
    /// unreserved remainder. Returns the alert thresholds newly crossed.
    pub fn record_expense(
        &mut self,
        amount: f64,
        category: &str,
        description: &str,
    ) -> Result<Vec<f64>> {
        if amount > self.remaining {
            warn!(
                "Insufficient budget: requested {amount}, available {}",
                self.remaining
            );
            return Err(FabricError::InsufficientFunds {
                requested: amount,
                available: self.remaining,
            });
        }

        self.spent += amount;
        self.remaining -= amount;
        self.record(TransactionKind::Expense, amount, category, description);

        Ok(self.check_alerts())
    }

    /// Raise the total; the new funds land in `remaining`.
    pub fn add(&mut self, amount: f64, description: &str) {
        self.total += amount;
        self.remaining += amount;
        self.record(TransactionKind::Allocation, amount, "general", description);
    }

    /// Earmark funds: moves `amount` from remaining to reserved.
    pub fn reserve(&mut self, amount: f64) -> Result<()> {
        if amount > self.remaining {
            return Err(FabricError::InsufficientFunds {
                requested: amount,
                available: self.remaining,
            });
        }
        self.reserved += amount;
        self.remaining -= amount;
        self.last_updated = chrono::Utc::now();
        Ok(())
    }

    /// Return earmarked funds to remaining. Never exceeds what is reserved.
    pub fn release(&mut self, amount: f64) -> Result<()> {
        if amount > self.reserved {
            return Err(FabricError::InvalidInput(format!(
                "cannot release {amount}: only {} reserved",
                self.reserved
            )));
        }
        self.reserved -= amount;
        self.remaining += amount;
        self.last_updated = chrono::Utc::now();
        Ok(())
    }

    /// Thresholds crossed by the current utilization that have not fired
    /// before. Each fires exactly once for the lifetime of the budget.
    /// Utilization is measured against the spendable total (total minus
    /// reserved funds), so earmarked money tightens the alerting.
    fn check_alerts(&mut self) -> Vec<f64> {
        let spendable = self.total - self.reserved;
        if spendable <= 0.0 {
            return Vec::new();
        }
        let utilization = self.spent / spendable;
        let mut fired = Vec::new();
        for &threshold in &self.alert_thresholds {
            if utilization >= threshold && !self.triggered_alerts.contains(&threshold) {
                self.triggered_alerts.push(threshold);
                fired.push(threshold);
            }
        }
        fired
    }

    pub fn summary(&self) -> BudgetSummary {
        let utilization = if self.total > 0.0 {
            (self.spent / self.total * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        BudgetSummary {
            total: self.total,
            spent: self.spent,
            remaining: self.remaining,
            reserved: self.reserved,
            currency: self.currency.clone(),
            utilization_percent: utilization,
            transaction_count: self.transactions.len(),
            triggered_alerts: self.triggered_alerts.clone(),
        }
    }

    pub fn history(&self, limit: Option<usize>) -> &[Transaction] {
        match limit {
            Some(n) if n < self.transactions.len() => {
                &self.transactions[self.transactions.len() - n..]
            }
            _ => &self.transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_expense_flow() {
        // Total $10: reserve $4, a $7 expense must fail, release $2 and it fits.
        let mut budget = Budget::new(10.0, "USD");

        budget.reserve(4.0).unwrap();
        assert_eq!(budget.reserved, 4.0);
        assert_eq!(budget.remaining, 6.0);

        let result = budget.record_expense(7.0, "compute", "batch run");
        assert!(matches!(result, Err(FabricError::InsufficientFunds { .. })));

        budget.release(2.0).unwrap();
        assert_eq!(budget.reserved, 2.0);
        assert_eq!(budget.remaining, 8.0);

        let fired = budget.record_expense(7.0, "compute", "batch run").unwrap();
        assert_eq!(budget.spent, 7.0);
        assert_eq!(budget.remaining, 1.0);
        // $7 of the $8 spendable: 87.5% crosses the 50% and 75% thresholds
        assert_eq!(fired, vec![0.5, 0.75]);
    }

    #[test]
    fn alerts_fire_once_per_threshold() {
        let mut budget = Budget::new(10.0, "USD");

        let fired = budget.record_expense(5.0, "general", "").unwrap();
        assert_eq!(fired, vec![0.5]);

        // Same threshold never fires twice
        let fired = budget.record_expense(1.0, "general", "").unwrap();
        assert!(fired.is_empty());

        let fired = budget.record_expense(4.0, "general", "").unwrap();
        assert_eq!(fired, vec![0.75, 0.9, 1.0]);
        assert_eq!(budget.remaining, 0.0);
    }

    #[test]
    fn expense_of_exact_remaining_succeeds() {
        let mut budget = Budget::new(3.0, "USD");
        let fired = budget.record_expense(3.0, "general", "everything").unwrap();
        assert_eq!(budget.remaining, 0.0);
        assert_eq!(budget.spent, 3.0);
        assert!(fired.contains(&1.0));
    }

    #[test]
    fn reserve_release_round_trips() {
        let mut budget = Budget::new(5.0, "USD");
        let before = budget.remaining;

        budget.reserve(2.5).unwrap();
        budget.release(2.5).unwrap();

        assert_eq!(budget.remaining, before);
        assert_eq!(budget.reserved, 0.0);
    }

    #[test]
    fn release_cannot_exceed_reserved() {
        let mut budget = Budget::new(5.0, "USD");
        budget.reserve(1.0).unwrap();
        assert!(budget.release(2.0).is_err());
    }

    #[test]
    fn conservation_invariant_holds() {
        let mut budget = Budget::new(20.0, "USD");
        budget.reserve(5.0).unwrap();
        budget.record_expense(3.0, "api", "").unwrap();
        budget.add(10.0, "top up");
        budget.release(2.0).unwrap();

        assert!((budget.spent + budget.remaining + budget.reserved - budget.total).abs() < 1e-9);
    }

    #[test]
    fn add_raises_total_and_remaining() {
        let mut budget = Budget::new(1.0, "EUR");
        budget.add(4.0, "expansion");
        assert_eq!(budget.total, 5.0);
        assert_eq!(budget.remaining, 5.0);
        assert_eq!(budget.transactions.len(), 2);
        assert_eq!(budget.transactions[1].kind, TransactionKind::Allocation);
    }

    #[test]
    fn history_limit_returns_most_recent() {
        let mut budget = Budget::new(100.0, "USD");
        for i in 0..5 {
            budget
                .record_expense(1.0, "general", &format!("expense {i}"))
                .unwrap();
        }
        let recent = budget.history(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].description, "expense 4");
    }

    #[test]
    fn summary_reports_utilization() {
        let mut budget = Budget::new(8.0, "USD");
        budget.record_expense(2.0, "general", "").unwrap();
        let summary = budget.summary();
        assert_eq!(summary.utilization_percent, 25.0);
        assert_eq!(summary.transaction_count, 2);
    }
}
