//! Monthly and global summaries
//!
//! Summaries are merged into the previous payload rather than rebuilt:
//! months whose transactions are no longer loaded in memory keep the totals
//! they were last written with. Any month that has a loaded transaction is
//! recomputed from scratch.
//!
//! Arithmetic runs in `rust_decimal` and is rounded to 4 places on the way
//! back to the float payload.

use chrono::{DateTime, SecondsFormat, Utc};
use ledger_types::data::{Budget, LedgerData};
use ledger_types::numeric;
use ledger_types::summary::{BudgetSnapshot, GlobalSummary, MonthlySummary};
use ledger_types::transaction::{Transaction, TransactionKind};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::projector;

/// Runway reported when nothing has ever been spent.
pub const UNBOUNDED_RUNWAY: f64 = 999.0;

/// Months averaged for the burn rate.
const BURN_WINDOW: usize = 12;

fn dec(value: f64) -> Decimal {
    numeric::to_decimal(value).unwrap_or(Decimal::ZERO)
}

fn snapshots(budgets: &[Budget]) -> Vec<BudgetSnapshot> {
    budgets
        .iter()
        .map(|b| BudgetSnapshot {
            area_id: b.area_id.clone().unwrap_or_else(|| "unknown".to_string()),
            amount: b.amount,
            currency: b.currency.clone(),
            kind: b.kind,
        })
        .collect()
}

/// Fold the loaded transactions into `previous`.
///
/// `now` decides the current month, which always gets a fresh budget
/// snapshot even without transactions.
pub fn update_summaries(
    previous: Option<GlobalSummary>,
    transactions: &[Transaction],
    budgets: &[Budget],
    now: DateTime<Utc>,
) -> GlobalSummary {
    let mut summary = previous.unwrap_or_default();
    let current_month = now.format("%Y-%m").to_string();

    // month → (income, expense, count)
    let mut totals: BTreeMap<&str, (Decimal, Decimal, u64)> = BTreeMap::new();
    for tx in transactions {
        let Some(month) = tx.period() else {
            continue;
        };
        let entry = totals.entry(month).or_insert((Decimal::ZERO, Decimal::ZERO, 0));
        match tx.kind {
            TransactionKind::Income => entry.0 += dec(tx.base_amount()),
            TransactionKind::Expense => entry.1 += dec(tx.base_amount()),
            _ => {}
        }
        entry.2 += 1;
    }

    for (month, (income, expense, count)) in &totals {
        let slot = summary.monthly_breakdown.entry(month.to_string()).or_default();
        slot.income = numeric::from_decimal(*income);
        slot.expense = numeric::from_decimal(*expense);
        slot.savings = numeric::from_decimal(*income - *expense);
        slot.count = *count;
    }

    let current = summary
        .monthly_breakdown
        .entry(current_month)
        .or_insert_with(MonthlySummary::default);
    current.budget_snapshots = Some(snapshots(budgets));

    let (total_income, total_expense) = summary
        .monthly_breakdown
        .values()
        .fold((Decimal::ZERO, Decimal::ZERO), |(inc, exp), m| {
            (inc + dec(m.income), exp + dec(m.expense))
        });

    let window: Vec<Decimal> = summary
        .monthly_breakdown
        .values()
        .rev()
        .take(BURN_WINDOW)
        .map(|m| dec(m.expense))
        .collect();
    let burn = if window.is_empty() {
        Decimal::ZERO
    } else {
        window.iter().sum::<Decimal>() / Decimal::from(window.len())
    };

    let savings_rate = (total_income - total_expense)
        .checked_div(total_income)
        .filter(|_| total_income > Decimal::ZERO)
        .map(|r| r * Decimal::ONE_HUNDRED)
        .unwrap_or(Decimal::ZERO);

    summary.total_income = numeric::from_decimal(total_income);
    summary.total_expense = numeric::from_decimal(total_expense);
    summary.avg_monthly_burn_rate = numeric::from_decimal(burn);
    summary.savings_rate = numeric::from_decimal(savings_rate);
    summary.last_updated = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    summary
}

/// Inject liquidity as net worth and derive the runway from the burn rate.
pub fn apply_liquidity(summary: &mut GlobalSummary, liquidity: f64) {
    summary.net_worth = liquidity;
    let burn = dec(summary.avg_monthly_burn_rate);
    summary.runway_months = if burn > Decimal::ZERO {
        numeric::from_decimal(dec(liquidity) / burn)
    } else if summary.total_expense == 0.0 {
        UNBOUNDED_RUNWAY
    } else {
        0.0
    };
}

/// Full summary pass over a ledger state.
pub fn summarize(
    data: &LedgerData,
    previous: Option<GlobalSummary>,
    now: DateTime<Utc>,
) -> GlobalSummary {
    let mut summary = update_summaries(previous, &data.transactions, &data.budgets, now);
    let balances = projector::project(&data.transactions, &data.account_registry);
    let liquidity = projector::liquidity(&balances, &data.base_currency, &data.exchange_rates);
    apply_liquidity(&mut summary, liquidity);
    summary
}
