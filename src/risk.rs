//! Heuristic anomaly scoring for the wallet monitoring panels.
//!
//! Each signal is a fixed-threshold test over a wallet's transactions; the
//! score is the capped sum of the weights of the signals that fired.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Duration;
use uuid::Uuid;

use minefund_core::{Currency, TransactionType, Wallet, WalletTransaction};

use crate::storage::{StorageBackend, StorageError};

const MAX_SCORE: u8 = 100;

/// Longest window accepted from configuration (about a century).
pub const MAX_WINDOW_HOURS: i64 = 24 * 366 * 100;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskThresholds {
    pub large_transaction: Decimal,
    pub burst_count: usize,
    pub burst_window_hours: i64,
    pub rapid_withdrawal_hours: i64,
    /// Withdrawn / deposited ratio at which a wallet counts as drained.
    pub drain_ratio: Decimal,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            large_transaction: Decimal::from(10_000),
            burst_count: 5,
            burst_window_hours: 1,
            rapid_withdrawal_hours: 24,
            drain_ratio: Decimal::new(9, 1),
        }
    }
}

impl RiskThresholds {
    pub fn validate(&self) -> Result<(), String> {
        for (name, hours) in [
            ("burst_window_hours", self.burst_window_hours),
            ("rapid_withdrawal_hours", self.rapid_withdrawal_hours),
        ] {
            if !(0..=MAX_WINDOW_HOURS).contains(&hours) {
                return Err(format!("risk.{} must be between 0 and {}", name, MAX_WINDOW_HOURS));
            }
        }
        if self.drain_ratio < Decimal::ZERO {
            return Err("risk.drain_ratio must not be negative".to_string());
        }
        if self.large_transaction < Decimal::ZERO {
            return Err("risk.large_transaction must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSignal {
    LargeTransaction,
    BurstActivity,
    RapidWithdrawal,
    DrainedBalance,
}

impl RiskSignal {
    pub fn weight(&self) -> u8 {
        match self {
            RiskSignal::LargeTransaction => 30,
            RiskSignal::BurstActivity => 25,
            RiskSignal::RapidWithdrawal => 25,
            RiskSignal::DrainedBalance => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskReport {
    pub wallet_id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub balance: Decimal,
    pub score: u8,
    pub level: RiskLevel,
    pub signals: Vec<RiskSignal>,
    pub transactions_considered: usize,
}

fn is_outflow(t: TransactionType) -> bool {
    matches!(t, TransactionType::Withdrawal | TransactionType::Transfer)
}

fn has_large_transaction(transactions: &[WalletTransaction], thresholds: &RiskThresholds) -> bool {
    transactions.iter().any(|t| t.amount >= thresholds.large_transaction)
}

/// `None` when the window is too long to represent, which counts as unbounded.
fn window(hours: i64) -> Option<Duration> {
    hours.checked_mul(3600).map(Duration::seconds)
}

fn has_burst(transactions: &[WalletTransaction], thresholds: &RiskThresholds) -> bool {
    let Some(newest) = transactions.iter().map(|t| t.created_at).max() else {
        return false;
    };
    let in_window = match window(thresholds.burst_window_hours).and_then(|w| newest.checked_sub(w)) {
        Some(start) => transactions.iter().filter(|t| t.created_at >= start).count(),
        None => transactions.len(),
    };
    in_window > thresholds.burst_count
}

fn has_rapid_withdrawal(transactions: &[WalletTransaction], thresholds: &RiskThresholds) -> bool {
    let window = window(thresholds.rapid_withdrawal_hours);
    transactions.iter()
        .filter(|t| is_outflow(t.transaction_type))
        .any(|w| {
            transactions.iter()
                .filter(|d| d.transaction_type == TransactionType::Deposit)
                .filter(|d| d.created_at <= w.created_at)
                .any(|d| window.map_or(true, |limit| w.created_at - d.created_at <= limit))
        })
}

fn is_drained(transactions: &[WalletTransaction], thresholds: &RiskThresholds) -> bool {
    let mut deposited = Decimal::ZERO;
    let mut withdrawn = Decimal::ZERO;
    for t in transactions {
        if t.transaction_type == TransactionType::Deposit {
            deposited += t.amount;
        } else if is_outflow(t.transaction_type) {
            withdrawn += t.amount;
        }
    }
    deposited > Decimal::ZERO && withdrawn >= deposited * thresholds.drain_ratio
}

pub fn score_wallet(wallet: &Wallet, transactions: &[WalletTransaction], thresholds: &RiskThresholds) -> RiskReport {
    let checks: [(RiskSignal, fn(&[WalletTransaction], &RiskThresholds) -> bool); 4] = [
        (RiskSignal::LargeTransaction, has_large_transaction),
        (RiskSignal::BurstActivity, has_burst),
        (RiskSignal::RapidWithdrawal, has_rapid_withdrawal),
        (RiskSignal::DrainedBalance, is_drained),
    ];

    let signals: Vec<RiskSignal> = checks.iter()
        .filter(|(_, check)| check(transactions, thresholds))
        .map(|(signal, _)| *signal)
        .collect();

    let raw: u32 = signals.iter().map(|s| u32::from(s.weight())).sum();
    let score = raw.min(u32::from(MAX_SCORE)) as u8;

    RiskReport {
        wallet_id: wallet.id,
        user_id: wallet.user_id,
        currency: wallet.currency.clone(),
        balance: wallet.balance,
        score,
        level: RiskLevel::from_score(score),
        signals,
        transactions_considered: transactions.len(),
    }
}

pub struct RiskMonitor {
    storage: Arc<dyn StorageBackend>,
    thresholds: RiskThresholds,
}

impl RiskMonitor {
    pub fn new(storage: Arc<dyn StorageBackend>, thresholds: RiskThresholds) -> Self {
        Self { storage, thresholds }
    }

    pub fn report(&self, wallet_id: Uuid) -> Result<RiskReport, StorageError> {
        let wallet = self.storage.get_wallet(wallet_id)?;
        let transactions = self.storage.list_transactions(wallet_id)?;
        let report = score_wallet(&wallet, &transactions, &self.thresholds);
        if report.level >= RiskLevel::High {
            tracing::warn!(wallet_id = %wallet_id, score = report.score, signals = ?report.signals, "High-risk wallet");
        }
        metrics::increment_counter!("minefund_risk_reports_total");
        Ok(report)
    }

    /// Scores every wallet, highest score first.
    pub fn scan(&self) -> Result<Vec<RiskReport>, StorageError> {
        let wallets = self.storage.list_wallets(None)?;
        let mut reports = Vec::with_capacity(wallets.len());
        for wallet in &wallets {
            let transactions = self.storage.list_transactions(wallet.id)?;
            reports.push(score_wallet(wallet, &transactions, &self.thresholds));
        }
        reports.sort_by(|a, b| b.score.cmp(&a.score).then(a.wallet_id.cmp(&b.wallet_id)));

        let flagged = reports.iter().filter(|r| r.level >= RiskLevel::High).count();
        metrics::gauge!("minefund_high_risk_wallets", flagged as f64);
        tracing::debug!(wallets = reports.len(), flagged, "Risk scan complete");
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    use super::*;

    fn wallet() -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            currency: Currency::new("USD").unwrap(),
            balance: dec!(100),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn tx(wallet: &Wallet, transaction_type: TransactionType, amount: Decimal, minutes: i64) -> WalletTransaction {
        WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            transaction_type,
            amount,
            fee: Decimal::ZERO,
            net_amount: amount,
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::minutes(minutes),
        }
    }

    #[test]
    fn quiet_wallet_is_low_risk() {
        let w = wallet();
        let txs = vec![tx(&w, TransactionType::Deposit, dec!(100), 0)];
        let report = score_wallet(&w, &txs, &RiskThresholds::default());
        assert_eq!(report.score, 0);
        assert_eq!(report.level, RiskLevel::Low);
        assert!(report.signals.is_empty());
    }

    #[test]
    fn empty_history_scores_zero() {
        let w = wallet();
        let report = score_wallet(&w, &[], &RiskThresholds::default());
        assert_eq!(report.score, 0);
        assert_eq!(report.transactions_considered, 0);
    }

    #[test]
    fn large_transaction_alone_is_medium() {
        let w = wallet();
        let txs = vec![tx(&w, TransactionType::Deposit, dec!(10000), 0)];
        let report = score_wallet(&w, &txs, &RiskThresholds::default());
        assert_eq!(report.signals, vec![RiskSignal::LargeTransaction]);
        assert_eq!(report.score, 30);
        assert_eq!(report.level, RiskLevel::Medium);
    }

    #[test]
    fn burst_needs_more_than_threshold_in_window() {
        let w = wallet();
        let thresholds = RiskThresholds::default();
        let five: Vec<_> = (0..5).map(|i| tx(&w, TransactionType::Deposit, dec!(1), i)).collect();
        assert!(!has_burst(&five, &thresholds));

        let mut six = five.clone();
        six.push(tx(&w, TransactionType::Deposit, dec!(1), 30));
        assert!(has_burst(&six, &thresholds));

        let spread: Vec<_> = (0..6).map(|i| tx(&w, TransactionType::Deposit, dec!(1), i * 120)).collect();
        assert!(!has_burst(&spread, &thresholds));
    }

    #[test]
    fn deposit_then_quick_withdrawal_is_flagged() {
        let w = wallet();
        let thresholds = RiskThresholds::default();
        let quick = vec![
            tx(&w, TransactionType::Deposit, dec!(500), 0),
            tx(&w, TransactionType::Withdrawal, dec!(100), 60),
        ];
        assert!(has_rapid_withdrawal(&quick, &thresholds));

        let slow = vec![
            tx(&w, TransactionType::Deposit, dec!(500), 0),
            tx(&w, TransactionType::Withdrawal, dec!(100), 60 * 48),
        ];
        assert!(!has_rapid_withdrawal(&slow, &thresholds));
    }

    #[test]
    fn every_signal_caps_at_critical() {
        let w = wallet();
        let mut txs = vec![tx(&w, TransactionType::Deposit, dec!(20000), 0)];
        for i in 1..=6 {
            txs.push(tx(&w, TransactionType::Withdrawal, dec!(3000), i));
        }
        let report = score_wallet(&w, &txs, &RiskThresholds::default());
        assert_eq!(report.signals.len(), 4);
        assert_eq!(report.score, 100);
        assert_eq!(report.level, RiskLevel::Critical);
    }

    #[test]
    fn drain_ignores_wallets_without_deposits() {
        let w = wallet();
        let txs = vec![tx(&w, TransactionType::Withdrawal, dec!(10), 0)];
        assert!(!is_drained(&txs, &RiskThresholds::default()));
    }

    #[test]
    fn huge_windows_do_not_overflow() {
        let w = wallet();
        let thresholds = RiskThresholds {
            burst_window_hours: i64::MAX,
            rapid_withdrawal_hours: i64::MAX,
            burst_count: 1,
            ..RiskThresholds::default()
        };
        let txs = vec![
            tx(&w, TransactionType::Deposit, dec!(500), 0),
            tx(&w, TransactionType::Withdrawal, dec!(100), 60 * 24 * 365),
        ];
        let report = score_wallet(&w, &txs, &thresholds);
        assert!(report.signals.contains(&RiskSignal::BurstActivity));
        assert!(report.signals.contains(&RiskSignal::RapidWithdrawal));

        let negative = RiskThresholds { burst_window_hours: i64::MIN, ..RiskThresholds::default() };
        assert!(!has_burst(&txs, &negative));
    }

    #[test]
    fn validation_bounds_windows_and_ratios() {
        assert!(RiskThresholds::default().validate().is_ok());
        let too_long = RiskThresholds { burst_window_hours: MAX_WINDOW_HOURS + 1, ..RiskThresholds::default() };
        assert!(too_long.validate().is_err());
        let negative = RiskThresholds { rapid_withdrawal_hours: -1, ..RiskThresholds::default() };
        assert!(negative.validate().is_err());
        let ratio = RiskThresholds { drain_ratio: dec!(-0.5), ..RiskThresholds::default() };
        assert!(ratio.validate().is_err());
    }
}
