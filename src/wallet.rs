//! Shared-capital ledger: a parent wallet that allocates a single bankroll
//! across many simulated agents and settles their final equity back.
//!
//! Every successful operation appends exactly one ledger entry. The ledger
//! is append-only and is the sole source of truth: replaying it from empty
//! state must reproduce the live balances exactly. All checks happen before
//! any mutation, so a rejected call leaves the wallet unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Typed ledger invariant failures. Callers convert these into alerts;
/// they are never silently ignored.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid amount {0}: must be positive")]
    InvalidAmount(f64),
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: f64, available: f64 },
    #[error("negative final equity {0}")]
    NegativeEquity(f64),
    #[error("negative exposure {0}")]
    NegativeExposure(f64),
    #[error("leverage ceiling exceeded for {account}: exposure {requested} > {limit}")]
    LeverageExceeded {
        account: String,
        requested: f64,
        limit: f64,
    },
    #[error("aggregate exposure {requested} exceeds wallet limit {limit}")]
    ExposureLimitExceeded { requested: f64, limit: f64 },
    #[error("unknown account: {0}")]
    UnknownAccount(String),
}

/// Kind of ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Allocate,
    Settle,
    ExposureUpdate,
}

/// One append-only ledger record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub entry_type: LedgerEntryType,
    pub account: String,
    pub amount: f64,
    pub balance_after: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Event on a per-agent virtual account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub amount: f64,
    pub balance_after: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Trade recorded against a virtual account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountTrade {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub notional: f64,
    pub pnl: f64,
}

/// Per-agent ledger for the duration of one cohort run.
/// Invariant: balance == starting_balance + Σ event amounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub account_id: String,
    pub starting_balance: f64,
    pub balance: f64,
    #[serde(default)]
    pub leverage_limit: Option<f64>,
    /// Open notional by symbol
    #[serde(default)]
    pub positions: HashMap<String, f64>,
    #[serde(default)]
    pub trades: Vec<AccountTrade>,
    #[serde(default)]
    pub events: Vec<AccountEvent>,
}

impl VirtualAccount {
    pub fn new(account_id: &str, starting_balance: f64, leverage_limit: Option<f64>) -> Self {
        Self {
            account_id: account_id.to_string(),
            starting_balance,
            balance: starting_balance,
            leverage_limit,
            positions: HashMap::new(),
            trades: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Append an event and move the balance by its amount
    pub fn apply_event(&mut self, event_type: &str, amount: f64, metadata: serde_json::Value) {
        self.balance += amount;
        self.events.push(AccountEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            amount,
            balance_after: self.balance,
            metadata,
        });
    }

    /// Record a closed trade: logs it and applies its pnl as an event
    pub fn record_trade(&mut self, symbol: &str, side: &str, notional: f64, pnl: f64) {
        self.trades.push(AccountTrade {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            notional,
            pnl,
        });
        self.apply_event(
            "trade_pnl",
            pnl,
            serde_json::json!({ "symbol": symbol, "notional": notional }),
        );
    }

    pub fn set_position(&mut self, symbol: &str, notional: f64) {
        if notional.abs() < f64::EPSILON {
            self.positions.remove(symbol);
        } else {
            self.positions.insert(symbol.to_string(), notional);
        }
    }

    pub fn open_notional(&self) -> f64 {
        self.positions.values().map(|n| n.abs()).sum()
    }

    /// Balance must equal starting balance plus the running event sum
    pub fn ledger_consistent(&self) -> bool {
        let event_sum: f64 = self.events.iter().map(|e| e.amount).sum();
        (self.starting_balance + event_sum - self.balance).abs() < 1e-9
    }
}

/// Shared capital pool for one cohort.
///
/// Invariants, enforced at call time:
/// (a) balance + Σ capital_outstanding == starting_balance + realized_pnl
/// (b) per-account exposure ≤ outstanding × leverage_ceiling when a ceiling is set
/// (c) Σ current_exposures ≤ exposure_limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentWallet {
    pub starting_balance: f64,
    pub balance: f64,
    pub exposure_limit: f64,
    #[serde(default)]
    pub leverage_ceiling: Option<f64>,
    #[serde(default)]
    pub capital_assigned: HashMap<String, f64>,
    #[serde(default)]
    pub capital_outstanding: HashMap<String, f64>,
    #[serde(default)]
    pub current_exposures: HashMap<String, f64>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
}

impl ParentWallet {
    /// Exposure limit defaults to the starting balance
    pub fn new(starting_balance: f64, leverage_ceiling: Option<f64>) -> Self {
        Self {
            starting_balance,
            balance: starting_balance,
            exposure_limit: starting_balance,
            leverage_ceiling,
            capital_assigned: HashMap::new(),
            capital_outstanding: HashMap::new(),
            current_exposures: HashMap::new(),
            realized_pnl: 0.0,
            ledger: Vec::new(),
        }
    }

    pub fn with_exposure_limit(mut self, limit: f64) -> Self {
        self.exposure_limit = limit;
        self
    }

    /// Debit the pool and hand capital to an account
    pub fn allocate(&mut self, account: &str, amount: f64) -> Result<(), LedgerError> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if amount > self.balance {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        *self.capital_assigned.entry(account.to_string()).or_insert(0.0) += amount;
        *self.capital_outstanding.entry(account.to_string()).or_insert(0.0) += amount;
        self.append(LedgerEntryType::Allocate, account, amount, serde_json::Value::Null);

        info!(
            account = account,
            amount = amount,
            balance = self.balance,
            "capital allocated"
        );
        Ok(())
    }

    /// Fold an account's final equity back into the pool. Returns the
    /// realized pnl (final_equity − outstanding capital).
    pub fn settle(&mut self, account: &str, final_equity: f64) -> Result<f64, LedgerError> {
        if final_equity < 0.0 {
            return Err(LedgerError::NegativeEquity(final_equity));
        }
        if !self.capital_assigned.contains_key(account) {
            return Err(LedgerError::UnknownAccount(account.to_string()));
        }

        let outstanding = self.capital_outstanding.get(account).copied().unwrap_or(0.0);
        let pnl = final_equity - outstanding;

        self.balance += final_equity;
        self.capital_outstanding.insert(account.to_string(), 0.0);
        self.current_exposures.insert(account.to_string(), 0.0);
        self.realized_pnl += pnl;
        self.append(
            LedgerEntryType::Settle,
            account,
            final_equity,
            serde_json::json!({ "pnl": pnl, "outstanding": outstanding }),
        );

        info!(
            account = account,
            final_equity = final_equity,
            pnl = pnl,
            realized_pnl = self.realized_pnl,
            "account settled"
        );
        Ok(pnl)
    }

    /// Record an account's current notional exposure. Both the per-account
    /// leverage check and the aggregate exposure check run before any
    /// mutation: a rejected call leaves the wallet untouched.
    pub fn update_exposure(&mut self, account: &str, notional: f64) -> Result<(), LedgerError> {
        if notional < 0.0 {
            return Err(LedgerError::NegativeExposure(notional));
        }

        if let Some(ceiling) = self.leverage_ceiling {
            let outstanding = self.capital_outstanding.get(account).copied().unwrap_or(0.0);
            let limit = outstanding * ceiling;
            if notional > limit {
                warn!(
                    account = account,
                    notional = notional,
                    limit = limit,
                    "leverage ceiling exceeded"
                );
                return Err(LedgerError::LeverageExceeded {
                    account: account.to_string(),
                    requested: notional,
                    limit,
                });
            }
        }

        let current = self.current_exposures.get(account).copied().unwrap_or(0.0);
        let total: f64 = self.current_exposures.values().sum::<f64>() - current + notional;
        if total > self.exposure_limit {
            warn!(
                account = account,
                requested_total = total,
                limit = self.exposure_limit,
                "aggregate exposure limit exceeded"
            );
            return Err(LedgerError::ExposureLimitExceeded {
                requested: total,
                limit: self.exposure_limit,
            });
        }

        self.current_exposures.insert(account.to_string(), notional);
        self.append(
            LedgerEntryType::ExposureUpdate,
            account,
            notional,
            serde_json::Value::Null,
        );
        Ok(())
    }

    /// Total capital currently out with accounts
    pub fn total_outstanding(&self) -> f64 {
        self.capital_outstanding.values().sum()
    }

    /// Invariant (a): balance + Σ outstanding == starting_balance + realized_pnl
    pub fn balanced(&self) -> bool {
        let lhs = self.balance + self.total_outstanding();
        let rhs = self.starting_balance + self.realized_pnl;
        (lhs - rhs).abs() < 1e-6
    }

    /// Rebuild a wallet from this one's ledger alone. Used to verify the
    /// ledger is a complete record of state.
    pub fn replay(&self) -> ParentWallet {
        let mut wallet = ParentWallet::new(self.starting_balance, self.leverage_ceiling)
            .with_exposure_limit(self.exposure_limit);
        for entry in &self.ledger {
            match entry.entry_type {
                LedgerEntryType::Allocate => {
                    wallet.balance -= entry.amount;
                    *wallet
                        .capital_assigned
                        .entry(entry.account.clone())
                        .or_insert(0.0) += entry.amount;
                    *wallet
                        .capital_outstanding
                        .entry(entry.account.clone())
                        .or_insert(0.0) += entry.amount;
                }
                LedgerEntryType::Settle => {
                    let outstanding = wallet
                        .capital_outstanding
                        .get(&entry.account)
                        .copied()
                        .unwrap_or(0.0);
                    wallet.balance += entry.amount;
                    wallet.realized_pnl += entry.amount - outstanding;
                    wallet.capital_outstanding.insert(entry.account.clone(), 0.0);
                    wallet.current_exposures.insert(entry.account.clone(), 0.0);
                }
                LedgerEntryType::ExposureUpdate => {
                    wallet
                        .current_exposures
                        .insert(entry.account.clone(), entry.amount);
                }
            }
            wallet.ledger.push(entry.clone());
        }
        wallet
    }

    fn append(
        &mut self,
        entry_type: LedgerEntryType,
        account: &str,
        amount: f64,
        metadata: serde_json::Value,
    ) {
        self.ledger.push(LedgerEntry {
            timestamp: Utc::now(),
            entry_type,
            account: account.to_string(),
            amount,
            balance_after: self.balance,
            metadata,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_wallet() {
        let wallet = ParentWallet::new(1000.0, Some(3.0));
        assert_eq!(wallet.balance, 1000.0);
        assert_eq!(wallet.exposure_limit, 1000.0);
        assert_eq!(wallet.realized_pnl, 0.0);
        assert!(wallet.ledger.is_empty());
        assert!(wallet.balanced());
    }

    #[test]
    fn test_allocate_moves_capital() {
        let mut wallet = ParentWallet::new(1000.0, None);
        wallet.allocate("agent-1", 400.0).unwrap();

        assert_eq!(wallet.balance, 600.0);
        assert_eq!(wallet.capital_assigned["agent-1"], 400.0);
        assert_eq!(wallet.capital_outstanding["agent-1"], 400.0);
        assert_eq!(wallet.ledger.len(), 1);
        assert_eq!(wallet.ledger[0].entry_type, LedgerEntryType::Allocate);
        assert!(wallet.balanced());
    }

    #[test]
    fn test_allocate_rejects_non_positive() {
        let mut wallet = ParentWallet::new(1000.0, None);
        assert!(matches!(
            wallet.allocate("a", 0.0),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            wallet.allocate("a", -5.0),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(wallet.ledger.is_empty());
        assert_eq!(wallet.balance, 1000.0);
    }

    #[test]
    fn test_allocate_rejects_overdraft() {
        let mut wallet = ParentWallet::new(100.0, None);
        let err = wallet.allocate("a", 150.0).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        assert_eq!(wallet.balance, 100.0);
        assert!(wallet.ledger.is_empty());
    }

    #[test]
    fn test_settle_profit() {
        let mut wallet = ParentWallet::new(1000.0, None);
        wallet.allocate("a", 300.0).unwrap();

        let pnl = wallet.settle("a", 350.0).unwrap();
        assert_eq!(pnl, 50.0);
        assert_eq!(wallet.balance, 1050.0);
        assert_eq!(wallet.realized_pnl, 50.0);
        assert_eq!(wallet.capital_outstanding["a"], 0.0);
        assert!(wallet.balanced());
    }

    #[test]
    fn test_settle_loss() {
        let mut wallet = ParentWallet::new(1000.0, None);
        wallet.allocate("a", 300.0).unwrap();

        let pnl = wallet.settle("a", 200.0).unwrap();
        assert_eq!(pnl, -100.0);
        assert_eq!(wallet.balance, 900.0);
        assert_eq!(wallet.realized_pnl, -100.0);
        assert!(wallet.balanced());
    }

    #[test]
    fn test_settle_rejects_negative_equity() {
        let mut wallet = ParentWallet::new(1000.0, None);
        wallet.allocate("a", 300.0).unwrap();
        assert!(matches!(
            wallet.settle("a", -1.0),
            Err(LedgerError::NegativeEquity(_))
        ));
        assert_eq!(wallet.capital_outstanding["a"], 300.0);
    }

    #[test]
    fn test_settle_unknown_account() {
        let mut wallet = ParentWallet::new(1000.0, None);
        assert!(matches!(
            wallet.settle("ghost", 100.0),
            Err(LedgerError::UnknownAccount(_))
        ));
    }

    #[test]
    fn test_settle_zeroes_exposure() {
        let mut wallet = ParentWallet::new(1000.0, Some(3.0));
        wallet.allocate("a", 300.0).unwrap();
        wallet.update_exposure("a", 500.0).unwrap();

        wallet.settle("a", 310.0).unwrap();
        assert_eq!(wallet.current_exposures["a"], 0.0);
    }

    #[test]
    fn test_balance_invariant_over_sequence() {
        let mut wallet = ParentWallet::new(900.0, None);
        wallet.allocate("a", 300.0).unwrap();
        assert!(wallet.balanced());
        wallet.allocate("b", 300.0).unwrap();
        assert!(wallet.balanced());
        wallet.allocate("c", 300.0).unwrap();
        assert!(wallet.balanced());
        wallet.settle("a", 330.0).unwrap();
        assert!(wallet.balanced());
        wallet.settle("b", 250.0).unwrap();
        assert!(wallet.balanced());
        wallet.allocate("a", 100.0).unwrap();
        assert!(wallet.balanced());
        wallet.settle("c", 300.0).unwrap();
        assert!(wallet.balanced());
        wallet.settle("a", 90.0).unwrap();
        assert!(wallet.balanced());
        // Net pnl: +30 -50 +0 -10 = -30
        assert!((wallet.realized_pnl + 30.0).abs() < 1e-9);
        assert!((wallet.balance - 870.0).abs() < 1e-9);
    }

    #[test]
    fn test_update_exposure_leverage_ceiling() {
        let mut wallet = ParentWallet::new(1000.0, Some(2.0));
        wallet.allocate("a", 100.0).unwrap();

        wallet.update_exposure("a", 200.0).unwrap();
        let err = wallet.update_exposure("a", 201.0).unwrap_err();
        assert!(matches!(err, LedgerError::LeverageExceeded { .. }));
        // Previous exposure survives the rejected call
        assert_eq!(wallet.current_exposures["a"], 200.0);
    }

    #[test]
    fn test_update_exposure_zero_outstanding_rejected() {
        let mut wallet = ParentWallet::new(1000.0, Some(3.0));
        let err = wallet.update_exposure("a", 10.0).unwrap_err();
        assert!(matches!(err, LedgerError::LeverageExceeded { .. }));
    }

    #[test]
    fn test_update_exposure_aggregate_limit() {
        let mut wallet = ParentWallet::new(1000.0, None).with_exposure_limit(500.0);
        wallet.allocate("a", 300.0).unwrap();
        wallet.allocate("b", 300.0).unwrap();

        wallet.update_exposure("a", 300.0).unwrap();
        let err = wallet.update_exposure("b", 300.0).unwrap_err();
        assert!(matches!(err, LedgerError::ExposureLimitExceeded { .. }));
    }

    #[test]
    fn test_rejected_exposure_update_is_atomic() {
        let mut wallet = ParentWallet::new(1000.0, None).with_exposure_limit(400.0);
        wallet.allocate("a", 200.0).unwrap();
        wallet.update_exposure("a", 100.0).unwrap();

        let exposures_before = wallet.current_exposures.clone();
        let balance_before = wallet.balance;
        let ledger_len_before = wallet.ledger.len();

        assert!(wallet.update_exposure("a", 500.0).is_err());

        assert_eq!(wallet.current_exposures, exposures_before);
        assert_eq!(wallet.balance, balance_before);
        assert_eq!(wallet.ledger.len(), ledger_len_before);
    }

    #[test]
    fn test_replacing_exposure_not_additive() {
        let mut wallet = ParentWallet::new(1000.0, None).with_exposure_limit(600.0);
        wallet.allocate("a", 500.0).unwrap();

        wallet.update_exposure("a", 400.0).unwrap();
        // New exposure replaces the old one; 500 alone is under the limit
        wallet.update_exposure("a", 500.0).unwrap();
        assert_eq!(wallet.current_exposures["a"], 500.0);
    }

    #[test]
    fn test_each_op_appends_one_entry() {
        let mut wallet = ParentWallet::new(1000.0, Some(5.0));
        wallet.allocate("a", 200.0).unwrap();
        wallet.update_exposure("a", 300.0).unwrap();
        wallet.settle("a", 220.0).unwrap();
        assert_eq!(wallet.ledger.len(), 3);
        assert_eq!(wallet.ledger[0].entry_type, LedgerEntryType::Allocate);
        assert_eq!(wallet.ledger[1].entry_type, LedgerEntryType::ExposureUpdate);
        assert_eq!(wallet.ledger[2].entry_type, LedgerEntryType::Settle);
    }

    #[test]
    fn test_replay_reproduces_state() {
        let mut wallet = ParentWallet::new(900.0, Some(3.0)).with_exposure_limit(2000.0);
        wallet.allocate("a", 300.0).unwrap();
        wallet.allocate("b", 300.0).unwrap();
        wallet.update_exposure("a", 600.0).unwrap();
        wallet.settle("a", 350.0).unwrap();
        wallet.update_exposure("b", 450.0).unwrap();
        wallet.settle("b", 280.0).unwrap();

        let replayed = wallet.replay();
        assert!((replayed.balance - wallet.balance).abs() < 1e-9);
        assert!((replayed.realized_pnl - wallet.realized_pnl).abs() < 1e-9);
        assert_eq!(replayed.capital_outstanding, wallet.capital_outstanding);
        assert_eq!(replayed.current_exposures, wallet.current_exposures);
        assert_eq!(replayed.ledger.len(), wallet.ledger.len());
    }

    #[test]
    fn test_virtual_account_event_invariant() {
        let mut account = VirtualAccount::new("agent-1", 500.0, Some(2.0));
        account.apply_event("funding", 100.0, serde_json::Value::Null);
        account.record_trade("BTC", "long", 1000.0, -40.0);
        account.record_trade("ETH", "short", 500.0, 25.0);

        assert!(account.ledger_consistent());
        assert_eq!(account.balance, 585.0);
        assert_eq!(account.events.len(), 3);
        assert_eq!(account.trades.len(), 2);
        // Events carry a running balance
        assert_eq!(account.events[0].balance_after, 600.0);
        assert_eq!(account.events[1].balance_after, 560.0);
        assert_eq!(account.events[2].balance_after, 585.0);
    }

    #[test]
    fn test_virtual_account_positions() {
        let mut account = VirtualAccount::new("agent-1", 500.0, None);
        account.set_position("BTC", 300.0);
        account.set_position("ETH", -200.0);
        assert_eq!(account.open_notional(), 500.0);

        account.set_position("BTC", 0.0);
        assert_eq!(account.open_notional(), 200.0);
        assert!(!account.positions.contains_key("BTC"));
    }

    #[test]
    fn test_ledger_entry_serialization() {
        let mut wallet = ParentWallet::new(100.0, None);
        wallet.allocate("a", 50.0).unwrap();
        let json = serde_json::to_string(&wallet.ledger[0]).unwrap();
        let decoded: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.entry_type, LedgerEntryType::Allocate);
        assert_eq!(decoded.amount, 50.0);
    }
}
