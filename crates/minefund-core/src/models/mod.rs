use std::{fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    SharePurchase,
    Commission,
    Refund,
    Cashback,
}

impl TransactionType {
    pub const ALL: [TransactionType; 7] = [
        TransactionType::Deposit,
        TransactionType::Withdrawal,
        TransactionType::Transfer,
        TransactionType::SharePurchase,
        TransactionType::Commission,
        TransactionType::Refund,
        TransactionType::Cashback,
    ];

    /// True when the transaction adds funds to the wallet.
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Deposit
                | TransactionType::Commission
                | TransactionType::Refund
                | TransactionType::Cashback
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::SharePurchase => "share_purchase",
            TransactionType::Commission => "commission",
            TransactionType::Refund => "refund",
            TransactionType::Cashback => "cashback",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("unknown transaction type: {}", s))
    }
}

/// Upper-case currency code such as `USD` or `USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(Arc<str>);

impl Currency {
    pub fn new(code: &str) -> Result<Self, String> {
        let code = code.trim();
        if !(3..=5).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("invalid currency code: {}", code));
        }
        Ok(Currency(Arc::from(code.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Currency::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Currency::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub id: Uuid,
    pub transaction_type: TransactionType,
    pub currency: Currency,
    /// Percent, e.g. `2.5` for 2.5%.
    pub percentage_rate: Decimal,
    pub flat_fee: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub balance: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WalletTransaction {
    /// Signed change this transaction applied to the wallet balance.
    pub fn balance_delta(&self) -> Decimal {
        if self.transaction_type.is_credit() {
            self.net_amount
        } else {
            -self.amount
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub discount_percentage: Decimal,
    pub bonus_shares: u32,
    pub cashback_amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub usage_cap: Option<u32>,
    pub usage_count: u32,
    pub active: bool,
}

impl Campaign {
    pub fn is_exhausted(&self) -> bool {
        matches!(self.usage_cap, Some(cap) if self.usage_count >= cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Approved,
    Rejected,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Approved => "approved",
            PurchaseStatus::Rejected => "rejected",
        }
    }
}

impl Display for PurchaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PurchaseStatus::Pending),
            "approved" => Ok(PurchaseStatus::Approved),
            "rejected" => Ok(PurchaseStatus::Rejected),
            _ => Err(format!("unknown purchase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharePurchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub quantity: u32,
    pub price_per_share: Decimal,
    /// Amount debited from the wallet, fees included.
    pub total_cost: Decimal,
    pub campaign_id: Option<Uuid>,
    pub bonus_shares: u32,
    pub status: PurchaseStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub referral_code: String,
    pub commission_rate: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub referred_user_id: Uuid,
    pub purchase_amount: Decimal,
    pub commission: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    FeeSchedules,
    Wallets,
    WalletTransactions,
    Campaigns,
    SharePurchases,
    Agents,
    Referrals,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::FeeSchedules => "fee_schedules",
            Table::Wallets => "wallets",
            Table::WalletTransactions => "wallet_transactions",
            Table::Campaigns => "campaigns",
            Table::SharePurchases => "share_purchases",
            Table::Agents => "agents",
            Table::Referrals => "referrals",
        }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of any table, as carried by change notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    FeeSchedule(FeeSchedule),
    Wallet(Wallet),
    WalletTransaction(WalletTransaction),
    Campaign(Campaign),
    SharePurchase(SharePurchase),
    Agent(Agent),
    Referral(Referral),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::FeeSchedule(_) => Table::FeeSchedules,
            Record::Wallet(_) => Table::Wallets,
            Record::WalletTransaction(_) => Table::WalletTransactions,
            Record::Campaign(_) => Table::Campaigns,
            Record::SharePurchase(_) => Table::SharePurchases,
            Record::Agent(_) => Table::Agents,
            Record::Referral(_) => Table::Referrals,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Record::FeeSchedule(r) => r.id,
            Record::Wallet(r) => r.id,
            Record::WalletTransaction(r) => r.id,
            Record::Campaign(r) => r.id,
            Record::SharePurchase(r) => r.id,
            Record::Agent(r) => r.id,
            Record::Referral(r) => r.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Published by a storage backend after every successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub id: Uuid,
    /// The row after the change; `None` for deletes.
    pub record: Option<Record>,
}

impl ChangeEvent {
    pub fn inserted(record: Record) -> Self {
        Self {
            table: record.table(),
            kind: ChangeKind::Insert,
            id: record.id(),
            record: Some(record),
        }
    }

    pub fn updated(record: Record) -> Self {
        Self {
            table: record.table(),
            kind: ChangeKind::Update,
            id: record.id(),
            record: Some(record),
        }
    }

    pub fn deleted(table: Table, id: Uuid) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            id,
            record: None,
        }
    }
}
