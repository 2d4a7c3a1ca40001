use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{
    write::{
        CampaignCommand, CreateAgentCommand, CreateSharePurchaseCommand, CreateWalletCommand,
        RecordReferralCommand, RecordTransactionCommand, SetPurchaseStatusCommand,
        UpsertFeeScheduleCommand,
    },
    Agent, Campaign, ChangeEvent, Currency, FeeSchedule, PurchaseStatus, Referral, SharePurchase, Table,
    TransactionType, Wallet, WalletTransaction,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{table} not found: {id}")]
    NotFound { table: Table, id: String },
    #[error("{table} already exists: {key}")]
    AlreadyExists { table: Table, key: String },
    #[error("insufficient funds in wallet {0}")]
    InsufficientFunds(Uuid),
    #[error("campaign usage cap reached: {0}")]
    CampaignExhausted(Uuid),
    #[error("share purchase {id} is {actual}, expected {expected}")]
    StatusConflict {
        id: Uuid,
        expected: PurchaseStatus,
        actual: PurchaseStatus,
    },
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(table: Table, id: impl ToString) -> Self {
        StorageError::NotFound { table, id: id.to_string() }
    }
}

/// Capacity of the change-notification channel each backend owns.
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Data-access interface every service receives explicitly.
///
/// Implementations publish a [`ChangeEvent`] after each successful mutation;
/// readers that keep state between requests should follow [`StorageBackend::subscribe`]
/// instead of re-listing whole tables.
pub trait StorageBackend: Send + Sync {
    // Fee schedules, keyed by (transaction type, currency)
    fn upsert_fee_schedule(&self, command: &UpsertFeeScheduleCommand) -> Result<FeeSchedule, StorageError>;
    fn get_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<Option<FeeSchedule>, StorageError>;
    fn list_fee_schedules(&self) -> Result<Vec<FeeSchedule>, StorageError>;
    fn delete_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<(), StorageError>;

    // Wallets
    fn create_wallet(&self, command: &CreateWalletCommand) -> Result<Wallet, StorageError>;
    fn get_wallet(&self, id: Uuid) -> Result<Wallet, StorageError>;
    fn list_wallets(&self, user_id: Option<Uuid>) -> Result<Vec<Wallet>, StorageError>;
    fn record_transaction(&self, command: &RecordTransactionCommand) -> Result<WalletTransaction, StorageError>;
    fn list_transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, StorageError>;

    // Campaigns
    fn create_campaign(&self, command: &CampaignCommand) -> Result<Campaign, StorageError>;
    fn update_campaign(&self, id: Uuid, command: &CampaignCommand) -> Result<Campaign, StorageError>;
    fn get_campaign(&self, id: Uuid) -> Result<Campaign, StorageError>;
    fn list_campaigns(&self) -> Result<Vec<Campaign>, StorageError>;
    fn delete_campaign(&self, id: Uuid) -> Result<(), StorageError>;
    fn redeem_campaign(&self, id: Uuid) -> Result<Campaign, StorageError>;
    /// Gives back one redemption; `usage_count` never drops below zero.
    fn release_campaign(&self, id: Uuid) -> Result<Campaign, StorageError>;

    // Share purchases
    fn create_share_purchase(&self, command: &CreateSharePurchaseCommand) -> Result<SharePurchase, StorageError>;
    fn get_share_purchase(&self, id: Uuid) -> Result<SharePurchase, StorageError>;
    fn list_share_purchases(&self, user_id: Option<Uuid>) -> Result<Vec<SharePurchase>, StorageError>;
    /// Compare-and-set on the status; a purchase no longer in
    /// `command.expected` yields [`StorageError::StatusConflict`].
    fn set_purchase_status(&self, command: &SetPurchaseStatusCommand) -> Result<SharePurchase, StorageError>;

    // Agents and referrals
    fn create_agent(&self, command: &CreateAgentCommand) -> Result<Agent, StorageError>;
    fn get_agent(&self, id: Uuid) -> Result<Agent, StorageError>;
    fn find_agent_by_code(&self, referral_code: &str) -> Result<Option<Agent>, StorageError>;
    fn list_agents(&self) -> Result<Vec<Agent>, StorageError>;
    fn record_referral(&self, command: &RecordReferralCommand) -> Result<Referral, StorageError>;
    fn list_referrals(&self, agent_id: Uuid) -> Result<Vec<Referral>, StorageError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
