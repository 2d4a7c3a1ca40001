//! Core types and traits for minefund storage backends.
//!
//! This crate provides the `StorageBackend` trait and all associated types,
//! enabling pluggable storage implementations in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    Agent, Campaign, ChangeEvent, ChangeKind, Currency, FeeSchedule, PurchaseStatus, Record, Referral,
    SharePurchase, Table, TransactionType, Wallet, WalletTransaction,
};
pub use models::write::{
    CampaignCommand, CreateAgentCommand, CreateSharePurchaseCommand, CreateWalletCommand,
    RecordReferralCommand, RecordTransactionCommand, SetPurchaseStatusCommand, UpsertFeeScheduleCommand,
};
pub use storage::{StorageBackend, StorageError, CHANGE_CHANNEL_CAPACITY};
