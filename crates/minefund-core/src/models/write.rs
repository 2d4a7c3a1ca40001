use rust_decimal::Decimal;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Currency, PurchaseStatus, TransactionType};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpsertFeeScheduleCommand {
    pub transaction_type: TransactionType,
    pub currency: Currency,
    pub percentage_rate: Decimal,
    pub flat_fee: Decimal,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateWalletCommand {
    pub user_id: Uuid,
    pub currency: Currency,
}

/// `fee` is already computed by the caller; the backend derives
/// `net_amount = amount - fee` and moves the balance.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordTransactionCommand {
    pub wallet_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub fee: Decimal,
}

impl RecordTransactionCommand {
    pub fn net_amount(&self) -> Decimal {
        self.amount - self.fee
    }

    /// Credits add the net amount; debits remove the gross amount.
    pub fn balance_delta(&self) -> Decimal {
        if self.transaction_type.is_credit() {
            self.net_amount()
        } else {
            -self.amount
        }
    }
}

/// Field set shared by campaign creation and full updates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CampaignCommand {
    pub name: String,
    #[serde(default)]
    pub discount_percentage: Decimal,
    #[serde(default)]
    pub bonus_shares: u32,
    #[serde(default)]
    pub cashback_amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    #[serde(default)]
    pub usage_cap: Option<u32>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSharePurchaseCommand {
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub quantity: u32,
    pub price_per_share: Decimal,
    pub total_cost: Decimal,
    pub campaign_id: Option<Uuid>,
    pub bonus_shares: u32,
}

/// Moves a purchase from `expected` to `status`; the write only happens when
/// the stored status still equals `expected`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPurchaseStatusCommand {
    pub id: Uuid,
    pub expected: PurchaseStatus,
    pub status: PurchaseStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateAgentCommand {
    pub user_id: Uuid,
    pub referral_code: String,
    pub commission_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordReferralCommand {
    pub agent_id: Uuid,
    pub referred_user_id: Uuid,
    pub purchase_amount: Decimal,
    pub commission: Decimal,
}
