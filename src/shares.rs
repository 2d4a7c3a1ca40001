use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use minefund_core::{
    CreateSharePurchaseCommand, PurchaseStatus, RecordTransactionCommand, SetPurchaseStatusCommand,
    SharePurchase, StorageError, TransactionType,
};

use crate::{
    campaigns::CampaignStatus,
    fees::{FeeBreakdown, FeeService},
    service::ServiceError,
    storage::StorageBackend,
};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SharesConfig {
    pub price_per_share: Decimal,
}

impl Default for SharesConfig {
    fn default() -> Self {
        Self { price_per_share: Decimal::ONE_HUNDRED }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    pub wallet_id: Uuid,
    pub quantity: u32,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseReceipt {
    pub purchase: SharePurchase,
    pub gross: Decimal,
    pub discount: Decimal,
    pub fee: FeeBreakdown,
}

pub struct ShareService {
    storage: Arc<dyn StorageBackend>,
    fees: Arc<FeeService>,
    config: SharesConfig,
}

impl ShareService {
    pub fn new(storage: Arc<dyn StorageBackend>, fees: Arc<FeeService>, config: SharesConfig) -> Self {
        Self { storage, fees, config }
    }

    /// Debits the wallet and files a pending purchase.
    ///
    /// A campaign discount reduces the price before fees; bonus shares are
    /// recorded on the purchase and cashback is paid out on approval.
    pub fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt, ServiceError> {
        if request.quantity == 0 {
            return Err(ServiceError::Validation("quantity must be at least 1".to_string()));
        }
        let wallet = self.storage.get_wallet(request.wallet_id)?;
        if wallet.user_id != request.user_id {
            return Err(ServiceError::Validation("wallet does not belong to the purchasing user".to_string()));
        }

        let gross = self.config.price_per_share * Decimal::from(request.quantity);
        let campaign = match request.campaign_id {
            Some(id) => {
                let campaign = self.storage.get_campaign(id)?;
                let status = CampaignStatus::of(&campaign, OffsetDateTime::now_utc());
                if status != CampaignStatus::Live {
                    return Err(ServiceError::Conflict(format!("campaign {} is not live ({:?})", id, status)));
                }
                Some(campaign)
            }
            None => None,
        };
        let discount = campaign.as_ref()
            .map(|c| gross * c.discount_percentage / Decimal::ONE_HUNDRED)
            .unwrap_or(Decimal::ZERO);
        let subtotal = gross - discount;

        let quote = self.fees.quote(TransactionType::SharePurchase, &wallet.currency, subtotal)?;
        let total_cost = subtotal + quote.breakdown.total_fee;

        self.storage.record_transaction(&RecordTransactionCommand {
            wallet_id: wallet.id,
            transaction_type: TransactionType::SharePurchase,
            amount: total_cost,
            fee: quote.breakdown.total_fee,
        })?;

        if let Some(c) = &campaign {
            if let Err(e) = self.storage.redeem_campaign(c.id) {
                tracing::warn!(campaign_id = %c.id, error = %e, "Campaign redemption failed, refunding");
                self.refund(wallet.id, total_cost)?;
                return Err(match e {
                    StorageError::CampaignExhausted(_) => ServiceError::Conflict(e.to_string()),
                    other => other.into(),
                });
            }
        }

        let filed = self.storage.create_share_purchase(&CreateSharePurchaseCommand {
            user_id: request.user_id,
            wallet_id: wallet.id,
            quantity: request.quantity,
            price_per_share: self.config.price_per_share,
            total_cost,
            campaign_id: campaign.as_ref().map(|c| c.id),
            bonus_shares: campaign.as_ref().map_or(0, |c| c.bonus_shares),
        });
        let purchase = match filed {
            Ok(purchase) => purchase,
            Err(e) => {
                tracing::warn!(wallet_id = %wallet.id, error = %e, "Filing share purchase failed, rolling back");
                if let Some(c) = &campaign {
                    if let Err(release) = self.storage.release_campaign(c.id) {
                        tracing::error!(campaign_id = %c.id, error = %release, "Campaign redemption not released");
                    }
                }
                self.refund(wallet.id, total_cost)?;
                return Err(e.into());
            }
        };

        metrics::increment_counter!("minefund_share_purchases_total");
        tracing::info!(
            purchase_id = %purchase.id,
            user_id = %purchase.user_id,
            quantity = purchase.quantity,
            bonus_shares = purchase.bonus_shares,
            %total_cost,
            "Share purchase filed"
        );
        Ok(PurchaseReceipt {
            purchase,
            gross,
            discount,
            fee: quote.breakdown,
        })
    }

    /// Approves a pending purchase and pays any campaign cashback.
    ///
    /// Only one decision can win: the status moves out of pending atomically,
    /// and a failed cashback credit puts it back.
    pub fn approve(&self, id: Uuid) -> Result<SharePurchase, ServiceError> {
        let approved = self.decide(id, PurchaseStatus::Approved)?;

        if let Some(campaign_id) = approved.campaign_id {
            let cashback = self.storage.get_campaign(campaign_id)
                .map(|c| c.cashback_amount)
                .unwrap_or_else(|e| {
                    tracing::warn!(%campaign_id, error = %e, "Campaign gone, no cashback paid");
                    Decimal::ZERO
                });
            if cashback > Decimal::ZERO {
                let paid = self.storage.record_transaction(&RecordTransactionCommand {
                    wallet_id: approved.wallet_id,
                    transaction_type: TransactionType::Cashback,
                    amount: cashback,
                    fee: Decimal::ZERO,
                });
                if let Err(e) = paid {
                    self.reopen(id, PurchaseStatus::Approved);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(purchase_id = %id, "Share purchase approved");
        Ok(approved)
    }

    /// Rejects a pending purchase and returns its full cost to the wallet.
    pub fn reject(&self, id: Uuid) -> Result<SharePurchase, ServiceError> {
        let rejected = self.decide(id, PurchaseStatus::Rejected)?;
        if let Err(e) = self.refund(rejected.wallet_id, rejected.total_cost) {
            self.reopen(id, PurchaseStatus::Rejected);
            return Err(e);
        }
        tracing::info!(purchase_id = %id, refunded = %rejected.total_cost, "Share purchase rejected");
        Ok(rejected)
    }

    pub fn list(&self, user_id: Option<Uuid>) -> Result<Vec<SharePurchase>, ServiceError> {
        Ok(self.storage.list_share_purchases(user_id)?)
    }

    fn decide(&self, id: Uuid, status: PurchaseStatus) -> Result<SharePurchase, ServiceError> {
        self.storage
            .set_purchase_status(&SetPurchaseStatusCommand {
                id,
                expected: PurchaseStatus::Pending,
                status,
            })
            .map_err(|e| match e {
                StorageError::StatusConflict { actual, .. } => {
                    ServiceError::Conflict(format!("purchase {} is already {}", id, actual))
                }
                other => other.into(),
            })
    }

    /// Puts a decided purchase back to pending after its money movement failed.
    fn reopen(&self, id: Uuid, from: PurchaseStatus) {
        let reverted = self.storage.set_purchase_status(&SetPurchaseStatusCommand {
            id,
            expected: from,
            status: PurchaseStatus::Pending,
        });
        match reverted {
            Ok(_) => tracing::warn!(purchase_id = %id, %from, "Decision rolled back, purchase pending again"),
            Err(e) => tracing::error!(purchase_id = %id, %from, error = %e, "Decision could not be rolled back"),
        }
    }

    fn refund(&self, wallet_id: Uuid, amount: Decimal) -> Result<(), ServiceError> {
        self.storage.record_transaction(&RecordTransactionCommand {
            wallet_id,
            transaction_type: TransactionType::Refund,
            amount,
            fee: Decimal::ZERO,
        })?;
        Ok(())
    }
}
