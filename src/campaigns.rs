use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use minefund_core::{Campaign, CampaignCommand};

use crate::{
    service::ServiceError,
    storage::StorageBackend,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Scheduled,
    Live,
    Expired,
    Exhausted,
    Disabled,
}

impl CampaignStatus {
    /// Disabled wins over everything, then the usage cap, then the window.
    pub fn of(campaign: &Campaign, now: OffsetDateTime) -> Self {
        if !campaign.active {
            CampaignStatus::Disabled
        } else if campaign.is_exhausted() {
            CampaignStatus::Exhausted
        } else if now < campaign.starts_at {
            CampaignStatus::Scheduled
        } else if now >= campaign.ends_at {
            CampaignStatus::Expired
        } else {
            CampaignStatus::Live
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignView {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub status: CampaignStatus,
}

/// Views ordered by start time, with status derived at `now`.
pub fn views(campaigns: Vec<Campaign>, now: OffsetDateTime) -> Vec<CampaignView> {
    let mut views: Vec<_> = campaigns
        .into_iter()
        .map(|c| CampaignView { status: CampaignStatus::of(&c, now), campaign: c })
        .collect();
    views.sort_by_key(|v| (v.campaign.starts_at, v.campaign.id));
    views
}

pub fn validate_campaign(command: &CampaignCommand) -> Result<(), ServiceError> {
    let invalid = |msg: &str| Err(ServiceError::Validation(msg.to_string()));

    if command.name.trim().is_empty() {
        return invalid("campaign name must not be empty");
    }
    if command.discount_percentage < Decimal::ZERO || command.discount_percentage > Decimal::ONE_HUNDRED {
        return invalid("discount_percentage must be between 0 and 100");
    }
    if command.cashback_amount < Decimal::ZERO {
        return invalid("cashback_amount must not be negative");
    }
    if command.ends_at <= command.starts_at {
        return invalid("ends_at must be after starts_at");
    }
    if command.usage_cap == Some(0) {
        return invalid("usage_cap must be at least 1");
    }
    Ok(())
}

pub struct CampaignService {
    storage: Arc<dyn StorageBackend>,
}

impl CampaignService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn create(&self, command: &CampaignCommand) -> Result<CampaignView, ServiceError> {
        validate_campaign(command)?;
        let campaign = self.storage.create_campaign(command)?;
        tracing::info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        Ok(self.view(campaign))
    }

    pub fn update(&self, id: Uuid, command: &CampaignCommand) -> Result<CampaignView, ServiceError> {
        validate_campaign(command)?;
        let existing = self.storage.get_campaign(id)?;
        if let Some(cap) = command.usage_cap {
            if cap < existing.usage_count {
                return Err(ServiceError::Validation(format!(
                    "usage_cap {} is below the {} redemptions already made",
                    cap, existing.usage_count
                )));
            }
        }
        let campaign = self.storage.update_campaign(id, command)?;
        tracing::info!(campaign_id = %id, "Campaign updated");
        Ok(self.view(campaign))
    }

    pub fn get(&self, id: Uuid) -> Result<CampaignView, ServiceError> {
        Ok(self.view(self.storage.get_campaign(id)?))
    }

    pub fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        self.storage.delete_campaign(id)?;
        tracing::info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    fn view(&self, campaign: Campaign) -> CampaignView {
        CampaignView {
            status: CampaignStatus::of(&campaign, OffsetDateTime::now_utc()),
            campaign,
        }
    }
}
