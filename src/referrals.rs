use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use minefund_core::{Agent, CreateAgentCommand, RecordReferralCommand, Referral, StorageError};

use crate::{service::ServiceError, storage::StorageBackend};

const CODE_PREFIX: &str = "AG-";
const CODE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummary {
    pub agent: Agent,
    pub referrals: usize,
    pub total_volume: Decimal,
    pub total_commission: Decimal,
}

pub fn generate_referral_code() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", CODE_PREFIX, hex[..8].to_ascii_uppercase())
}

pub fn commission_for(purchase_amount: Decimal, commission_rate: Decimal) -> Decimal {
    purchase_amount * commission_rate / Decimal::ONE_HUNDRED
}

pub struct ReferralService {
    storage: Arc<dyn StorageBackend>,
}

impl ReferralService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn register_agent(&self, user_id: Uuid, commission_rate: Decimal) -> Result<Agent, ServiceError> {
        if commission_rate < Decimal::ZERO || commission_rate > Decimal::ONE_HUNDRED {
            return Err(ServiceError::Validation("commission_rate must be between 0 and 100".to_string()));
        }

        // A code collision is retried with a fresh code; a second agent for
        // the same user is not.
        let mut last_error = None;
        for _ in 0..CODE_ATTEMPTS {
            let command = CreateAgentCommand {
                user_id,
                referral_code: generate_referral_code(),
                commission_rate,
            };
            match self.storage.create_agent(&command) {
                Ok(agent) => {
                    tracing::info!(agent_id = %agent.id, %user_id, code = %agent.referral_code, "Agent registered");
                    return Ok(agent);
                }
                Err(StorageError::AlreadyExists { key, .. }) if key == command.referral_code => {
                    tracing::debug!(code = %key, "Referral code collision, retrying");
                    last_error = Some(key);
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    return Err(ServiceError::Conflict(format!("user {} is already an agent", user_id)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "could not allocate a unique referral code (last tried {})",
            last_error.unwrap_or_default()
        )))
    }

    pub fn record_referral(&self, referral_code: &str, referred_user_id: Uuid, purchase_amount: Decimal) -> Result<Referral, ServiceError> {
        if purchase_amount < Decimal::ZERO {
            return Err(ServiceError::Validation("purchase_amount must not be negative".to_string()));
        }
        let agent = self.storage.find_agent_by_code(referral_code)?
            .ok_or_else(|| ServiceError::Validation(format!("unknown referral code: {}", referral_code)))?;
        if agent.user_id == referred_user_id {
            return Err(ServiceError::Validation("agents cannot refer themselves".to_string()));
        }

        let referral = self.storage.record_referral(&RecordReferralCommand {
            agent_id: agent.id,
            referred_user_id,
            purchase_amount,
            commission: commission_for(purchase_amount, agent.commission_rate),
        })?;
        tracing::info!(agent_id = %agent.id, %referred_user_id, commission = %referral.commission, "Referral recorded");
        Ok(referral)
    }

    pub fn agents(&self) -> Result<Vec<Agent>, ServiceError> {
        Ok(self.storage.list_agents()?)
    }

    pub fn agent(&self, id: Uuid) -> Result<Agent, ServiceError> {
        Ok(self.storage.get_agent(id)?)
    }

    /// Totals shown on the agent dashboard.
    pub fn summary(&self, agent_id: Uuid) -> Result<AgentSummary, ServiceError> {
        let agent = self.storage.get_agent(agent_id)?;
        let referrals = self.storage.list_referrals(agent_id)?;
        let (total_volume, total_commission) = referrals.iter()
            .fold((Decimal::ZERO, Decimal::ZERO), |(volume, commission), r| {
                (volume + r.purchase_amount, commission + r.commission)
            });
        Ok(AgentSummary {
            agent,
            referrals: referrals.len(),
            total_volume,
            total_commission,
        })
    }
}
