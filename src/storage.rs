use std::{collections::BTreeMap, sync::RwLock};

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use minefund_core::{
    Agent, Campaign, CampaignCommand, ChangeEvent, CreateAgentCommand, CreateSharePurchaseCommand,
    CreateWalletCommand, Currency, FeeSchedule, PurchaseStatus, Record, RecordReferralCommand,
    RecordTransactionCommand, Referral, SetPurchaseStatusCommand, SharePurchase, Table,
    TransactionType, UpsertFeeScheduleCommand, Wallet, WalletTransaction, CHANGE_CHANNEL_CAPACITY,
};

// Re-export core storage types so callers can use crate::storage::*
pub use minefund_core::storage::{StorageBackend, StorageError};

#[derive(Default)]
struct Tables {
    fee_schedules: BTreeMap<(TransactionType, Currency), FeeSchedule>,
    wallets: BTreeMap<Uuid, Wallet>,
    transactions: BTreeMap<Uuid, Vec<WalletTransaction>>,
    campaigns: BTreeMap<Uuid, Campaign>,
    purchases: BTreeMap<Uuid, SharePurchase>,
    agents: BTreeMap<Uuid, Agent>,
    referrals: BTreeMap<Uuid, Vec<Referral>>,
}

/// Process-local backend, used by tests and single-node deployments.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            changes,
        }
    }

    /// Callers hold the table write lock so events leave in commit order.
    fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.changes.send(event);
    }
}

fn check_non_negative(field: &str, value: Decimal) -> Result<(), StorageError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(StorageError::Invalid(format!("{} must not be negative", field)));
    }
    Ok(())
}

fn by_creation<T, F: Fn(&T) -> (OffsetDateTime, Uuid)>(mut rows: Vec<T>, key: F) -> Vec<T> {
    rows.sort_by_key(|r| key(r));
    rows
}

impl StorageBackend for InMemoryStorage {
    fn upsert_fee_schedule(&self, command: &UpsertFeeScheduleCommand) -> Result<FeeSchedule, StorageError> {
        check_non_negative("percentage_rate", command.percentage_rate)?;
        check_non_negative("flat_fee", command.flat_fee)?;

        let key = (command.transaction_type, command.currency.clone());
        let mut tables = self.tables.write().unwrap();
        let (schedule, event) = match tables.fee_schedules.get(&key) {
            Some(existing) => {
                let schedule = FeeSchedule {
                    percentage_rate: command.percentage_rate,
                    flat_fee: command.flat_fee,
                    updated_at: OffsetDateTime::now_utc(),
                    ..existing.clone()
                };
                (schedule.clone(), ChangeEvent::updated(Record::FeeSchedule(schedule)))
            }
            None => {
                let schedule = FeeSchedule {
                    id: Uuid::new_v4(),
                    transaction_type: command.transaction_type,
                    currency: command.currency.clone(),
                    percentage_rate: command.percentage_rate,
                    flat_fee: command.flat_fee,
                    updated_at: OffsetDateTime::now_utc(),
                };
                (schedule.clone(), ChangeEvent::inserted(Record::FeeSchedule(schedule)))
            }
        };
        tables.fee_schedules.insert(key, schedule.clone());
        self.publish(event);
        drop(tables);

        tracing::debug!(transaction_type = %schedule.transaction_type, currency = %schedule.currency, "Fee schedule stored");
        Ok(schedule)
    }

    fn get_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<Option<FeeSchedule>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables.fee_schedules.get(&(transaction_type, currency.clone())).cloned())
    }

    fn list_fee_schedules(&self) -> Result<Vec<FeeSchedule>, StorageError> {
        Ok(self.tables.read().unwrap().fee_schedules.values().cloned().collect())
    }

    fn delete_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<(), StorageError> {
        let mut tables = self.tables.write().unwrap();
        let removed = tables.fee_schedules
            .remove(&(transaction_type, currency.clone()))
            .ok_or_else(|| StorageError::not_found(Table::FeeSchedules, format!("{}/{}", transaction_type, currency)))?;
        self.publish(ChangeEvent::deleted(Table::FeeSchedules, removed.id));
        Ok(())
    }

    fn create_wallet(&self, command: &CreateWalletCommand) -> Result<Wallet, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let duplicate = tables.wallets.values()
            .any(|w| w.user_id == command.user_id && w.currency == command.currency);
        if duplicate {
            return Err(StorageError::AlreadyExists {
                table: Table::Wallets,
                key: format!("{}/{}", command.user_id, command.currency),
            });
        }

        let wallet = Wallet {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            currency: command.currency.clone(),
            balance: Decimal::ZERO,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.wallets.insert(wallet.id, wallet.clone());
        self.publish(ChangeEvent::inserted(Record::Wallet(wallet.clone())));
        Ok(wallet)
    }

    fn get_wallet(&self, id: Uuid) -> Result<Wallet, StorageError> {
        self.tables.read().unwrap()
            .wallets
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(Table::Wallets, id))
    }

    fn list_wallets(&self, user_id: Option<Uuid>) -> Result<Vec<Wallet>, StorageError> {
        let tables = self.tables.read().unwrap();
        let rows = tables.wallets.values()
            .filter(|w| user_id.map_or(true, |u| w.user_id == u))
            .cloned()
            .collect();
        Ok(by_creation(rows, |w: &Wallet| (w.created_at, w.id)))
    }

    fn record_transaction(&self, command: &RecordTransactionCommand) -> Result<WalletTransaction, StorageError> {
        check_non_negative("amount", command.amount)?;
        check_non_negative("fee", command.fee)?;

        let mut tables = self.tables.write().unwrap();
        let wallet = tables.wallets.get_mut(&command.wallet_id)
            .ok_or_else(|| StorageError::not_found(Table::Wallets, command.wallet_id))?;

        let new_balance = wallet.balance + command.balance_delta();
        if new_balance.is_sign_negative() && !new_balance.is_zero() {
            return Err(StorageError::InsufficientFunds(command.wallet_id));
        }
        wallet.balance = new_balance;
        let wallet = wallet.clone();

        let transaction = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: command.wallet_id,
            transaction_type: command.transaction_type,
            amount: command.amount,
            fee: command.fee,
            net_amount: command.net_amount(),
            created_at: OffsetDateTime::now_utc(),
        };
        tables.transactions.entry(command.wallet_id).or_default().push(transaction.clone());
        tracing::debug!(wallet_id = %wallet.id, balance = %wallet.balance, "Wallet balance updated");
        self.publish(ChangeEvent::inserted(Record::WalletTransaction(transaction.clone())));
        self.publish(ChangeEvent::updated(Record::Wallet(wallet)));
        Ok(transaction)
    }

    fn list_transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, StorageError> {
        let tables = self.tables.read().unwrap();
        if !tables.wallets.contains_key(&wallet_id) {
            return Err(StorageError::not_found(Table::Wallets, wallet_id));
        }
        Ok(tables.transactions.get(&wallet_id).cloned().unwrap_or_default())
    }

    fn create_campaign(&self, command: &CampaignCommand) -> Result<Campaign, StorageError> {
        let campaign = Campaign {
            id: Uuid::new_v4(),
            name: command.name.clone(),
            discount_percentage: command.discount_percentage,
            bonus_shares: command.bonus_shares,
            cashback_amount: command.cashback_amount,
            starts_at: command.starts_at,
            ends_at: command.ends_at,
            usage_cap: command.usage_cap,
            usage_count: 0,
            active: command.active,
        };
        let mut tables = self.tables.write().unwrap();
        tables.campaigns.insert(campaign.id, campaign.clone());
        self.publish(ChangeEvent::inserted(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn update_campaign(&self, id: Uuid, command: &CampaignCommand) -> Result<Campaign, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let campaign = tables.campaigns.get_mut(&id)
            .ok_or_else(|| StorageError::not_found(Table::Campaigns, id))?;
        campaign.name = command.name.clone();
        campaign.discount_percentage = command.discount_percentage;
        campaign.bonus_shares = command.bonus_shares;
        campaign.cashback_amount = command.cashback_amount;
        campaign.starts_at = command.starts_at;
        campaign.ends_at = command.ends_at;
        campaign.usage_cap = command.usage_cap;
        campaign.active = command.active;
        let campaign = campaign.clone();
        self.publish(ChangeEvent::updated(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn get_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        self.tables.read().unwrap()
            .campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(Table::Campaigns, id))
    }

    fn list_campaigns(&self) -> Result<Vec<Campaign>, StorageError> {
        let mut rows: Vec<Campaign> = self.tables.read().unwrap().campaigns.values().cloned().collect();
        rows.sort_by_key(|c| (c.starts_at, c.id));
        Ok(rows)
    }

    fn delete_campaign(&self, id: Uuid) -> Result<(), StorageError> {
        let mut tables = self.tables.write().unwrap();
        tables.campaigns
            .remove(&id)
            .ok_or_else(|| StorageError::not_found(Table::Campaigns, id))?;
        self.publish(ChangeEvent::deleted(Table::Campaigns, id));
        Ok(())
    }

    fn redeem_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let campaign = tables.campaigns.get_mut(&id)
            .ok_or_else(|| StorageError::not_found(Table::Campaigns, id))?;
        if campaign.is_exhausted() {
            return Err(StorageError::CampaignExhausted(id));
        }
        campaign.usage_count += 1;
        let campaign = campaign.clone();
        self.publish(ChangeEvent::updated(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn release_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let campaign = tables.campaigns.get_mut(&id)
            .ok_or_else(|| StorageError::not_found(Table::Campaigns, id))?;
        campaign.usage_count = campaign.usage_count.saturating_sub(1);
        let campaign = campaign.clone();
        self.publish(ChangeEvent::updated(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn create_share_purchase(&self, command: &CreateSharePurchaseCommand) -> Result<SharePurchase, StorageError> {
        let purchase = SharePurchase {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            wallet_id: command.wallet_id,
            quantity: command.quantity,
            price_per_share: command.price_per_share,
            total_cost: command.total_cost,
            campaign_id: command.campaign_id,
            bonus_shares: command.bonus_shares,
            status: PurchaseStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
        };
        let mut tables = self.tables.write().unwrap();
        tables.purchases.insert(purchase.id, purchase.clone());
        self.publish(ChangeEvent::inserted(Record::SharePurchase(purchase.clone())));
        Ok(purchase)
    }

    fn get_share_purchase(&self, id: Uuid) -> Result<SharePurchase, StorageError> {
        self.tables.read().unwrap()
            .purchases
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(Table::SharePurchases, id))
    }

    fn list_share_purchases(&self, user_id: Option<Uuid>) -> Result<Vec<SharePurchase>, StorageError> {
        let tables = self.tables.read().unwrap();
        let rows = tables.purchases.values()
            .filter(|p| user_id.map_or(true, |u| p.user_id == u))
            .cloned()
            .collect();
        Ok(by_creation(rows, |p: &SharePurchase| (p.created_at, p.id)))
    }

    fn set_purchase_status(&self, command: &SetPurchaseStatusCommand) -> Result<SharePurchase, StorageError> {
        let mut tables = self.tables.write().unwrap();
        let purchase = tables.purchases.get_mut(&command.id)
            .ok_or_else(|| StorageError::not_found(Table::SharePurchases, command.id))?;
        if purchase.status != command.expected {
            return Err(StorageError::StatusConflict {
                id: command.id,
                expected: command.expected,
                actual: purchase.status,
            });
        }
        purchase.status = command.status;
        let purchase = purchase.clone();
        self.publish(ChangeEvent::updated(Record::SharePurchase(purchase.clone())));
        Ok(purchase)
    }

    fn create_agent(&self, command: &CreateAgentCommand) -> Result<Agent, StorageError> {
        let mut tables = self.tables.write().unwrap();
        if let Some(existing) = tables.agents.values()
            .find(|a| a.user_id == command.user_id || a.referral_code == command.referral_code)
        {
            let key = if existing.user_id == command.user_id {
                command.user_id.to_string()
            } else {
                command.referral_code.clone()
            };
            return Err(StorageError::AlreadyExists { table: Table::Agents, key });
        }

        let agent = Agent {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            referral_code: command.referral_code.clone(),
            commission_rate: command.commission_rate,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.agents.insert(agent.id, agent.clone());
        self.publish(ChangeEvent::inserted(Record::Agent(agent.clone())));
        Ok(agent)
    }

    fn get_agent(&self, id: Uuid) -> Result<Agent, StorageError> {
        self.tables.read().unwrap()
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(Table::Agents, id))
    }

    fn find_agent_by_code(&self, referral_code: &str) -> Result<Option<Agent>, StorageError> {
        let tables = self.tables.read().unwrap();
        Ok(tables.agents.values().find(|a| a.referral_code == referral_code).cloned())
    }

    fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        let rows = self.tables.read().unwrap().agents.values().cloned().collect();
        Ok(by_creation(rows, |a: &Agent| (a.created_at, a.id)))
    }

    fn record_referral(&self, command: &RecordReferralCommand) -> Result<Referral, StorageError> {
        check_non_negative("purchase_amount", command.purchase_amount)?;

        let mut tables = self.tables.write().unwrap();
        if !tables.agents.contains_key(&command.agent_id) {
            return Err(StorageError::not_found(Table::Agents, command.agent_id));
        }
        let referral = Referral {
            id: Uuid::new_v4(),
            agent_id: command.agent_id,
            referred_user_id: command.referred_user_id,
            purchase_amount: command.purchase_amount,
            commission: command.commission,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.referrals.entry(command.agent_id).or_default().push(referral.clone());
        self.publish(ChangeEvent::inserted(Record::Referral(referral.clone())));
        Ok(referral)
    }

    fn list_referrals(&self, agent_id: Uuid) -> Result<Vec<Referral>, StorageError> {
        let tables = self.tables.read().unwrap();
        if !tables.agents.contains_key(&agent_id) {
            return Err(StorageError::not_found(Table::Agents, agent_id));
        }
        Ok(tables.referrals.get(&agent_id).cloned().unwrap_or_default())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use minefund_core::ChangeKind;
    use rust_decimal_macros::dec;

    use super::*;

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    fn funded_wallet(storage: &InMemoryStorage, amount: Decimal) -> Wallet {
        let wallet = storage.create_wallet(&CreateWalletCommand { user_id: Uuid::new_v4(), currency: usd() }).unwrap();
        storage.record_transaction(&RecordTransactionCommand {
            wallet_id: wallet.id,
            transaction_type: TransactionType::Deposit,
            amount,
            fee: Decimal::ZERO,
        }).unwrap();
        storage.get_wallet(wallet.id).unwrap()
    }

    #[test]
    fn fee_schedule_upsert_keeps_identity() {
        let storage = InMemoryStorage::new();
        let command = UpsertFeeScheduleCommand {
            transaction_type: TransactionType::Withdrawal,
            currency: usd(),
            percentage_rate: dec!(5),
            flat_fee: dec!(200),
        };
        let first = storage.upsert_fee_schedule(&command).unwrap();
        let second = storage.upsert_fee_schedule(&UpsertFeeScheduleCommand { flat_fee: dec!(100), ..command }).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(storage.list_fee_schedules().unwrap().len(), 1);
        let stored = storage.get_fee_schedule(TransactionType::Withdrawal, &usd()).unwrap().unwrap();
        assert_eq!(stored.flat_fee, dec!(100));
    }

    #[test]
    fn negative_fee_schedule_is_rejected() {
        let storage = InMemoryStorage::new();
        let result = storage.upsert_fee_schedule(&UpsertFeeScheduleCommand {
            transaction_type: TransactionType::Deposit,
            currency: usd(),
            percentage_rate: dec!(-1),
            flat_fee: dec!(0),
        });
        assert!(matches!(result, Err(StorageError::Invalid(_))));
    }

    #[test]
    fn duplicate_wallet_per_currency_is_rejected() {
        let storage = InMemoryStorage::new();
        let user_id = Uuid::new_v4();
        storage.create_wallet(&CreateWalletCommand { user_id, currency: usd() }).unwrap();
        let result = storage.create_wallet(&CreateWalletCommand { user_id, currency: usd() });
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
    }

    #[test]
    fn transactions_move_balance() {
        let storage = InMemoryStorage::new();
        let wallet = funded_wallet(&storage, dec!(1000));
        assert_eq!(wallet.balance, dec!(1000));

        let tx = storage.record_transaction(&RecordTransactionCommand {
            wallet_id: wallet.id,
            transaction_type: TransactionType::Withdrawal,
            amount: dec!(300),
            fee: dec!(15),
        }).unwrap();
        assert_eq!(tx.net_amount, dec!(285));
        assert_eq!(storage.get_wallet(wallet.id).unwrap().balance, dec!(700));
        assert_eq!(storage.list_transactions(wallet.id).unwrap().len(), 2);
    }

    #[test]
    fn overdraft_is_rejected_and_balance_untouched() {
        let storage = InMemoryStorage::new();
        let wallet = funded_wallet(&storage, dec!(50));
        let result = storage.record_transaction(&RecordTransactionCommand {
            wallet_id: wallet.id,
            transaction_type: TransactionType::Withdrawal,
            amount: dec!(51),
            fee: Decimal::ZERO,
        });
        assert!(matches!(result, Err(StorageError::InsufficientFunds(_))));
        assert_eq!(storage.get_wallet(wallet.id).unwrap().balance, dec!(50));
    }

    #[test]
    fn campaign_redemption_respects_cap() {
        let storage = InMemoryStorage::new();
        let now = OffsetDateTime::now_utc();
        let campaign = storage.create_campaign(&CampaignCommand {
            name: "Launch".to_string(),
            discount_percentage: dec!(10),
            bonus_shares: 0,
            cashback_amount: Decimal::ZERO,
            starts_at: now,
            ends_at: now + time::Duration::days(7),
            usage_cap: Some(1),
            active: true,
        }).unwrap();

        assert_eq!(storage.redeem_campaign(campaign.id).unwrap().usage_count, 1);
        assert!(matches!(storage.redeem_campaign(campaign.id), Err(StorageError::CampaignExhausted(_))));
    }

    #[test]
    fn mutations_publish_change_events() {
        let storage = InMemoryStorage::new();
        let mut rx = storage.subscribe();
        let wallet = funded_wallet(&storage, dec!(10));

        let created = rx.try_recv().unwrap();
        assert_eq!(created.kind, ChangeKind::Insert);
        assert_eq!(created.id, wallet.id);

        let tx = rx.try_recv().unwrap();
        assert_eq!(tx.table, Table::WalletTransactions);

        let updated = rx.try_recv().unwrap();
        assert_eq!(updated.kind, ChangeKind::Update);
        assert_eq!(updated.record, Some(Record::Wallet(wallet)));
    }

    #[test]
    fn agents_are_unique_by_user_and_code() {
        let storage = InMemoryStorage::new();
        let user_id = Uuid::new_v4();
        storage.create_agent(&CreateAgentCommand {
            user_id,
            referral_code: "AG-00000001".to_string(),
            commission_rate: dec!(5),
        }).unwrap();
        let same_code = storage.create_agent(&CreateAgentCommand {
            user_id: Uuid::new_v4(),
            referral_code: "AG-00000001".to_string(),
            commission_rate: dec!(5),
        });
        assert!(matches!(same_code, Err(StorageError::AlreadyExists { .. })));
        assert!(storage.find_agent_by_code("AG-00000001").unwrap().is_some());
    }

    #[test]
    fn purchase_status_is_compare_and_set() {
        let storage = InMemoryStorage::new();
        let wallet = funded_wallet(&storage, dec!(100));
        let purchase = storage.create_share_purchase(&CreateSharePurchaseCommand {
            user_id: wallet.user_id,
            wallet_id: wallet.id,
            quantity: 1,
            price_per_share: dec!(100),
            total_cost: dec!(100),
            campaign_id: None,
            bonus_shares: 0,
        }).unwrap();

        let rejected = storage.set_purchase_status(&SetPurchaseStatusCommand {
            id: purchase.id,
            expected: PurchaseStatus::Pending,
            status: PurchaseStatus::Rejected,
        }).unwrap();
        assert_eq!(rejected.status, PurchaseStatus::Rejected);

        let second = storage.set_purchase_status(&SetPurchaseStatusCommand {
            id: purchase.id,
            expected: PurchaseStatus::Pending,
            status: PurchaseStatus::Approved,
        });
        match second {
            Err(StorageError::StatusConflict { actual, .. }) => assert_eq!(actual, PurchaseStatus::Rejected),
            other => panic!("Expected status conflict, got {:?}", other),
        }
        assert_eq!(storage.get_share_purchase(purchase.id).unwrap().status, PurchaseStatus::Rejected);
    }

    #[test]
    fn released_redemption_frees_the_cap() {
        let storage = InMemoryStorage::new();
        let now = OffsetDateTime::now_utc();
        let campaign = storage.create_campaign(&CampaignCommand {
            name: "Refill".to_string(),
            discount_percentage: dec!(5),
            bonus_shares: 0,
            cashback_amount: Decimal::ZERO,
            starts_at: now,
            ends_at: now + time::Duration::days(1),
            usage_cap: Some(1),
            active: true,
        }).unwrap();

        assert_eq!(storage.release_campaign(campaign.id).unwrap().usage_count, 0);
        storage.redeem_campaign(campaign.id).unwrap();
        assert_eq!(storage.release_campaign(campaign.id).unwrap().usage_count, 0);
        assert_eq!(storage.redeem_campaign(campaign.id).unwrap().usage_count, 1);
    }

    #[test]
    fn wallet_events_follow_commit_order() {
        let storage = InMemoryStorage::new();
        let wallet = funded_wallet(&storage, Decimal::ZERO);
        let mut rx = storage.subscribe();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        storage.record_transaction(&RecordTransactionCommand {
                            wallet_id: wallet.id,
                            transaction_type: TransactionType::Deposit,
                            amount: dec!(1),
                            fee: Decimal::ZERO,
                        }).unwrap();
                    }
                });
            }
        });

        let mut balances = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Some(Record::Wallet(w)) = event.record {
                balances.push(w.balance);
            }
        }
        assert_eq!(balances.len(), 400);
        assert!(balances.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(balances.last().copied(), Some(storage.get_wallet(wallet.id).unwrap().balance));
    }
}
