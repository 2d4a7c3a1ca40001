//! SQLite implementation of the minefund `StorageBackend`.
//!
//! Decimals, identifiers and timestamps (RFC 3339) are stored as TEXT so the
//! values round-trip exactly.

use std::{fmt::Display, str::FromStr, sync::Mutex};

use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::broadcast;
use uuid::Uuid;

use minefund_core::{
    Agent, Campaign, CampaignCommand, ChangeEvent, CreateAgentCommand, CreateSharePurchaseCommand,
    CreateWalletCommand, Currency, FeeSchedule, PurchaseStatus, Record, RecordReferralCommand,
    RecordTransactionCommand, Referral, SetPurchaseStatusCommand, SharePurchase, StorageBackend,
    StorageError, Table, TransactionType, UpsertFeeScheduleCommand, Wallet, WalletTransaction,
    CHANGE_CHANNEL_CAPACITY,
};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

#[derive(Debug)]
struct ConversionError(String);

impl Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConversionError {}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn conversion(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(ConversionError(message)))
}

fn col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let text: String = row.get(idx)?;
    text.parse::<T>().map_err(|e| conversion(idx, e.to_string()))
}

fn opt_col<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse::<T>().map_err(|e| conversion(idx, e.to_string())))
        .transpose()
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let text: String = row.get(idx)?;
    OffsetDateTime::parse(&text, &Rfc3339).map_err(|e| conversion(idx, e.to_string()))
}

fn ts(at: OffsetDateTime) -> Result<String, StorageError> {
    at.format(&Rfc3339).map_err(|e| StorageError::Invalid(e.to_string()))
}

fn check_non_negative(field: &str, value: Decimal) -> Result<(), StorageError> {
    if value < Decimal::ZERO {
        return Err(StorageError::Invalid(format!("{} must not be negative", field)));
    }
    Ok(())
}

const FEE_COLUMNS: &str = "id, transaction_type, currency, percentage_rate, flat_fee, updated_at";
const WALLET_COLUMNS: &str = "id, user_id, currency, balance, created_at";
const TRANSACTION_COLUMNS: &str = "id, wallet_id, transaction_type, amount, fee, net_amount, created_at";
const CAMPAIGN_COLUMNS: &str = "id, name, discount_percentage, bonus_shares, cashback_amount, starts_at, ends_at, usage_cap, usage_count, active";
const PURCHASE_COLUMNS: &str = "id, user_id, wallet_id, quantity, price_per_share, total_cost, campaign_id, bonus_shares, status, created_at";
const AGENT_COLUMNS: &str = "id, user_id, referral_code, commission_rate, created_at";
const REFERRAL_COLUMNS: &str = "id, agent_id, referred_user_id, purchase_amount, commission, created_at";

fn fee_schedule_row(row: &Row) -> rusqlite::Result<FeeSchedule> {
    Ok(FeeSchedule {
        id: col(row, 0)?,
        transaction_type: col(row, 1)?,
        currency: col(row, 2)?,
        percentage_rate: col(row, 3)?,
        flat_fee: col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

fn wallet_row(row: &Row) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: col(row, 0)?,
        user_id: col(row, 1)?,
        currency: col(row, 2)?,
        balance: col(row, 3)?,
        created_at: ts_col(row, 4)?,
    })
}

fn transaction_row(row: &Row) -> rusqlite::Result<WalletTransaction> {
    Ok(WalletTransaction {
        id: col(row, 0)?,
        wallet_id: col(row, 1)?,
        transaction_type: col(row, 2)?,
        amount: col(row, 3)?,
        fee: col(row, 4)?,
        net_amount: col(row, 5)?,
        created_at: ts_col(row, 6)?,
    })
}

fn campaign_row(row: &Row) -> rusqlite::Result<Campaign> {
    Ok(Campaign {
        id: col(row, 0)?,
        name: row.get(1)?,
        discount_percentage: col(row, 2)?,
        bonus_shares: row.get(3)?,
        cashback_amount: col(row, 4)?,
        starts_at: ts_col(row, 5)?,
        ends_at: ts_col(row, 6)?,
        usage_cap: row.get(7)?,
        usage_count: row.get(8)?,
        active: row.get(9)?,
    })
}

fn purchase_row(row: &Row) -> rusqlite::Result<SharePurchase> {
    Ok(SharePurchase {
        id: col(row, 0)?,
        user_id: col(row, 1)?,
        wallet_id: col(row, 2)?,
        quantity: row.get(3)?,
        price_per_share: col(row, 4)?,
        total_cost: col(row, 5)?,
        campaign_id: opt_col(row, 6)?,
        bonus_shares: row.get(7)?,
        status: col(row, 8)?,
        created_at: ts_col(row, 9)?,
    })
}

fn agent_row(row: &Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: col(row, 0)?,
        user_id: col(row, 1)?,
        referral_code: row.get(2)?,
        commission_rate: col(row, 3)?,
        created_at: ts_col(row, 4)?,
    })
}

fn referral_row(row: &Row) -> rusqlite::Result<Referral> {
    Ok(Referral {
        id: col(row, 0)?,
        agent_id: col(row, 1)?,
        referred_user_id: col(row, 2)?,
        purchase_amount: col(row, 3)?,
        commission: col(row, 4)?,
        created_at: ts_col(row, 5)?,
    })
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let storage = Self {
            conn: Mutex::new(conn),
            changes,
        };
        storage.init_schema()?;
        tracing::debug!(path, "SQLite storage opened");
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS fee_schedules (
                id TEXT PRIMARY KEY,
                transaction_type TEXT NOT NULL,
                currency TEXT NOT NULL,
                percentage_rate TEXT NOT NULL,
                flat_fee TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (transaction_type, currency)
            );

            CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                currency TEXT NOT NULL,
                balance TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (user_id, currency)
            );

            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL,
                net_amount TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (wallet_id) REFERENCES wallets(id)
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_wallet
                ON wallet_transactions(wallet_id);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                discount_percentage TEXT NOT NULL,
                bonus_shares INTEGER NOT NULL,
                cashback_amount TEXT NOT NULL,
                starts_at TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                usage_cap INTEGER,
                usage_count INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS share_purchases (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                wallet_id TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price_per_share TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                campaign_id TEXT,
                bonus_shares INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (wallet_id) REFERENCES wallets(id)
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                referral_code TEXT NOT NULL UNIQUE,
                commission_rate TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS referrals (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                referred_user_id TEXT NOT NULL,
                purchase_amount TEXT NOT NULL,
                commission TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (agent_id) REFERENCES agents(id)
            );

            CREATE INDEX IF NOT EXISTS idx_referrals_agent
                ON referrals(agent_id);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Sent while the connection mutex is held so events leave in commit order.
    fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    fn query_one<T, F>(&self, sql: &str, id: &str, table: Table, map: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Row) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, sql, id, table, map)
    }

    fn fetch<T, F>(conn: &Connection, sql: &str, id: &str, table: Table, map: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Row) -> rusqlite::Result<T>,
    {
        conn.query_row(sql, params![id], map)
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::not_found(table, id))
    }

    fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, StorageError> {
        conn.query_row(sql, params![id], |row| row.get(0)).map_err(db_err)
    }
}

impl StorageBackend for SqliteStorage {
    fn upsert_fee_schedule(&self, command: &UpsertFeeScheduleCommand) -> Result<FeeSchedule, StorageError> {
        check_non_negative("percentage_rate", command.percentage_rate)?;
        check_non_negative("flat_fee", command.flat_fee)?;

        let conn = self.conn.lock().unwrap();
        let existing: Option<Uuid> = conn
            .query_row(
                "SELECT id FROM fee_schedules WHERE transaction_type = ?1 AND currency = ?2",
                params![command.transaction_type.as_str(), command.currency.as_str()],
                |row| col(row, 0),
            )
            .optional()
            .map_err(db_err)?;

        let schedule = FeeSchedule {
            id: existing.unwrap_or_else(Uuid::new_v4),
            transaction_type: command.transaction_type,
            currency: command.currency.clone(),
            percentage_rate: command.percentage_rate,
            flat_fee: command.flat_fee,
            updated_at: OffsetDateTime::now_utc(),
        };
        conn.execute(
            "INSERT INTO fee_schedules (id, transaction_type, currency, percentage_rate, flat_fee, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (transaction_type, currency) DO UPDATE SET
                percentage_rate = excluded.percentage_rate,
                flat_fee = excluded.flat_fee,
                updated_at = excluded.updated_at",
            params![
                schedule.id.to_string(),
                schedule.transaction_type.as_str(),
                schedule.currency.as_str(),
                schedule.percentage_rate.to_string(),
                schedule.flat_fee.to_string(),
                ts(schedule.updated_at)?,
            ],
        )
        .map_err(db_err)?;

        let event = match existing {
            Some(_) => ChangeEvent::updated(Record::FeeSchedule(schedule.clone())),
            None => ChangeEvent::inserted(Record::FeeSchedule(schedule.clone())),
        };
        self.publish(event);
        Ok(schedule)
    }

    fn get_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<Option<FeeSchedule>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM fee_schedules WHERE transaction_type = ?1 AND currency = ?2", FEE_COLUMNS),
            params![transaction_type.as_str(), currency.as_str()],
            fee_schedule_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_fee_schedules(&self) -> Result<Vec<FeeSchedule>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM fee_schedules ORDER BY transaction_type, currency", FEE_COLUMNS))
            .map_err(db_err)?;
        let rows = stmt.query_map([], fee_schedule_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn delete_fee_schedule(&self, transaction_type: TransactionType, currency: &Currency) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let id: Uuid = conn
            .query_row(
                "SELECT id FROM fee_schedules WHERE transaction_type = ?1 AND currency = ?2",
                params![transaction_type.as_str(), currency.as_str()],
                |row| col(row, 0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::not_found(Table::FeeSchedules, format!("{}/{}", transaction_type, currency)))?;
        conn.execute("DELETE FROM fee_schedules WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;

        self.publish(ChangeEvent::deleted(Table::FeeSchedules, id));
        Ok(())
    }

    fn create_wallet(&self, command: &CreateWalletCommand) -> Result<Wallet, StorageError> {
        let conn = self.conn.lock().unwrap();
        let duplicate: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM wallets WHERE user_id = ?1 AND currency = ?2",
                params![command.user_id.to_string(), command.currency.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
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
        conn.execute(
            "INSERT INTO wallets (id, user_id, currency, balance, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                wallet.id.to_string(),
                wallet.user_id.to_string(),
                wallet.currency.as_str(),
                wallet.balance.to_string(),
                ts(wallet.created_at)?,
            ],
        )
        .map_err(db_err)?;

        self.publish(ChangeEvent::inserted(Record::Wallet(wallet.clone())));
        Ok(wallet)
    }

    fn get_wallet(&self, id: Uuid) -> Result<Wallet, StorageError> {
        self.query_one(
            &format!("SELECT {} FROM wallets WHERE id = ?1", WALLET_COLUMNS),
            &id.to_string(),
            Table::Wallets,
            wallet_row,
        )
    }

    fn list_wallets(&self, user_id: Option<Uuid>) -> Result<Vec<Wallet>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM wallets WHERE ?1 IS NULL OR user_id = ?1 ORDER BY rowid",
                WALLET_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id.map(|u| u.to_string())], wallet_row)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn record_transaction(&self, command: &RecordTransactionCommand) -> Result<WalletTransaction, StorageError> {
        check_non_negative("amount", command.amount)?;
        check_non_negative("fee", command.fee)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        let wallet = tx
            .query_row(
                &format!("SELECT {} FROM wallets WHERE id = ?1", WALLET_COLUMNS),
                params![command.wallet_id.to_string()],
                wallet_row,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::not_found(Table::Wallets, command.wallet_id))?;

        let new_balance = wallet.balance + command.balance_delta();
        if new_balance < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds(command.wallet_id));
        }

        let transaction = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: command.wallet_id,
            transaction_type: command.transaction_type,
            amount: command.amount,
            fee: command.fee,
            net_amount: command.net_amount(),
            created_at: OffsetDateTime::now_utc(),
        };
        tx.execute(
            "UPDATE wallets SET balance = ?1 WHERE id = ?2",
            params![new_balance.to_string(), command.wallet_id.to_string()],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO wallet_transactions (id, wallet_id, transaction_type, amount, fee, net_amount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transaction.id.to_string(),
                transaction.wallet_id.to_string(),
                transaction.transaction_type.as_str(),
                transaction.amount.to_string(),
                transaction.fee.to_string(),
                transaction.net_amount.to_string(),
                ts(transaction.created_at)?,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        tracing::debug!(wallet_id = %wallet.id, balance = %new_balance, "Wallet balance updated");
        self.publish(ChangeEvent::inserted(Record::WalletTransaction(transaction.clone())));
        self.publish(ChangeEvent::updated(Record::Wallet(Wallet { balance: new_balance, ..wallet })));
        Ok(transaction)
    }

    fn list_transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let id = wallet_id.to_string();
        if !Self::exists(&conn, "SELECT COUNT(*) > 0 FROM wallets WHERE id = ?1", &id)? {
            return Err(StorageError::not_found(Table::Wallets, wallet_id));
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM wallet_transactions WHERE wallet_id = ?1 ORDER BY rowid",
                TRANSACTION_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![id], transaction_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
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
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO campaigns ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)", CAMPAIGN_COLUMNS),
            params![
                campaign.id.to_string(),
                campaign.name,
                campaign.discount_percentage.to_string(),
                campaign.bonus_shares,
                campaign.cashback_amount.to_string(),
                ts(campaign.starts_at)?,
                ts(campaign.ends_at)?,
                campaign.usage_cap,
                campaign.usage_count,
                campaign.active,
            ],
        )
        .map_err(db_err)?;

        self.publish(ChangeEvent::inserted(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn update_campaign(&self, id: Uuid, command: &CampaignCommand) -> Result<Campaign, StorageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE campaigns SET name = ?1, discount_percentage = ?2, bonus_shares = ?3, cashback_amount = ?4,
                    starts_at = ?5, ends_at = ?6, usage_cap = ?7, active = ?8
                 WHERE id = ?9",
                params![
                    command.name,
                    command.discount_percentage.to_string(),
                    command.bonus_shares,
                    command.cashback_amount.to_string(),
                    ts(command.starts_at)?,
                    ts(command.ends_at)?,
                    command.usage_cap,
                    command.active,
                    id.to_string(),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StorageError::not_found(Table::Campaigns, id));
        }

        let campaign = Self::fetch(&conn, &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS), &id.to_string(), Table::Campaigns, campaign_row)?;
        self.publish(ChangeEvent::updated(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn get_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        self.query_one(
            &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS),
            &id.to_string(),
            Table::Campaigns,
            campaign_row,
        )
    }

    fn list_campaigns(&self) -> Result<Vec<Campaign>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM campaigns", CAMPAIGN_COLUMNS))
            .map_err(db_err)?;
        let rows = stmt.query_map([], campaign_row).map_err(db_err)?;
        let mut campaigns = rows.collect::<Result<Vec<_>, _>>().map_err(db_err)?;
        // Offsets may differ between rows, so order on parsed instants.
        campaigns.sort_by_key(|c| (c.starts_at, c.id));
        Ok(campaigns)
    }

    fn delete_campaign(&self, id: Uuid) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute("DELETE FROM campaigns WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StorageError::not_found(Table::Campaigns, id));
        }
        self.publish(ChangeEvent::deleted(Table::Campaigns, id));
        Ok(())
    }

    fn redeem_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE campaigns SET usage_count = usage_count + 1
                 WHERE id = ?1 AND (usage_cap IS NULL OR usage_count < usage_cap)",
                params![id.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            let known = Self::exists(&conn, "SELECT COUNT(*) > 0 FROM campaigns WHERE id = ?1", &id.to_string())?;
            return Err(if known {
                StorageError::CampaignExhausted(id)
            } else {
                StorageError::not_found(Table::Campaigns, id)
            });
        }

        let campaign = Self::fetch(&conn, &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS), &id.to_string(), Table::Campaigns, campaign_row)?;
        self.publish(ChangeEvent::updated(Record::Campaign(campaign.clone())));
        Ok(campaign)
    }

    fn release_campaign(&self, id: Uuid) -> Result<Campaign, StorageError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE campaigns SET usage_count = MAX(usage_count - 1, 0) WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StorageError::not_found(Table::Campaigns, id));
        }

        let campaign = Self::fetch(&conn, &format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS), &id.to_string(), Table::Campaigns, campaign_row)?;
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
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO share_purchases ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)", PURCHASE_COLUMNS),
            params![
                purchase.id.to_string(),
                purchase.user_id.to_string(),
                purchase.wallet_id.to_string(),
                purchase.quantity,
                purchase.price_per_share.to_string(),
                purchase.total_cost.to_string(),
                purchase.campaign_id.map(|c| c.to_string()),
                purchase.bonus_shares,
                purchase.status.as_str(),
                ts(purchase.created_at)?,
            ],
        )
        .map_err(db_err)?;

        self.publish(ChangeEvent::inserted(Record::SharePurchase(purchase.clone())));
        Ok(purchase)
    }

    fn get_share_purchase(&self, id: Uuid) -> Result<SharePurchase, StorageError> {
        self.query_one(
            &format!("SELECT {} FROM share_purchases WHERE id = ?1", PURCHASE_COLUMNS),
            &id.to_string(),
            Table::SharePurchases,
            purchase_row,
        )
    }

    fn list_share_purchases(&self, user_id: Option<Uuid>) -> Result<Vec<SharePurchase>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM share_purchases WHERE ?1 IS NULL OR user_id = ?1 ORDER BY rowid",
                PURCHASE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user_id.map(|u| u.to_string())], purchase_row)
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn set_purchase_status(&self, command: &SetPurchaseStatusCommand) -> Result<SharePurchase, StorageError> {
        let conn = self.conn.lock().unwrap();
        let id = command.id.to_string();
        let sql = format!("SELECT {} FROM share_purchases WHERE id = ?1", PURCHASE_COLUMNS);
        let changed = conn
            .execute(
                "UPDATE share_purchases SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![command.status.as_str(), id, command.expected.as_str()],
            )
            .map_err(db_err)?;

        let purchase = Self::fetch(&conn, &sql, &id, Table::SharePurchases, purchase_row)?;
        if changed == 0 {
            return Err(StorageError::StatusConflict {
                id: command.id,
                expected: command.expected,
                actual: purchase.status,
            });
        }
        self.publish(ChangeEvent::updated(Record::SharePurchase(purchase.clone())));
        Ok(purchase)
    }

    fn create_agent(&self, command: &CreateAgentCommand) -> Result<Agent, StorageError> {
        let conn = self.conn.lock().unwrap();
        if Self::exists(&conn, "SELECT COUNT(*) > 0 FROM agents WHERE user_id = ?1", &command.user_id.to_string())? {
            return Err(StorageError::AlreadyExists { table: Table::Agents, key: command.user_id.to_string() });
        }
        if Self::exists(&conn, "SELECT COUNT(*) > 0 FROM agents WHERE referral_code = ?1", &command.referral_code)? {
            return Err(StorageError::AlreadyExists { table: Table::Agents, key: command.referral_code.clone() });
        }

        let agent = Agent {
            id: Uuid::new_v4(),
            user_id: command.user_id,
            referral_code: command.referral_code.clone(),
            commission_rate: command.commission_rate,
            created_at: OffsetDateTime::now_utc(),
        };
        conn.execute(
            &format!("INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5)", AGENT_COLUMNS),
            params![
                agent.id.to_string(),
                agent.user_id.to_string(),
                agent.referral_code,
                agent.commission_rate.to_string(),
                ts(agent.created_at)?,
            ],
        )
        .map_err(db_err)?;

        self.publish(ChangeEvent::inserted(Record::Agent(agent.clone())));
        Ok(agent)
    }

    fn get_agent(&self, id: Uuid) -> Result<Agent, StorageError> {
        self.query_one(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            &id.to_string(),
            Table::Agents,
            agent_row,
        )
    }

    fn find_agent_by_code(&self, referral_code: &str) -> Result<Option<Agent>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM agents WHERE referral_code = ?1", AGENT_COLUMNS),
            params![referral_code],
            agent_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_agents(&self) -> Result<Vec<Agent>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM agents ORDER BY rowid", AGENT_COLUMNS))
            .map_err(db_err)?;
        let rows = stmt.query_map([], agent_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn record_referral(&self, command: &RecordReferralCommand) -> Result<Referral, StorageError> {
        check_non_negative("purchase_amount", command.purchase_amount)?;

        let conn = self.conn.lock().unwrap();
        if !Self::exists(&conn, "SELECT COUNT(*) > 0 FROM agents WHERE id = ?1", &command.agent_id.to_string())? {
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
        conn.execute(
            &format!("INSERT INTO referrals ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", REFERRAL_COLUMNS),
            params![
                referral.id.to_string(),
                referral.agent_id.to_string(),
                referral.referred_user_id.to_string(),
                referral.purchase_amount.to_string(),
                referral.commission.to_string(),
                ts(referral.created_at)?,
            ],
        )
        .map_err(db_err)?;

        self.publish(ChangeEvent::inserted(Record::Referral(referral.clone())));
        Ok(referral)
    }

    fn list_referrals(&self, agent_id: Uuid) -> Result<Vec<Referral>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let id = agent_id.to_string();
        if !Self::exists(&conn, "SELECT COUNT(*) > 0 FROM agents WHERE id = ?1", &id)? {
            return Err(StorageError::not_found(Table::Agents, agent_id));
        }
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM referrals WHERE agent_id = ?1 ORDER BY rowid", REFERRAL_COLUMNS))
            .map_err(db_err)?;
        let rows = stmt.query_map(params![id], referral_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
