use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use minefund_core::{
    CreateWalletCommand, RecordTransactionCommand, TransactionType, Wallet, WalletTransaction,
};

use crate::{
    fees::{FeeBreakdown, FeeService},
    service::ServiceError,
    storage::StorageBackend,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionReceipt {
    pub transaction: WalletTransaction,
    pub fee: FeeBreakdown,
    pub balance: Decimal,
}

pub struct WalletService {
    storage: Arc<dyn StorageBackend>,
    fees: Arc<FeeService>,
}

impl WalletService {
    pub fn new(storage: Arc<dyn StorageBackend>, fees: Arc<FeeService>) -> Self {
        Self { storage, fees }
    }

    pub fn open(&self, command: &CreateWalletCommand) -> Result<Wallet, ServiceError> {
        let wallet = self.storage.create_wallet(command)?;
        tracing::info!(wallet_id = %wallet.id, user_id = %wallet.user_id, currency = %wallet.currency, "Wallet opened");
        Ok(wallet)
    }

    pub fn get(&self, id: Uuid) -> Result<Wallet, ServiceError> {
        Ok(self.storage.get_wallet(id)?)
    }

    pub fn list(&self, user_id: Option<Uuid>) -> Result<Vec<Wallet>, ServiceError> {
        Ok(self.storage.list_wallets(user_id)?)
    }

    pub fn history(&self, id: Uuid) -> Result<Vec<WalletTransaction>, ServiceError> {
        Ok(self.storage.list_transactions(id)?)
    }

    /// Charges the configured fee and moves the balance.
    ///
    /// Unlike the admin preview, a fee that swallows the whole amount is
    /// refused here: no money moves with a negative net amount.
    pub fn transact(&self, wallet_id: Uuid, transaction_type: TransactionType, amount: Decimal) -> Result<TransactionReceipt, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::Validation("amount must be greater than zero".to_string()));
        }
        let wallet = self.storage.get_wallet(wallet_id)?;
        let quote = self.fees.quote(transaction_type, &wallet.currency, amount)?;
        if quote.breakdown.exceeds_amount() {
            tracing::warn!(%wallet_id, %amount, total_fee = %quote.breakdown.total_fee, "Transaction refused, fee exceeds amount");
            return Err(ServiceError::Conflict(format!(
                "fee {} exceeds transaction amount {}",
                quote.breakdown.total_fee, amount
            )));
        }

        let transaction = self.storage.record_transaction(&RecordTransactionCommand {
            wallet_id,
            transaction_type,
            amount,
            fee: quote.breakdown.total_fee,
        })?;
        let balance = self.storage.get_wallet(wallet_id)?.balance;

        metrics::increment_counter!("minefund_transactions_total", "type" => transaction_type.as_str());
        tracing::info!(
            %wallet_id,
            transaction_id = %transaction.id,
            %transaction_type,
            %amount,
            fee = %transaction.fee,
            %balance,
            "Transaction recorded"
        );
        Ok(TransactionReceipt {
            transaction,
            fee: quote.breakdown,
            balance,
        })
    }
}
