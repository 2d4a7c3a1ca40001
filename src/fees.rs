use std::{fmt::Display, sync::Arc};

use prettytable::{row, Table};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use minefund_core::{Currency, FeeSchedule, TransactionType, UpsertFeeScheduleCommand};

use crate::{
    service::ServiceError,
    storage::{StorageBackend, StorageError},
};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

#[derive(Debug, Error, PartialEq)]
pub enum FeeError {
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FeeInput {
    pub amount: Decimal,
    /// Percent, typically between 0 and 100.
    pub percentage_rate: Decimal,
    pub flat_fee: Decimal,
}

impl FeeInput {
    pub fn new(amount: Decimal, percentage_rate: Decimal, flat_fee: Decimal) -> Self {
        Self { amount, percentage_rate, flat_fee }
    }

    /// Rejects negative values before they reach [`compute_fee`].
    pub fn validate(&self) -> Result<(), FeeError> {
        let fields = [
            ("amount", self.amount),
            ("percentage_rate", self.percentage_rate),
            ("flat_fee", self.flat_fee),
        ];
        for (field, value) in fields {
            if value < Decimal::ZERO {
                return Err(FeeError::Negative { field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeeBreakdown {
    pub amount: Decimal,
    pub percentage_component: Decimal,
    pub total_fee: Decimal,
    /// Not floored at zero; see [`FeeBreakdown::exceeds_amount`].
    pub net_amount: Decimal,
}

/// `amount * rate / 100 + flat`, subtracted from the amount.
///
/// An empty amount yields an all-zero breakdown: there is nothing to charge
/// the flat fee against.
pub fn compute_fee(input: &FeeInput) -> FeeBreakdown {
    if input.amount.is_zero() {
        return FeeBreakdown {
            amount: input.amount,
            percentage_component: Decimal::ZERO,
            total_fee: Decimal::ZERO,
            net_amount: Decimal::ZERO,
        };
    }

    let percentage_component = input.amount * input.percentage_rate / HUNDRED;
    let total_fee = percentage_component + input.flat_fee;
    FeeBreakdown {
        amount: input.amount,
        percentage_component,
        total_fee,
        net_amount: input.amount - total_fee,
    }
}

fn truncate_2dp(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayedFee {
    pub percentage_component: String,
    pub total_fee: String,
    pub net_amount: String,
}

impl FeeBreakdown {
    /// The fee eats the whole amount or more, which usually means a
    /// misconfigured schedule.
    pub fn exceeds_amount(&self) -> bool {
        self.total_fee > self.amount
    }

    /// Values truncated towards zero at two decimal places.
    pub fn display(&self) -> DisplayedFee {
        DisplayedFee {
            percentage_component: format!("{:.2}", truncate_2dp(self.percentage_component)),
            total_fee: format!("{:.2}", truncate_2dp(self.total_fee)),
            net_amount: format!("{:.2}", truncate_2dp(self.net_amount)),
        }
    }
}

impl Display for FeeBreakdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = self.display();
        let mut table = Table::new();
        table.add_row(row!["Amount", format!("{:.2}", truncate_2dp(self.amount))]);
        table.add_row(row!["Percentage fee", shown.percentage_component]);
        table.add_row(row!["Total fee", shown.total_fee]);
        table.add_row(row!["Net amount", shown.net_amount]);
        write!(f, "{}", table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeePreview {
    pub breakdown: FeeBreakdown,
    pub display: DisplayedFee,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeQuote {
    pub transaction_type: TransactionType,
    pub currency: Currency,
    pub schedule: Option<FeeSchedule>,
    pub breakdown: FeeBreakdown,
}

/// Fee previews, quotes and schedule configuration over an injected store.
pub struct FeeService {
    storage: Arc<dyn StorageBackend>,
}

impl FeeService {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Live preview shown while an administrator edits a schedule.
    pub fn preview(&self, input: &FeeInput) -> Result<FeePreview, FeeError> {
        input.validate()?;
        let breakdown = compute_fee(input);
        metrics::increment_counter!("minefund_fee_previews_total");

        let warning = breakdown.exceeds_amount().then(|| {
            tracing::warn!(amount = %input.amount, total_fee = %breakdown.total_fee, "Fee exceeds transaction amount");
            "total fee exceeds the transaction amount; net amount is negative".to_string()
        });

        Ok(FeePreview {
            breakdown,
            display: breakdown.display(),
            warning,
        })
    }

    /// Fee for a real transaction; a missing schedule charges nothing.
    pub fn quote(&self, transaction_type: TransactionType, currency: &Currency, amount: Decimal) -> Result<FeeQuote, ServiceError> {
        let schedule = self.storage.get_fee_schedule(transaction_type, currency)?;
        let input = match &schedule {
            Some(s) => FeeInput::new(amount, s.percentage_rate, s.flat_fee),
            None => FeeInput::new(amount, Decimal::ZERO, Decimal::ZERO),
        };
        input.validate()?;

        Ok(FeeQuote {
            transaction_type,
            currency: currency.clone(),
            schedule,
            breakdown: compute_fee(&input),
        })
    }

    pub fn configure(&self, command: &UpsertFeeScheduleCommand) -> Result<FeeSchedule, ServiceError> {
        FeeInput::new(Decimal::ZERO, command.percentage_rate, command.flat_fee).validate()?;
        let schedule = self.storage.upsert_fee_schedule(command)?;
        tracing::info!(
            transaction_type = %schedule.transaction_type,
            currency = %schedule.currency,
            percentage_rate = %schedule.percentage_rate,
            flat_fee = %schedule.flat_fee,
            "Fee schedule configured"
        );
        Ok(schedule)
    }

    pub fn schedules(&self) -> Result<Vec<FeeSchedule>, StorageError> {
        self.storage.list_fee_schedules()
    }

    pub fn remove(&self, transaction_type: TransactionType, currency: &Currency) -> Result<(), StorageError> {
        self.storage.delete_fee_schedule(transaction_type, currency)?;
        tracing::info!(%transaction_type, %currency, "Fee schedule removed");
        Ok(())
    }
}
