//! Outbound links handed to the front-end: chat deep links, calendar
//! templates and payment-gateway redirects.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime, UtcOffset};
use url::Url;

use minefund_core::Currency;

const WHATSAPP_BASE: &str = "https://wa.me/";
const CALENDAR_BASE: &str = "https://calendar.google.com/calendar/render";

#[derive(Debug, Error, PartialEq)]
pub enum LinkError {
    #[error("phone number must contain 8 to 15 digits")]
    InvalidPhone,
    #[error("event must end after it starts")]
    InvalidEventWindow,
    #[error("invalid payment gateway url: {0}")]
    InvalidGateway(String),
}

/// `https://wa.me/<digits>?text=<message>`; formatting characters in the
/// phone number are dropped.
pub fn whatsapp_link(phone: &str, message: &str) -> Result<Url, LinkError> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if !(8..=15).contains(&digits.len()) {
        return Err(LinkError::InvalidPhone);
    }
    let mut url = Url::parse(WHATSAPP_BASE)
        .and_then(|base| base.join(&digits))
        .map_err(|e| LinkError::InvalidGateway(e.to_string()))?;
    if !message.is_empty() {
        url.query_pairs_mut().append_pair("text", message);
    }
    Ok(url)
}

fn calendar_stamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    let format = format_description!("[year][month][day]T[hour][minute][second]Z");
    // The description has no fields that can fail to format for a valid date.
    utc.format(&format).unwrap_or_default()
}

pub fn calendar_link(title: &str, details: &str, starts_at: OffsetDateTime, ends_at: OffsetDateTime) -> Result<Url, LinkError> {
    if ends_at <= starts_at {
        return Err(LinkError::InvalidEventWindow);
    }
    let dates = format!("{}/{}", calendar_stamp(starts_at), calendar_stamp(ends_at));
    Url::parse_with_params(
        CALENDAR_BASE,
        &[("action", "TEMPLATE"), ("text", title), ("details", details), ("dates", dates.as_str())],
    )
    .map_err(|e| LinkError::InvalidGateway(e.to_string()))
}

pub fn payment_redirect(gateway: &str, reference: &str, amount: Decimal, currency: &Currency) -> Result<Url, LinkError> {
    let amount = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let amount = format!("{:.2}", amount);
    let mut url = Url::parse(gateway).map_err(|e| LinkError::InvalidGateway(e.to_string()))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(LinkError::InvalidGateway(gateway.to_string()));
    }
    url.query_pairs_mut()
        .append_pair("reference", reference)
        .append_pair("amount", &amount)
        .append_pair("currency", currency.as_str());
    Ok(url)
}
