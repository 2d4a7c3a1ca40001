use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use minefund_core::{
    CampaignCommand, CreateWalletCommand, Currency, FeeSchedule, TransactionType,
    UpsertFeeScheduleCommand, Wallet,
};

use crate::{
    auth::auth_middleware,
    campaigns::CampaignService,
    config::{AuthConfig, Config},
    fees::{FeeInput, FeeService},
    links,
    live::LiveCache,
    referrals::ReferralService,
    risk::RiskMonitor,
    service::ServiceError,
    shares::{PurchaseRequest, ShareService},
    storage::{StorageBackend, StorageError},
    wallets::WalletService,
};

/// Services shared by every handler.
pub struct AppState {
    pub fees: Arc<FeeService>,
    pub wallets: WalletService,
    pub campaigns: CampaignService,
    pub shares: ShareService,
    pub referrals: ReferralService,
    pub risk: RiskMonitor,
    pub live: Arc<LiveCache>,
    pub gateway_url: String,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(storage: Arc<dyn StorageBackend>, live: Arc<LiveCache>, config: &Config) -> Self {
        let fees = Arc::new(FeeService::new(storage.clone()));
        AppState {
            wallets: WalletService::new(storage.clone(), fees.clone()),
            campaigns: CampaignService::new(storage.clone()),
            shares: ShareService::new(storage.clone(), fees.clone(), config.shares.clone()),
            referrals: ReferralService::new(storage.clone()),
            risk: RiskMonitor::new(storage, config.risk.clone()),
            fees,
            live,
            gateway_url: config.payments.gateway_url.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse { success: true, data }))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal,
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StorageError::AlreadyExists { .. }
            | StorageError::InsufficientFunds(_)
            | StorageError::CampaignExhausted(_)
            | StorageError::StatusConflict { .. } => ApiError::Conflict(e.to_string()),
            StorageError::Invalid(message) => ApiError::BadRequest(message),
            StorageError::Other(message) => {
                tracing::error!(error = %message, "Storage backend failure");
                ApiError::Internal
            }
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Validation(message) => ApiError::BadRequest(message),
            ServiceError::Conflict(message) => ApiError::Conflict(message),
            ServiceError::Fee(e) => ApiError::BadRequest(e.to_string()),
            ServiceError::Link(e) => ApiError::BadRequest(e.to_string()),
            ServiceError::Storage(e) => e.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string()),
        };
        (status, Json(ErrorBody { success: false, error })).into_response()
    }
}

fn parse<T>(field: &str, value: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ApiError::BadRequest(format!("invalid {}: {}", field, e)))
}

pub fn router(state: Arc<AppState>, auth: Arc<AuthConfig>) -> Router {
    let api = Router::new()
        .route("/fees/preview", get(fee_preview))
        .route("/fees/quote", get(fee_quote))
        .route("/fees/schedules", get(list_fee_schedules).post(upsert_fee_schedule))
        .route("/fees/schedules/:transaction_type/:currency", axum::routing::delete(delete_fee_schedule))
        .route("/wallets", get(list_wallets).post(open_wallet))
        .route("/wallets/:id", get(get_wallet))
        .route("/wallets/:id/transactions", get(wallet_history).post(wallet_transact))
        .route("/wallets/:id/risk", get(wallet_risk))
        .route("/risk", get(risk_scan))
        .route("/campaigns", get(list_campaigns).post(create_campaign))
        .route("/campaigns/:id", get(get_campaign).put(update_campaign).delete(delete_campaign))
        .route("/campaigns/:id/calendar-link", get(campaign_calendar_link))
        .route("/shares/purchases", get(list_purchases).post(purchase_shares))
        .route("/shares/purchases/:id/approve", post(approve_purchase))
        .route("/shares/purchases/:id/reject", post(reject_purchase))
        .route("/agents", get(list_agents).post(register_agent))
        .route("/agents/:id/summary", get(agent_summary))
        .route("/agents/:id/whatsapp-link", get(agent_whatsapp_link))
        .route("/referrals", post(record_referral))
        .route("/payments/redirect", get(payment_redirect))
        .route_layer(middleware::from_fn(auth_middleware))
        .layer(Extension(auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(api)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// Fees

async fn fee_preview(
    State(state): State<Arc<AppState>>,
    Query(input): Query<FeeInput>,
) -> ApiResult<crate::fees::FeePreview> {
    ok(state.fees.preview(&input).map_err(ServiceError::from)?)
}

#[derive(Deserialize)]
struct QuoteParams {
    transaction_type: String,
    currency: String,
    amount: Decimal,
}

async fn fee_quote(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuoteParams>,
) -> ApiResult<crate::fees::FeeQuote> {
    let transaction_type: TransactionType = parse("transaction_type", &params.transaction_type)?;
    let currency: Currency = parse("currency", &params.currency)?;
    ok(state.fees.quote(transaction_type, &currency, params.amount)?)
}

/// Served from the live cache.
async fn list_fee_schedules(State(state): State<Arc<AppState>>) -> ApiResult<Vec<FeeSchedule>> {
    ok(state.live.fee_schedules())
}

async fn upsert_fee_schedule(
    State(state): State<Arc<AppState>>,
    Json(command): Json<UpsertFeeScheduleCommand>,
) -> ApiResult<FeeSchedule> {
    ok(state.fees.configure(&command)?)
}

async fn delete_fee_schedule(
    State(state): State<Arc<AppState>>,
    Path((transaction_type, currency)): Path<(String, String)>,
) -> ApiResult<()> {
    let transaction_type: TransactionType = parse("transaction_type", &transaction_type)?;
    let currency: Currency = parse("currency", &currency)?;
    ok(state.fees.remove(transaction_type, &currency)?)
}

// Wallets

#[derive(Deserialize)]
struct UserFilter {
    user_id: Option<Uuid>,
}

/// Unfiltered listings come from the live cache; per-user listings hit storage.
async fn list_wallets(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<UserFilter>,
) -> ApiResult<Vec<Wallet>> {
    match filter.user_id {
        Some(user_id) => ok(state.wallets.list(Some(user_id))?),
        None => ok(state.live.wallets()),
    }
}

async fn open_wallet(
    State(state): State<Arc<AppState>>,
    Json(command): Json<CreateWalletCommand>,
) -> Result<(StatusCode, Json<ApiResponse<Wallet>>), ApiError> {
    let wallet = state.wallets.open(&command)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { success: true, data: wallet })))
}

async fn get_wallet(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Wallet> {
    ok(state.wallets.get(id)?)
}

async fn wallet_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<minefund_core::WalletTransaction>> {
    ok(state.wallets.history(id)?)
}

#[derive(Deserialize)]
struct TransactRequest {
    transaction_type: TransactionType,
    amount: Decimal,
}

async fn wallet_transact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransactRequest>,
) -> ApiResult<crate::wallets::TransactionReceipt> {
    ok(state.wallets.transact(id, request.transaction_type, request.amount)?)
}

async fn wallet_risk(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::risk::RiskReport> {
    ok(state.risk.report(id)?)
}

async fn risk_scan(State(state): State<Arc<AppState>>) -> ApiResult<Vec<crate::risk::RiskReport>> {
    ok(state.risk.scan()?)
}

// Campaigns

/// Served from the live cache; status is derived per request.
async fn list_campaigns(State(state): State<Arc<AppState>>) -> ApiResult<Vec<crate::campaigns::CampaignView>> {
    ok(crate::campaigns::views(state.live.campaigns(), OffsetDateTime::now_utc()))
}

async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Json(command): Json<CampaignCommand>,
) -> Result<(StatusCode, Json<ApiResponse<crate::campaigns::CampaignView>>), ApiError> {
    let view = state.campaigns.create(&command)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { success: true, data: view })))
}

async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::campaigns::CampaignView> {
    ok(state.campaigns.get(id)?)
}

async fn update_campaign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(command): Json<CampaignCommand>,
) -> ApiResult<crate::campaigns::CampaignView> {
    ok(state.campaigns.update(id, &command)?)
}

async fn delete_campaign(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<()> {
    ok(state.campaigns.delete(id)?)
}

#[derive(Serialize)]
struct Link {
    url: String,
}

async fn campaign_calendar_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Link> {
    let campaign = state.campaigns.get(id)?.campaign;
    let details = format!(
        "{}% off share purchases, {} bonus shares, {} cashback",
        campaign.discount_percentage, campaign.bonus_shares, campaign.cashback_amount
    );
    let url = links::calendar_link(&campaign.name, &details, campaign.starts_at, campaign.ends_at)
        .map_err(ServiceError::from)?;
    ok(Link { url: url.to_string() })
}

// Share purchases

async fn list_purchases(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<UserFilter>,
) -> ApiResult<Vec<minefund_core::SharePurchase>> {
    ok(state.shares.list(filter.user_id)?)
}

async fn purchase_shares(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<ApiResponse<crate::shares::PurchaseReceipt>>), ApiError> {
    let receipt = state.shares.purchase(&request)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { success: true, data: receipt })))
}

async fn approve_purchase(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<minefund_core::SharePurchase> {
    ok(state.shares.approve(id)?)
}

async fn reject_purchase(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<minefund_core::SharePurchase> {
    ok(state.shares.reject(id)?)
}

// Agents and referrals

async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult<Vec<minefund_core::Agent>> {
    ok(state.referrals.agents()?)
}

#[derive(Deserialize)]
struct RegisterAgentRequest {
    user_id: Uuid,
    commission_rate: Decimal,
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<minefund_core::Agent>>), ApiError> {
    let agent = state.referrals.register_agent(request.user_id, request.commission_rate)?;
    Ok((StatusCode::CREATED, Json(ApiResponse { success: true, data: agent })))
}

async fn agent_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::referrals::AgentSummary> {
    ok(state.referrals.summary(id)?)
}

#[derive(Deserialize)]
struct WhatsappParams {
    phone: String,
    message: Option<String>,
}

async fn agent_whatsapp_link(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<WhatsappParams>,
) -> ApiResult<Link> {
    let agent = state.referrals.agent(id)?;
    let message = params.message.unwrap_or_else(|| {
        format!("Invest in mining shares on Minefund with my referral code {}", agent.referral_code)
    });
    let url = links::whatsapp_link(&params.phone, &message).map_err(ServiceError::from)?;
    ok(Link { url: url.to_string() })
}

#[derive(Deserialize)]
struct ReferralRequest {
    referral_code: String,
    referred_user_id: Uuid,
    purchase_amount: Decimal,
}

async fn record_referral(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReferralRequest>,
) -> Result<(StatusCode, Json<ApiResponse<minefund_core::Referral>>), ApiError> {
    let referral = state.referrals.record_referral(
        &request.referral_code,
        request.referred_user_id,
        request.purchase_amount,
    )?;
    Ok((StatusCode::CREATED, Json(ApiResponse { success: true, data: referral })))
}

// Payments

#[derive(Deserialize)]
struct RedirectParams {
    reference: String,
    amount: Decimal,
    currency: String,
}

async fn payment_redirect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RedirectParams>,
) -> ApiResult<Link> {
    let currency: Currency = parse("currency", &params.currency)?;
    let url = links::payment_redirect(&state.gateway_url, &params.reference, params.amount, &currency)
        .map_err(ServiceError::from)?;
    ok(Link { url: url.to_string() })
}
