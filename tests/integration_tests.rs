use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower::ServiceExt;
use uuid::Uuid;

use minefund::api::{self, AppState};
use minefund::campaigns::CampaignService;
use minefund::config::{ApiKeyEntry, AuthConfig, Config};
use minefund::fees::FeeService;
use minefund::live::LiveCache;
use minefund::referrals::ReferralService;
use minefund::risk::{RiskLevel, RiskMonitor, RiskThresholds};
use minefund::service::ServiceError;
use minefund::shares::{PurchaseRequest, ShareService, SharesConfig};
use minefund::storage::{InMemoryStorage, StorageBackend};
use minefund::wallets::WalletService;
use minefund_core::{
    CampaignCommand, CreateWalletCommand, Currency, PurchaseStatus, TransactionType,
    UpsertFeeScheduleCommand, Wallet,
};

struct Services {
    storage: Arc<dyn StorageBackend>,
    fees: Arc<FeeService>,
    wallets: WalletService,
    campaigns: CampaignService,
    shares: ShareService,
    referrals: ReferralService,
}

fn setup() -> Services {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let fees = Arc::new(FeeService::new(storage.clone()));
    Services {
        wallets: WalletService::new(storage.clone(), fees.clone()),
        campaigns: CampaignService::new(storage.clone()),
        shares: ShareService::new(storage.clone(), fees.clone(), SharesConfig::default()),
        referrals: ReferralService::new(storage.clone()),
        fees,
        storage,
    }
}

fn usd() -> Currency {
    Currency::new("USD").unwrap()
}

fn funded_wallet(services: &Services, amount: Decimal) -> Wallet {
    let wallet = services.wallets.open(&CreateWalletCommand {
        user_id: Uuid::new_v4(),
        currency: usd(),
    }).unwrap();
    services.wallets.transact(wallet.id, TransactionType::Deposit, amount).unwrap();
    services.wallets.get(wallet.id).unwrap()
}

fn live_campaign(discount: Decimal, cashback: Decimal, cap: Option<u32>) -> CampaignCommand {
    let now = OffsetDateTime::now_utc();
    CampaignCommand {
        name: "Spring drilling".to_string(),
        discount_percentage: discount,
        bonus_shares: 2,
        cashback_amount: cashback,
        starts_at: now - time::Duration::hours(1),
        ends_at: now + time::Duration::hours(1),
        usage_cap: cap,
        active: true,
    }
}

#[test]
fn test_share_purchase_with_campaign_and_fee() {
    let services = setup();
    services.fees.configure(&UpsertFeeScheduleCommand {
        transaction_type: TransactionType::SharePurchase,
        currency: usd(),
        percentage_rate: dec!(1),
        flat_fee: dec!(0),
    }).unwrap();
    let wallet = funded_wallet(&services, dec!(1000));
    let campaign = services.campaigns.create(&live_campaign(dec!(10), dec!(5), None)).unwrap().campaign;

    let receipt = services.shares.purchase(&PurchaseRequest {
        user_id: wallet.user_id,
        wallet_id: wallet.id,
        quantity: 3,
        campaign_id: Some(campaign.id),
    }).unwrap();

    assert_eq!(receipt.gross, dec!(300));
    assert_eq!(receipt.discount, dec!(30));
    assert_eq!(receipt.fee.total_fee, dec!(2.70));
    assert_eq!(receipt.purchase.total_cost, dec!(272.70));
    assert_eq!(receipt.purchase.bonus_shares, 2);
    assert_eq!(receipt.purchase.status, PurchaseStatus::Pending);
    assert_eq!(services.wallets.get(wallet.id).unwrap().balance, dec!(727.30));
    assert_eq!(services.campaigns.get(campaign.id).unwrap().campaign.usage_count, 1);

    let approved = services.shares.approve(receipt.purchase.id).unwrap();
    assert_eq!(approved.status, PurchaseStatus::Approved);
    assert_eq!(services.wallets.get(wallet.id).unwrap().balance, dec!(732.30));

    match services.shares.reject(receipt.purchase.id) {
        Err(ServiceError::Conflict(_)) => {}
        other => panic!("Expected conflict, got {:?}", other),
    }
}

#[test]
fn test_rejected_purchase_is_refunded() {
    let services = setup();
    let wallet = funded_wallet(&services, dec!(500));
    let receipt = services.shares.purchase(&PurchaseRequest {
        user_id: wallet.user_id,
        wallet_id: wallet.id,
        quantity: 4,
        campaign_id: None,
    }).unwrap();
    assert_eq!(services.wallets.get(wallet.id).unwrap().balance, dec!(100));

    let rejected = services.shares.reject(receipt.purchase.id).unwrap();
    assert_eq!(rejected.status, PurchaseStatus::Rejected);
    assert_eq!(services.wallets.get(wallet.id).unwrap().balance, dec!(500));

    let history = services.wallets.history(wallet.id).unwrap();
    let types: Vec<TransactionType> = history.iter().map(|t| t.transaction_type).collect();
    assert_eq!(types, vec![TransactionType::Deposit, TransactionType::SharePurchase, TransactionType::Refund]);
}

#[test]
fn test_purchase_beyond_balance_leaves_no_trace() {
    let services = setup();
    let wallet = funded_wallet(&services, dec!(150));
    let result = services.shares.purchase(&PurchaseRequest {
        user_id: wallet.user_id,
        wallet_id: wallet.id,
        quantity: 2,
        campaign_id: None,
    });
    match result {
        Err(ServiceError::Storage(minefund_core::StorageError::InsufficientFunds(id))) => assert_eq!(id, wallet.id),
        other => panic!("Expected insufficient funds, got {:?}", other),
    }
    assert!(services.shares.list(Some(wallet.user_id)).unwrap().is_empty());
    assert_eq!(services.wallets.get(wallet.id).unwrap().balance, dec!(150));
}

#[test]
fn test_exhausted_campaign_refunds_debit() {
    let services = setup();
    let campaign = services.campaigns.create(&live_campaign(dec!(0), dec!(0), Some(1))).unwrap().campaign;
    let first = funded_wallet(&services, dec!(1000));
    let second = funded_wallet(&services, dec!(1000));

    services.shares.purchase(&PurchaseRequest {
        user_id: first.user_id,
        wallet_id: first.id,
        quantity: 1,
        campaign_id: Some(campaign.id),
    }).unwrap();

    // The cap is hit, so the campaign is no longer live.
    let result = services.shares.purchase(&PurchaseRequest {
        user_id: second.user_id,
        wallet_id: second.id,
        quantity: 1,
        campaign_id: Some(campaign.id),
    });
    assert!(matches!(result, Err(ServiceError::Conflict(_))));
    assert_eq!(services.wallets.get(second.id).unwrap().balance, dec!(1000));
}

#[test]
fn test_referral_program_totals() {
    let services = setup();
    let agent = services.referrals.register_agent(Uuid::new_v4(), dec!(3)).unwrap();
    services.referrals.record_referral(&agent.referral_code, Uuid::new_v4(), dec!(2500)).unwrap();
    services.referrals.record_referral(&agent.referral_code, Uuid::new_v4(), dec!(500)).unwrap();

    let summary = services.referrals.summary(agent.id).unwrap();
    assert_eq!(summary.referrals, 2);
    assert_eq!(summary.total_volume, dec!(3000));
    assert_eq!(summary.total_commission, dec!(90));
}

#[test]
fn test_risk_scan_flags_drained_wallet() {
    let services = setup();
    let quiet = funded_wallet(&services, dec!(100));
    let drained = funded_wallet(&services, dec!(20000));
    services.wallets.transact(drained.id, TransactionType::Withdrawal, dec!(19500)).unwrap();

    let monitor = RiskMonitor::new(services.storage.clone(), RiskThresholds::default());
    let reports = monitor.scan().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].wallet_id, drained.id);
    // Large transaction, rapid withdrawal and drained balance.
    assert_eq!(reports[0].score, 75);
    assert_eq!(reports[0].level, RiskLevel::Critical);
    assert_eq!(reports[1].wallet_id, quiet.id);
    assert_eq!(reports[1].level, RiskLevel::Low);
}

#[test]
fn test_fee_schedule_replaced_per_pair() {
    let services = setup();
    for rate in [dec!(1), dec!(2.5)] {
        services.fees.configure(&UpsertFeeScheduleCommand {
            transaction_type: TransactionType::Withdrawal,
            currency: usd(),
            percentage_rate: rate,
            flat_fee: dec!(0.5),
        }).unwrap();
    }
    let schedules = services.fees.schedules().unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].percentage_rate, dec!(2.5));

    let quote = services.fees.quote(TransactionType::Withdrawal, &usd(), dec!(200)).unwrap();
    assert_eq!(quote.breakdown.total_fee, dec!(5.5));
    assert_eq!(quote.breakdown.net_amount, dec!(194.5));
}

// HTTP

fn app_with(auth: AuthConfig) -> (Router, Arc<dyn StorageBackend>) {
    let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
    let live = Arc::new(LiveCache::new());
    live.spawn(storage.clone()).unwrap();
    let state = AppState::new(storage.clone(), live, &Config::default());
    (api::router(Arc::new(state), Arc::new(auth)), storage)
}

fn app() -> (Router, Arc<dyn StorageBackend>) {
    app_with(AuthConfig::default())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>, key: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn decimal(value: &Value) -> Decimal {
    value.as_str().expect("decimal serialized as string").parse().unwrap()
}

#[tokio::test]
async fn test_http_fee_preview() {
    let (app, _) = app();
    let (status, body) = send(&app, "GET", "/fees/preview?amount=1000&percentage_rate=5&flat_fee=200", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(decimal(&body["data"]["breakdown"]["percentage_component"]), dec!(50));
    assert_eq!(decimal(&body["data"]["breakdown"]["total_fee"]), dec!(250));
    assert_eq!(decimal(&body["data"]["breakdown"]["net_amount"]), dec!(750));
    assert_eq!(body["data"]["display"]["net_amount"], json!("750.00"));
    assert_eq!(body["data"]["warning"], Value::Null);

    let (status, body) = send(&app, "GET", "/fees/preview?amount=100&percentage_rate=150&flat_fee=0", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["display"]["net_amount"], json!("-50.00"));
    assert!(body["data"]["warning"].is_string());

    let (status, body) = send(&app, "GET", "/fees/preview?amount=-1&percentage_rate=5&flat_fee=0", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"], json!("amount must not be negative"));
}

#[tokio::test]
async fn test_http_wallet_flow() {
    let (app, _) = app();
    let user_id = Uuid::new_v4();
    let (status, body) = send(&app, "POST", "/wallets", Some(json!({ "user_id": user_id, "currency": "usd" })), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let wallet_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["currency"], json!("USD"));

    let (status, _) = send(&app, "POST", "/wallets", Some(json!({ "user_id": user_id, "currency": "USD" })), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/wallets/{}/transactions", wallet_id),
        Some(json!({ "transaction_type": "deposit", "amount": "250" })),
        None,
    ).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decimal(&body["data"]["balance"]), dec!(250));

    let (status, body) = send(
        &app,
        "POST",
        &format!("/wallets/{}/transactions", wallet_id),
        Some(json!({ "transaction_type": "withdrawal", "amount": "400" })),
        None,
    ).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], json!(false));

    let (status, body) = send(&app, "GET", &format!("/wallets/{}/risk", wallet_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["level"], json!("low"));

    let (status, _) = send(&app, "GET", &format!("/wallets/{}", Uuid::new_v4()), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The unfiltered listing is served by the live cache, which catches up asynchronously.
    let mut listed = 0;
    for _ in 0..50 {
        let (_, body) = send(&app, "GET", "/wallets", None, None).await;
        listed = body["data"].as_array().map_or(0, |a| a.len());
        if listed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listed, 1);
}

#[tokio::test]
async fn test_http_campaign_links() {
    let (app, _) = app();
    let now = OffsetDateTime::now_utc();
    let command = json!({
        "name": "Gold rush",
        "discount_percentage": "15",
        "starts_at": now.format(&Rfc3339).unwrap(),
        "ends_at": (now + time::Duration::days(7)).format(&Rfc3339).unwrap(),
    });
    let (status, body) = send(&app, "POST", "/campaigns", Some(command), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], json!("live"));
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/campaigns/{}/calendar-link", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["url"].as_str().unwrap().starts_with("https://calendar.google.com/"));

    // The listing comes from the live cache, so a new campaign shows up once the change lands.
    let mut listed = Value::Null;
    for _ in 0..50 {
        let (status, body) = send(&app, "GET", "/campaigns", None, None).await;
        assert_eq!(status, StatusCode::OK);
        listed = body["data"].clone();
        if listed.as_array().map_or(0, |a| a.len()) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(listed[0]["id"], json!(id));
    assert_eq!(listed[0]["status"], json!("live"));

    let invalid = json!({
        "name": "",
        "starts_at": now.format(&Rfc3339).unwrap(),
        "ends_at": now.format(&Rfc3339).unwrap(),
    });
    let (status, _) = send(&app, "POST", "/campaigns", Some(invalid), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", "/payments/redirect?reference=INV-7&amount=99.5&currency=usd", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let url = body["data"]["url"].as_str().unwrap();
    assert!(url.contains("reference=INV-7"));
    assert!(url.contains("amount=99.50"));
    assert!(url.contains("currency=USD"));
}

#[tokio::test]
async fn test_http_agent_whatsapp_link() {
    let (app, _) = app();
    let (status, body) = send(&app, "POST", "/agents", Some(json!({ "user_id": Uuid::new_v4(), "commission_rate": "5" })), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let code = body["data"]["referral_code"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "GET", &format!("/agents/{}/whatsapp-link?phone=%2B27%2082%20555%201234", id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let url = body["data"]["url"].as_str().unwrap();
    assert!(url.starts_with("https://wa.me/27825551234?text="));
    assert!(url.contains(&code));

    let (status, _) = send(&app, "GET", &format!("/agents/{}/whatsapp-link?phone=123", id), None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/referrals",
        Some(json!({ "referral_code": code, "referred_user_id": Uuid::new_v4(), "purchase_amount": "1000" })),
        None,
    ).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(&app, "GET", &format!("/agents/{}/summary", id), None, None).await;
    assert_eq!(decimal(&body["data"]["total_commission"]), dec!(50));
}

#[tokio::test]
async fn test_http_auth_roles() {
    let auth = AuthConfig {
        enabled: true,
        api_keys: vec![
            ApiKeyEntry { name: "ops".to_string(), key: "admin-key".to_string(), role: "admin".to_string() },
            ApiKeyEntry { name: "bi".to_string(), key: "reader-key".to_string(), role: "reader".to_string() },
        ],
    };
    let (app, _) = app_with(auth);

    let (status, _) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, "GET", "/campaigns", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));

    let (status, _) = send(&app, "GET", "/campaigns", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/campaigns", None, Some("reader-key")).await;
    assert_eq!(status, StatusCode::OK);

    let wallet = json!({ "user_id": Uuid::new_v4(), "currency": "EUR" });
    let (status, _) = send(&app, "POST", "/wallets", Some(wallet.clone()), Some("reader-key")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, "POST", "/wallets", Some(wallet), Some("admin-key")).await;
    assert_eq!(status, StatusCode::CREATED);
}
