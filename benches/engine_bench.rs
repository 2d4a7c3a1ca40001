use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use uuid::Uuid;

use minefund::fees::{compute_fee, FeeInput};
use minefund::risk::{score_wallet, RiskThresholds};
use minefund_core::{Currency, TransactionType, Wallet, WalletTransaction};

fn seed_history(wallet: &Wallet, count: usize) -> Vec<WalletTransaction> {
    let start = OffsetDateTime::now_utc() - time::Duration::days(30);
    (0..count)
        .map(|i| {
            let transaction_type = if i % 3 == 0 {
                TransactionType::Withdrawal
            } else {
                TransactionType::Deposit
            };
            WalletTransaction {
                id: Uuid::new_v4(),
                wallet_id: wallet.id,
                transaction_type,
                amount: dec!(250) * rust_decimal::Decimal::from(i % 50 + 1),
                fee: dec!(1.5),
                net_amount: dec!(248.5),
                created_at: start + time::Duration::minutes(i as i64 * 17),
            }
        })
        .collect()
}

fn bench_compute_fee(c: &mut Criterion) {
    let input = FeeInput::new(dec!(1234.56), dec!(2.75), dec!(1.50));
    c.bench_function("compute_fee", |b| {
        b.iter(|| compute_fee(black_box(&input)))
    });

    c.bench_function("compute_fee_display", |b| {
        b.iter(|| compute_fee(black_box(&input)).display())
    });
}

fn bench_score_wallet(c: &mut Criterion) {
    let wallet = Wallet {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        currency: Currency::new("USD").unwrap(),
        balance: dec!(5000),
        created_at: OffsetDateTime::now_utc(),
    };
    let thresholds = RiskThresholds::default();

    let small = seed_history(&wallet, 20);
    c.bench_function("score_wallet_20", |b| {
        b.iter(|| score_wallet(black_box(&wallet), black_box(&small), &thresholds))
    });

    let large = seed_history(&wallet, 500);
    c.bench_function("score_wallet_500", |b| {
        b.iter(|| score_wallet(black_box(&wallet), black_box(&large), &thresholds))
    });
}

criterion_group!(benches, bench_compute_fee, bench_score_wallet);
criterion_main!(benches);
