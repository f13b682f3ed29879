//! Benchmarks for order book store operations

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use exchange_stream::orderbook::BufferedUpdate;
use exchange_stream::{Asset, Book, BookKey, CurrencyPair, OrderBookStore, PriceLevel};
use rust_decimal::Decimal;
use std::str::FromStr;

const EXCHANGE: &str = "kraken";

fn ts(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
}

fn pair() -> CurrencyPair {
    CurrencyPair::new("XBT", "USD")
}

fn create_snapshot(levels: usize) -> Book {
    let amount = Decimal::from_str("1.5").unwrap();
    let bids = (0..levels)
        .map(|i| PriceLevel::new(Decimal::from(50000 - i as i64), amount))
        .collect();
    let asks = (0..levels)
        .map(|i| PriceLevel::new(Decimal::from(50001 + i as i64), amount))
        .collect();

    Book::snapshot(EXCHANGE, pair(), Asset::Spot, bids, asks, ts(1_000))
}

fn loaded_store(levels: usize) -> OrderBookStore {
    let store = OrderBookStore::new();
    store
        .load_snapshot(create_snapshot(levels), EXCHANGE, true)
        .unwrap();
    store
}

fn benchmark_load_snapshot(c: &mut Criterion) {
    let snapshot = create_snapshot(100);
    let store = OrderBookStore::new();

    c.bench_function("load_snapshot_100_levels", |b| {
        b.iter(|| {
            store
                .load_snapshot(black_box(snapshot.clone()), EXCHANGE, true)
                .unwrap();
        })
    });
}

fn benchmark_update(c: &mut Criterion) {
    let store = loaded_store(100);
    let bids = vec![PriceLevel::new(Decimal::from(49999), Decimal::from(2))];
    let asks = vec![PriceLevel::new(
        Decimal::from(50001),
        Decimal::from_str("2.5").unwrap(),
    )];
    let mut marker = 1_000;

    c.bench_function("update", |b| {
        b.iter(|| {
            marker += 1;
            store
                .update(
                    black_box(&bids),
                    black_box(&asks),
                    &pair(),
                    ts(marker),
                    EXCHANGE,
                    Asset::Spot,
                )
                .unwrap();
        })
    });
}

fn benchmark_buffered_drain(c: &mut Criterion) {
    let key = BookKey::new(EXCHANGE, pair(), Asset::Spot);

    c.bench_function("buffered_drain_10_deltas", |b| {
        b.iter_batched(
            || {
                let store = loaded_store(100);
                // Reversed so the drain has to sort
                let updates: Vec<BufferedUpdate> = (0..10)
                    .rev()
                    .map(|i| {
                        BufferedUpdate::new(
                            vec![PriceLevel::new(Decimal::from(49990 + i), Decimal::from(3))],
                            vec![PriceLevel::new(Decimal::from(50010 + i), Decimal::ZERO)],
                            ts(2_000 + i),
                        )
                    })
                    .collect();
                (store, updates)
            },
            |(store, updates)| {
                for update in updates {
                    black_box(store.buffer_update(&key, update, 10).unwrap());
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn benchmark_get(c: &mut Criterion) {
    let store = loaded_store(100);

    c.bench_function("get_100_levels", |b| {
        b.iter(|| {
            black_box(store.get(EXCHANGE, &pair(), Asset::Spot).unwrap());
        })
    });
}

criterion_group!(
    benches,
    benchmark_load_snapshot,
    benchmark_update,
    benchmark_buffered_drain,
    benchmark_get
);
criterion_main!(benches);
