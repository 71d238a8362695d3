use chrono::NaiveTime;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ipnetwork::IpNetwork;
use plugsql_core::query::conversion::{
    interval_to_text, join_text_array, network_to_text, numeric_to_float, time_to_text,
    uuid_to_text,
};
use plugsql_core::search_path::compute_required_search_path;
use sqlx::postgres::types::PgInterval;
use sqlx::types::BigDecimal;
use std::str::FromStr;

fn benchmark_text_array_join(c: &mut Criterion) {
    let items: Vec<Option<String>> = (0..32).map(|i| Some(format!("tag-{i}"))).collect();
    c.bench_function("join_text_array_32", |b| {
        b.iter(|| join_text_array(black_box(items.clone())))
    });
}

fn benchmark_scalar_conversions(c: &mut Criterion) {
    let network = IpNetwork::from_str("10.0.0.1/32").unwrap();
    let interval = PgInterval {
        months: 14,
        days: 3,
        microseconds: 14_706_500_000,
    };
    let time = NaiveTime::from_hms_micro_opt(4, 5, 6, 500_000).unwrap();
    let numeric = BigDecimal::from_str("12345.6789").unwrap();

    c.bench_function("network_to_text", |b| b.iter(|| network_to_text(black_box(&network))));
    c.bench_function("uuid_to_text", |b| b.iter(|| uuid_to_text(black_box([7u8; 16]))));
    c.bench_function("interval_to_text", |b| {
        b.iter(|| interval_to_text(black_box(&interval)))
    });
    c.bench_function("time_to_text", |b| b.iter(|| time_to_text(black_box(time))));
    c.bench_function("numeric_to_float", |b| {
        b.iter(|| numeric_to_float(black_box(&numeric)))
    });
}

fn benchmark_search_path(c: &mut Criterion) {
    let user: Vec<String> = (0..20).map(|i| format!("plugin_{i}")).collect();
    let prefix: Vec<String> = vec!["plugin_3".to_string(), "custom".to_string()];
    c.bench_function("compute_required_search_path", |b| {
        b.iter(|| compute_required_search_path(black_box(&user), &[], black_box(&prefix)))
    });
}

criterion_group!(
    benches,
    benchmark_text_array_join,
    benchmark_scalar_conversions,
    benchmark_search_path
);
criterion_main!(benches);
