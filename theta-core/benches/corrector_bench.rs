//! Criterion benchmarks for the correction hot paths.
//!
//! Benchmarks:
//! 1. Zero repair over a greeks partition with scattered degenerate rows
//! 2. Gap fill over an underlying series with periodic holes
//! 3. Canonical sort + dedup of an unsorted option partition

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use theta_core::corrector::{Corrector, CorrectorConfig};
use theta_core::domain::{DataKind, PartitionData, PartitionRows, WorkUnit};
use theta_core::testing::sample_rows;

// ── Helpers ──────────────────────────────────────────────────────────

fn date(day: u32) -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn greeks_with_zeros(bars: usize) -> PartitionData {
    let unit = WorkUnit::option("SPX", date(2), date(5), DataKind::OptionGreeks).unwrap();
    let mut rows = sample_rows(&unit, bars);
    if let PartitionRows::Greeks(r) = &mut rows {
        for row in r.iter_mut().skip(3).step_by(17) {
            row.bid = 0.0;
            row.ask = 0.0;
            row.underlying_price = 0.0;
        }
    }
    PartitionData::new(unit, rows)
}

fn underlying_with_holes(bars: usize) -> PartitionData {
    let unit = WorkUnit::underlying("SPX", date(2));
    let mut rows = sample_rows(&unit, bars);
    if let PartitionRows::Underlying(r) = &mut rows {
        let mut i = 0;
        r.retain(|_| {
            i += 1;
            i % 11 != 0
        });
    }
    PartitionData::new(unit, rows)
}

// ── 1. Zero repair ───────────────────────────────────────────────────

fn bench_zero_repair(c: &mut Criterion) {
    let corrector = Corrector::new(CorrectorConfig::default());
    let mut group = c.benchmark_group("zero_repair");
    for bars in [390, 3_900] {
        let data = greeks_with_zeros(bars);
        group.bench_with_input(BenchmarkId::from_parameter(bars), &data, |b, data| {
            b.iter(|| {
                let mut d = data.clone();
                black_box(corrector.zero_repair(&mut d))
            })
        });
    }
    group.finish();
}

// ── 2. Gap fill ──────────────────────────────────────────────────────

fn bench_gap_fill(c: &mut Criterion) {
    let corrector = Corrector::new(CorrectorConfig::default());
    let data = underlying_with_holes(23_400);
    c.bench_function("gap_fill_23400", |b| {
        b.iter(|| {
            let mut d = data.clone();
            black_box(corrector.gap_fill(&mut d, chrono::Duration::minutes(1)))
        })
    });
}

// ── 3. Canonicalize ──────────────────────────────────────────────────

fn bench_canonicalize(c: &mut Criterion) {
    let unit = WorkUnit::option("SPX", date(2), date(5), DataKind::OptionOhlc).unwrap();
    let mut data = PartitionData::new(unit.clone(), sample_rows(&unit, 2_000));
    if let PartitionRows::OptionOhlc(r) = &mut data.rows {
        r.reverse();
    }
    c.bench_function("canonicalize_8000", |b| {
        b.iter(|| {
            let mut d = data.clone();
            d.canonicalize();
            black_box(d.len())
        })
    });
}

criterion_group!(benches, bench_zero_repair, bench_gap_fill, bench_canonicalize);
criterion_main!(benches);
