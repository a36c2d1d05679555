//! Criterion benchmarks for indicator hot paths.
//!
//! Benchmarks:
//! 1. Builtin calculators over 1y / 5y / 10y of daily bars
//! 2. Normalizer over vendor rows (parse, dedup, sort)

use chrono::{Duration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tidemark_core::data::{daily_rows, NormalizeSpec, Normalizer};
use tidemark_core::domain::IndicatorParams;
use tidemark_core::indicators::{CalculatorRegistry, PriceBar};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_bars(n: usize) -> Vec<PriceBar> {
    let base = NaiveDate::from_ymd_opt(2015, 1, 2)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (0..n)
        .map(|i| {
            let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            PriceBar {
                timestamp: base + Duration::days(i as i64),
                open: close - 0.3,
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: Some(1_000_000.0),
            }
        })
        .collect()
}

// ── 1. Calculators ───────────────────────────────────────────────────

fn bench_calculators(c: &mut Criterion) {
    let registry = CalculatorRegistry::with_builtins();
    let mut group = c.benchmark_group("calculators");

    for &bar_count in &[252, 1260, 2520] {
        let bars = make_bars(bar_count);
        for key in registry.keys() {
            let calc = registry.get(&key).unwrap();
            let params: IndicatorParams = calc.definition().default_params.clone();
            group.bench_with_input(BenchmarkId::new(key.as_str(), bar_count), &bars, |b, bars| {
                b.iter(|| calc.compute("BENCH", black_box(bars), black_box(&params)).unwrap());
            });
        }
    }

    group.finish();
}

// ── 2. Normalizer ────────────────────────────────────────────────────

fn bench_normalize(c: &mut Criterion) {
    let base = NaiveDate::from_ymd_opt(2015, 1, 2).unwrap();
    let closes: Vec<_> = (0..2520)
        .map(|i| (base + Duration::days(i), 100.0 + i as f64 * 0.01))
        .collect();
    let rows = daily_rows("BENCH", &closes);
    let normalizer = Normalizer::new(NormalizeSpec::daily_bars());

    c.bench_function("normalize_daily_2520", |b| {
        b.iter(|| normalizer.normalize("BENCH", "bench", black_box(&rows)));
    });
}

criterion_group!(benches, bench_calculators, bench_normalize);
criterion_main!(benches);
