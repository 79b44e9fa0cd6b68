//! Benchmarks for template rendering
//!
//! These benchmarks measure scanning and expansion cost as templates grow
//! in length, in list size and in rescanning depth.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use macrosql_engine::{scan, Engine, EngineOptionsBuilder, IntervalContext, Origin};

fn interval() -> IntervalContext {
    IntervalContext::parse("2023-01-01", Some("2023-01-31"), None).expect("valid interval")
}

/// Generate a query with N CTEs, each filtered by a clause operator
fn generate_clause_query(num_ctes: usize) -> String {
    let mut template = String::from("@DEF(enabled, True);\n@DEF(min_id, 10);\nWITH ");
    let ctes: Vec<String> = (0..num_ctes)
        .map(|i| {
            format!(
                "cte_{i} AS (\n  SELECT id, name FROM source_{i}\n  @WHERE(@enabled) id > @min_id AND ds >= @start_ds\n  @ORDER_BY(False) name\n)"
            )
        })
        .collect();
    template.push_str(&ctes.join(",\n"));
    template.push_str("\nSELECT * FROM cte_0");
    template
}

/// Generate a column list with N items
fn generate_each_query(num_columns: usize) -> String {
    let columns: Vec<String> = (0..num_columns).map(|i| format!("'col_{}'", i)).collect();
    format!(
        "@DEF(columns, [{}]);\nSELECT @EACH(@columns, c -> c) FROM wide_table WHERE @FILTER(@columns, c -> len(c) > 5, 'OR')",
        columns.join(", ")
    )
}

/// Generate a chain of N snippets, each referencing the next
fn generate_snippet_chain(depth: usize) -> EngineOptionsBuilder {
    let mut builder = EngineOptionsBuilder::new().max_depth(depth + 2);
    for i in 0..depth {
        builder = builder.snippet(format!("s_{}", i), format!("@s_{} + {}", i + 1, i));
    }
    builder.snippet(format!("s_{}", depth), "0")
}

fn bench_scanning(c: &mut Criterion) {
    let mut group = c.benchmark_group("scanning");

    for num_ctes in [10, 100, 500].iter() {
        let template = generate_clause_query(*num_ctes);

        group.bench_with_input(BenchmarkId::new("clause_query", num_ctes), &template, |b, template| {
            b.iter(|| scan(black_box(template), Origin::Template { base: 0 }))
        });
    }

    group.finish();
}

fn bench_clause_rendering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clause_rendering");
    let engine = Engine::default();
    let interval = interval();

    for num_ctes in [10, 100, 500].iter() {
        let template = generate_clause_query(*num_ctes);

        group.bench_with_input(BenchmarkId::new("ctes", num_ctes), &template, |b, template| {
            b.iter(|| engine.render(black_box(template), &interval))
        });
    }

    group.finish();
}

fn bench_combinators(c: &mut Criterion) {
    let mut group = c.benchmark_group("combinators");
    let engine = Engine::default();
    let interval = interval();

    for num_columns in [10, 100, 1000].iter() {
        let template = generate_each_query(*num_columns);

        group.bench_with_input(BenchmarkId::new("each_filter", num_columns), &template, |b, template| {
            b.iter(|| engine.render(black_box(template), &interval))
        });
    }

    group.finish();
}

fn bench_rescanning(c: &mut Criterion) {
    let mut group = c.benchmark_group("rescanning");
    let interval = interval();

    for depth in [4, 16, 64].iter() {
        let engine = Engine::new(generate_snippet_chain(*depth).build());

        group.bench_with_input(BenchmarkId::new("snippet_chain", depth), depth, |b, _| {
            b.iter(|| engine.render(black_box("SELECT @s_0"), &interval))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scanning,
    bench_clause_rendering,
    bench_combinators,
    bench_rescanning
);

criterion_main!(benches);
