//! Criterion benchmarks for rdbms_layer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rdbms_layer::core::query::Query;
use rdbms_layer::core::query_builder::InsertBuilder;
use rdbms_layer::core::{
    Conditions, DatabaseDomain, DatabaseRow, DatabaseValue, LikeMatch, QueryFlags, SelectBuilder,
    SelectOptions,
};

// ============================================================================
// Statement Classification Benchmarks
// ============================================================================

fn bench_query_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_classification");
    group.throughput(Throughput::Elements(1));

    let statements = [
        ("select", "SELECT page_id, page_title FROM page WHERE page_namespace = 0"),
        ("insert", "INSERT INTO page (page_title) VALUES ('Main')"),
        ("commented", "/* Article::view */ -- trace\nUPDATE page SET page_touched = 1"),
        ("savepoint", "ROLLBACK TO SAVEPOINT rdbms_atomic3"),
    ];

    for (name, sql) in statements {
        group.bench_function(name, |b| {
            b.iter(|| {
                let query = Query::new(black_box(sql), QueryFlags::empty());
                black_box((query.verb(), query.is_write()))
            });
        });
    }

    group.finish();
}

// ============================================================================
// Domain Benchmarks
// ============================================================================

fn bench_domain_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain_ids");
    group.throughput(Throughput::Elements(1));

    let domain = DatabaseDomain::new(Some("my-wiki"), Some("public"), "mw_").unwrap();
    let id = domain.id();

    group.bench_function("render", |b| {
        b.iter(|| black_box(domain.id()));
    });

    group.bench_function("parse", |b| {
        b.iter(|| black_box(DatabaseDomain::from_id(black_box(&id)).unwrap()));
    });

    group.finish();
}

// ============================================================================
// SQL Generation Benchmarks
// ============================================================================

#[cfg(feature = "sqlite")]
fn bench_sql_generation(c: &mut Criterion) {
    use rdbms_layer::backends::{SqlDialect, SqliteDriver};

    let mut group = c.benchmark_group("sql_generation");
    let dialect = SqliteDriver::new();

    group.bench_function("select", |b| {
        let conds = Conditions::new()
            .eq("page_namespace", 0)
            .in_list("page_id", [1, 2, 3, 5, 8])
            .like("page_title", vec![LikeMatch::Literal("Main_".into()), LikeMatch::AnyString]);
        let options = SelectOptions::new().order_by_desc("page_id").limit(50);
        b.iter(|| {
            let sql = SelectBuilder::new(vec!["\"page\"".to_string()])
                .columns(&["page_id", "page_title"])
                .conditions(conds.clone())
                .options(options.clone())
                .build(&dialect);
            black_box(sql)
        });
    });

    for size in [1, 10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        let rows: Vec<DatabaseRow> = (0..size)
            .map(|i| {
                [
                    ("id", DatabaseValue::from(i as i64)),
                    ("title", DatabaseValue::from(format!("it's page {}", i))),
                    ("data", DatabaseValue::from(vec![0u8, 1, 2, 3])),
                ]
                .into_iter()
                .collect()
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("insert", size), &rows, |b, rows| {
            b.iter(|| {
                let sql = InsertBuilder::new("\"page\"")
                    .rows(rows.iter().cloned())
                    .build(&dialect)
                    .unwrap();
                black_box(sql)
            });
        });
    }

    group.bench_function("quote_string", |b| {
        let text = "O'Reilly's \"quoted\" title with ' many ' quotes";
        b.iter(|| black_box(dialect.quote_string(black_box(text))));
    });

    group.finish();
}

// ============================================================================
// Connection Benchmarks
// ============================================================================

#[cfg(feature = "sqlite")]
fn bench_connection(c: &mut Criterion) {
    use rdbms_layer::core::{Cancelable, ConnectionConfig};
    use rdbms_layer::{ConnectMode, DatabaseFactory};

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut conn = rt
        .block_on(DatabaseFactory::new().create(
            "sqlite",
            ConnectionConfig::sqlite(":memory:"),
            ConnectMode::Connected,
        ))
        .unwrap();
    rt.block_on(conn.query(
        "CREATE TABLE bench (id INTEGER PRIMARY KEY, v TEXT)",
        "bench",
        QueryFlags::empty(),
    ))
    .unwrap();

    let mut group = c.benchmark_group("connection");
    group.throughput(Throughput::Elements(1));

    group.bench_function("select_1", |b| {
        b.iter(|| {
            let result = rt
                .block_on(conn.query("SELECT 1", "bench", QueryFlags::empty()))
                .unwrap();
            black_box(result)
        });
    });

    group.bench_function("insert_in_atomic_section", |b| {
        let row: DatabaseRow = [("v", "value")].into_iter().collect();
        b.iter(|| {
            rt.block_on(async {
                conn.start_atomic("bench", Cancelable::Yes).await.unwrap();
                conn.insert("bench", std::slice::from_ref(&row), "bench", false)
                    .await
                    .unwrap();
                conn.end_atomic("bench").await.unwrap();
            })
        });
    });

    group.finish();
}

#[cfg(feature = "sqlite")]
criterion_group!(
    benches,
    bench_query_classification,
    bench_domain_ids,
    bench_sql_generation,
    bench_connection
);

#[cfg(not(feature = "sqlite"))]
criterion_group!(benches, bench_query_classification, bench_domain_ids);

criterion_main!(benches);
