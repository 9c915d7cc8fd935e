//! Benchmarks for the determinism analyzer and the procedure engine.
//!
//! Run with: `cargo bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use detsql::analyzer::{apply_rules, apply_rules_to_query, Rules};
use detsql::ast::parse_single;
use detsql::datastore::{SqliteDatastore, Value};
use detsql::engine::{Engine, EngineOpts, ExecutionOptions, Instruction, Procedure, Scoping};
use detsql::schema::{Attribute, Column, DataType, Table};

const SIMPLE_SELECT: &str = "SELECT * FROM users";

const SELECT_WITH_WHERE: &str =
    "SELECT id, name, email FROM users WHERE age > 18 AND status = 'active'";

const SELECT_WITH_JOIN: &str = "SELECT u.name, o.total, o.created_at \
    FROM users u \
    JOIN orders o ON u.id = o.user_id \
    WHERE o.total > 100.00 \
    ORDER BY o.created_at DESC \
    LIMIT 50";

const MULTI_JOIN: &str = "SELECT u.name, o.id, p.name AS product, oi.quantity \
    FROM users u \
    JOIN orders o ON u.id = o.user_id \
    JOIN order_items oi ON o.id = oi.order_id \
    JOIN products p ON oi.product_id = p.id \
    WHERE o.status = 'completed' \
    ORDER BY o.created_at DESC";

const AGGREGATION: &str = "SELECT department, COUNT(*) AS emp_count, \
    MAX(salary) AS max_salary, MIN(salary) AS min_salary \
    FROM employees \
    GROUP BY department \
    HAVING COUNT(*) > 5 \
    ORDER BY max_salary DESC";

const CTE_QUERY: &str = "WITH active_users AS (\
        SELECT id, name FROM users WHERE status = 'active'\
    ) \
    SELECT a.name, COUNT(o.id) AS order_count \
    FROM active_users a \
    JOIN orders o ON a.id = o.user_id \
    GROUP BY a.id, a.name";

const SUBQUERY: &str = "SELECT u.name, u.email \
    FROM users u \
    WHERE u.id IN (SELECT user_id FROM orders WHERE total > 500) \
    AND EXISTS (SELECT 1 FROM orders r WHERE r.user_id = u.id AND r.total > 4)";

const UNION_QUERY: &str = "SELECT id, name FROM customers \
    UNION ALL \
    SELECT id, name FROM suppliers";

const UPDATE_QUERY: &str = "UPDATE employees SET salary = salary * 1.10 \
    WHERE department = $department";

const CASES: [(&str, &str); 9] = [
    ("simple_select", SIMPLE_SELECT),
    ("select_where", SELECT_WITH_WHERE),
    ("select_join", SELECT_WITH_JOIN),
    ("multi_join", MULTI_JOIN),
    ("aggregation", AGGREGATION),
    ("cte", CTE_QUERY),
    ("subquery", SUBQUERY),
    ("union", UNION_QUERY),
    ("update", UPDATE_QUERY),
];

fn table(name: &str, columns: &[(&str, DataType)]) -> Table {
    let mut columns: Vec<Column> = columns
        .iter()
        .map(|(name, data_type)| Column::new(*name, *data_type))
        .collect();
    columns.insert(0, Column::new("id", DataType::Integer).with(Attribute::PrimaryKey));
    Table::new(name, columns)
}

fn schema() -> Vec<Table> {
    vec![
        table(
            "users",
            &[
                ("name", DataType::Text),
                ("email", DataType::Text),
                ("age", DataType::Integer),
                ("status", DataType::Text),
            ],
        ),
        table(
            "orders",
            &[
                ("user_id", DataType::Integer),
                ("total", DataType::Real),
                ("status", DataType::Text),
                ("created_at", DataType::Text),
            ],
        ),
        table(
            "order_items",
            &[
                ("order_id", DataType::Integer),
                ("product_id", DataType::Integer),
                ("quantity", DataType::Integer),
            ],
        ),
        table("products", &[("name", DataType::Text)]),
        table(
            "employees",
            &[("department", DataType::Text), ("salary", DataType::Real)],
        ),
        table("customers", &[("name", DataType::Text)]),
        table("suppliers", &[("name", DataType::Text)]),
    ]
}

fn bench_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    let schema = schema();

    for (name, sql) in &CASES {
        group.bench_with_input(BenchmarkId::new("all_rules", name), sql, |b, sql| {
            b.iter(|| apply_rules(black_box(sql), Rules::ALL, &schema).unwrap());
        });
    }

    group.finish();
}

fn bench_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("rules");
    let schema = schema();

    let rules = [
        ("none", Rules::NONE),
        ("no_cartesian_join", Rules::NO_CARTESIAN_JOIN),
        ("deterministic_aggregates", Rules::DETERMINISTIC_AGGREGATES),
        ("guaranteed_order", Rules::GUARANTEED_ORDER),
    ];

    for (name, rule) in &rules {
        let query = parse_single(MULTI_JOIN).unwrap();
        group.bench_with_input(BenchmarkId::new("multi_join", name), &query, |b, query| {
            b.iter(|| apply_rules_to_query(black_box(query.clone()), *rule, &schema).unwrap());
        });
    }

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");
    let schema = schema();

    let engine = Engine::new(
        Arc::new(SqliteDatastore::open_in_memory().unwrap()),
        EngineOpts {
            tables: schema.clone(),
            procedures: vec![
                Procedure::new(
                    "add_user",
                    ["$id", "$name"],
                    Scoping::Public,
                    vec![Instruction::dml_execute("insert")],
                ),
                Procedure::new(
                    "list_users",
                    Vec::<String>::new(),
                    Scoping::Public,
                    vec![Instruction::dml_execute("list")],
                )
                .view(),
            ],
            load: vec![
                Instruction::dml_prepare(
                    "insert",
                    "INSERT INTO users (id, name) VALUES ($id, $name)",
                ),
                Instruction::analyzed_dml_prepare("list", SIMPLE_SELECT, Rules::ALL, &schema)
                    .unwrap(),
            ],
            ..EngineOpts::default()
        },
    )
    .unwrap();

    let mut next_id = 0i64;
    group.bench_function("insert_procedure", |b| {
        b.iter(|| {
            next_id += 1;
            engine
                .execute_procedure(
                    "add_user",
                    vec![Value::from(next_id), Value::from("user")],
                    ExecutionOptions::caller("bench"),
                )
                .unwrap()
        });
    });

    group.bench_function("view_procedure", |b| {
        b.iter(|| {
            engine
                .execute_procedure("list_users", vec![], ExecutionOptions::default().read_only())
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_analysis, bench_rules, bench_execution);
criterion_main!(benches);
