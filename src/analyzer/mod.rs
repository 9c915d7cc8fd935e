//! Determinism analyzer.
//!
//! Rewrites a parsed statement so that executing it on any replica yields
//! byte-identical results. Each rule is a pass over the statement tree:
//!
//! ```text
//! SQL text ──parse──▶ Query ──JoinRule──▶ AggregateRule ──OrderRule──▶ compile
//!                                 │              │              │
//!                           reject joins   reject ambiguous  append ORDER BY
//!                           without an     grouping          tie-breakers
//!                           equi-predicate
//! ```
//!
//! Any failure aborts the analysis; a partially rewritten statement is never
//! returned.
pub mod aggregate;
pub mod error;
pub mod join;
pub mod order;
pub mod scope;
pub mod walk;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::{compile, parse_single, Query};
use crate::schema::Table;

use aggregate::AggregateValidator;
use join::JoinValidator;
use order::OrderingInjector;
use walk::{walk_query, ParameterCollector, SelectRole};

pub use error::AnalyzeError;

/// Bitmask of the rules to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Rules(u8);

impl Rules {
    pub const NONE: Rules = Rules(0);
    pub const NO_CARTESIAN_JOIN: Rules = Rules(1);
    pub const GUARANTEED_ORDER: Rules = Rules(1 << 1);
    pub const DETERMINISTIC_AGGREGATES: Rules = Rules(1 << 2);
    pub const ALL: Rules = Rules(0b111);

    const NAMES: [(&'static str, Rules); 3] = [
        ("no_cartesian_join", Rules::NO_CARTESIAN_JOIN),
        ("guaranteed_order", Rules::GUARANTEED_ORDER),
        ("deterministic_aggregates", Rules::DETERMINISTIC_AGGREGATES),
    ];

    pub fn contains(self, other: Rules) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, rule)| self.contains(*rule))
            .map(|(name, _)| *name)
            .collect()
    }
}

impl BitOr for Rules {
    type Output = Rules;

    fn bitor(self, rhs: Rules) -> Rules {
        Rules(self.0 | rhs.0)
    }
}

impl BitOrAssign for Rules {
    fn bitor_assign(&mut self, rhs: Rules) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Rules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

/// Parses a comma-separated list of rule names; `all` selects every rule.
impl FromStr for Rules {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = Rules::NONE;
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let name = name.to_ascii_lowercase();
            if name == "all" {
                rules |= Rules::ALL;
                continue;
            }
            let (_, rule) = Self::NAMES
                .iter()
                .find(|(known, _)| *known == name)
                .ok_or_else(|| format!("unknown rule: {}", name))?;
            rules |= *rule;
        }
        Ok(rules)
    }
}

impl TryFrom<Vec<String>> for Rules {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.join(",").parse()
    }
}

impl From<Rules> for Vec<String> {
    fn from(rules: Rules) -> Self {
        rules.names().into_iter().map(String::from).collect()
    }
}

/// A single analysis rule over a statement tree.
pub trait RulePass: Send + Sync {
    /// Unique name identifying this pass.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Validate and rewrite the statement in place.
    fn apply(&self, query: &mut Query, schema: &[Table]) -> Result<(), AnalyzeError>;
}

pub struct JoinRule;

impl RulePass for JoinRule {
    fn name(&self) -> &str {
        "no_cartesian_join"
    }

    fn description(&self) -> &str {
        "Rejects joins without an equality between columns of both sides"
    }

    fn apply(&self, query: &mut Query, _schema: &[Table]) -> Result<(), AnalyzeError> {
        walk_query(query, &mut JoinValidator, SelectRole::Statement)
    }
}

pub struct AggregateRule;

impl RulePass for AggregateRule {
    fn name(&self) -> &str {
        "deterministic_aggregates"
    }

    fn description(&self) -> &str {
        "Rejects grouping whose result depends on row choice or row order"
    }

    fn apply(&self, query: &mut Query, schema: &[Table]) -> Result<(), AnalyzeError> {
        walk_query(query, &mut AggregateValidator::new(schema), SelectRole::Statement)
    }
}

pub struct OrderRule;

impl RulePass for OrderRule {
    fn name(&self) -> &str {
        "guaranteed_order"
    }

    fn description(&self) -> &str {
        "Appends ORDER BY terms that make every result order total"
    }

    fn apply(&self, query: &mut Query, schema: &[Table]) -> Result<(), AnalyzeError> {
        walk_query(query, &mut OrderingInjector::new(schema), SelectRole::Statement)
    }
}

/// Runs rule passes in sequence.
#[derive(Default)]
pub struct RulePipeline {
    passes: Vec<Box<dyn RulePass>>,
}

impl RulePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The passes selected by `rules`. Validation runs before ordering so
    /// rejected statements are never rewritten.
    pub fn for_rules(rules: Rules) -> Self {
        let mut pipeline = Self::new();
        if rules.contains(Rules::NO_CARTESIAN_JOIN) {
            pipeline.add_pass(Box::new(JoinRule));
        }
        if rules.contains(Rules::DETERMINISTIC_AGGREGATES) {
            pipeline.add_pass(Box::new(AggregateRule));
        }
        if rules.contains(Rules::GUARANTEED_ORDER) {
            pipeline.add_pass(Box::new(OrderRule));
        }
        pipeline
    }

    pub fn add_pass(&mut self, pass: Box<dyn RulePass>) {
        self.passes.push(pass);
    }

    pub fn run(&self, query: &mut Query, schema: &[Table]) -> Result<(), AnalyzeError> {
        for pass in &self.passes {
            debug!(rule = pass.name(), "applying rule");
            pass.apply(query, schema)?;
        }
        Ok(())
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }
}

/// Output of a successful analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedStatement {
    /// Canonical SQL text of the rewritten statement.
    pub statement: String,
    /// Whether the statement writes to the datastore.
    pub mutative: bool,
    /// Named bind parameters in order of first appearance.
    pub parameters: Vec<String>,
}

/// Parses `sql` (exactly one statement) and applies `rules` against the
/// table metadata in `schema`.
pub fn apply_rules(
    sql: &str,
    rules: Rules,
    schema: &[Table],
) -> Result<AnalyzedStatement, AnalyzeError> {
    let query = parse_single(sql).map_err(|e| AnalyzeError::Parse(e.to_string()))?;
    apply_rules_to_query(query, rules, schema)
}

/// Applies `rules` to an already parsed statement.
pub fn apply_rules_to_query(
    query: Query,
    rules: Rules,
    schema: &[Table],
) -> Result<AnalyzedStatement, AnalyzeError> {
    RulePipeline::for_rules(rules).analyze(query, schema)
}

impl RulePipeline {
    /// Runs every pass, then compiles the rewritten statement.
    ///
    /// A panic anywhere in the passes is reported as
    /// [`AnalyzeError::Internal`] instead of unwinding into the caller.
    pub fn analyze(
        &self,
        mut query: Query,
        schema: &[Table],
    ) -> Result<AnalyzedStatement, AnalyzeError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run(&mut query, schema)?;

            let mut collector = ParameterCollector::default();
            walk_query(&mut query, &mut collector, SelectRole::Statement)?;

            Ok(AnalyzedStatement {
                statement: compile(&query),
                mutative: query.is_mutative(),
                parameters: collector.parameters,
            })
        }));

        outcome.unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic during analysis".to_string());
            Err(AnalyzeError::Internal(message))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Column, DataType, Index, IndexKind, SchemaError};

    fn schema() -> Vec<Table> {
        vec![
            Table::new(
                "users",
                vec![
                    Column::new("id", DataType::Integer).with(Attribute::PrimaryKey),
                    Column::new("name", DataType::Text),
                    Column::new("credits", DataType::Integer),
                ],
            ),
            Table::new(
                "posts",
                vec![
                    Column::new("id", DataType::Integer).with(Attribute::PrimaryKey),
                    Column::new("author", DataType::Integer),
                    Column::new("title", DataType::Text),
                ],
            ),
        ]
    }

    fn analyze(sql: &str) -> Result<AnalyzedStatement, AnalyzeError> {
        apply_rules(sql, Rules::ALL, &schema())
    }

    struct Exploding;

    impl RulePass for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn apply(&self, _query: &mut Query, _schema: &[Table]) -> Result<(), AnalyzeError> {
            panic!("walker bug");
        }
    }

    #[test]
    fn test_rules_parse_and_combine() {
        assert_eq!("all".parse::<Rules>().unwrap(), Rules::ALL);
        let rules: Rules = "guaranteed_order, no_cartesian_join".parse().unwrap();
        assert_eq!(rules, Rules::GUARANTEED_ORDER | Rules::NO_CARTESIAN_JOIN);
        assert!(!rules.contains(Rules::DETERMINISTIC_AGGREGATES));
        assert!("sideways".parse::<Rules>().is_err());
        assert_eq!(rules.to_string(), "no_cartesian_join,guaranteed_order");
        assert!("".parse::<Rules>().unwrap().is_empty());
    }

    #[test]
    fn test_pipeline_order() {
        assert_eq!(
            RulePipeline::for_rules(Rules::ALL).pass_names(),
            vec!["no_cartesian_join", "deterministic_aggregates", "guaranteed_order"]
        );
        assert!(RulePipeline::for_rules(Rules::NONE).pass_names().is_empty());
    }

    #[test]
    fn test_select_is_ordered_and_canonical() {
        let analyzed = analyze("select name from users where id = $id").unwrap();
        assert_eq!(
            analyzed.statement,
            r#"SELECT "name" FROM "users" WHERE "id" = $id ORDER BY "users"."id" ASC NULLS LAST"#
        );
        assert!(!analyzed.mutative);
        assert_eq!(analyzed.parameters, vec!["$id"]);
    }

    #[test]
    fn test_determinism() {
        let sql = "SELECT u.name, p.title FROM users u JOIN posts p ON p.author = u.id \
                   WHERE u.credits > @min ORDER BY p.title";
        let first = analyze(sql).unwrap();
        for _ in 0..10 {
            assert_eq!(analyze(sql).unwrap(), first);
        }
    }

    #[test]
    fn test_join_rule_rejects_before_ordering() {
        let err = analyze("SELECT * FROM users u JOIN posts p ON u.id > p.author").unwrap_err();
        assert!(matches!(err, AnalyzeError::InvalidJoin { .. }));
    }

    #[test]
    fn test_only_requested_rules_apply() {
        let analyzed = apply_rules(
            "SELECT * FROM users, posts",
            Rules::NONE,
            &schema(),
        )
        .unwrap();
        assert_eq!(analyzed.statement, r#"SELECT * FROM "users", "posts""#);

        let analyzed = apply_rules(
            "SELECT name FROM users",
            Rules::NO_CARTESIAN_JOIN,
            &schema(),
        )
        .unwrap();
        assert_eq!(analyzed.statement, r#"SELECT "name" FROM "users""#);
    }

    #[test]
    fn test_mutative_statements() {
        let analyzed = analyze(
            "UPDATE users SET credits = credits - $amount WHERE id = @caller",
        )
        .unwrap();
        assert!(analyzed.mutative);
        assert_eq!(analyzed.parameters, vec!["$amount", "@caller"]);
        assert_eq!(
            analyzed.statement,
            r#"UPDATE "users" SET "credits" = "credits" - $amount WHERE "id" = @caller"#
        );
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            analyze("SELEKT nothing"),
            Err(AnalyzeError::Parse(_))
        ));
        assert!(matches!(
            analyze("SELECT 1; SELECT 2"),
            Err(AnalyzeError::Parse(_))
        ));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let mut pipeline = RulePipeline::new();
        pipeline.add_pass(Box::new(Exploding));
        let result = pipeline.analyze(parse_single("SELECT 1").unwrap(), &[]);
        assert_eq!(
            result.unwrap_err(),
            AnalyzeError::Internal("walker bug".into())
        );
    }

    #[test]
    fn test_unknown_table_without_schema() {
        let result = apply_rules_to_query(
            parse_single("SELECT name FROM users").unwrap(),
            Rules::GUARANTEED_ORDER,
            &[],
        );
        assert_eq!(
            result.unwrap_err(),
            AnalyzeError::UnknownTable("users".into())
        );
    }

    #[test]
    fn test_unordered_window_is_rejected() {
        assert_eq!(
            analyze("SELECT name, GROUP_CONCAT(name) OVER (PARTITION BY name) AS g FROM users")
                .unwrap_err(),
            AnalyzeError::OrderDependentAggregate("GROUP_CONCAT".into())
        );
        let analyzed =
            analyze("SELECT name, ROW_NUMBER() OVER (ORDER BY credits, id) AS n FROM users")
                .unwrap();
        assert_eq!(
            analyzed.statement,
            r#"SELECT "name", ROW_NUMBER() OVER (ORDER BY "credits", "id") AS "n" FROM "users" ORDER BY "users"."id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_key_on_unknown_column_is_rejected() {
        let schema = vec![Table::new("t", vec![Column::new("id", DataType::Integer)])
            .with_index(Index {
                name: "t_pk".into(),
                columns: vec!["ghost".into()],
                kind: IndexKind::Primary,
            })];
        assert_eq!(
            apply_rules("SELECT id FROM t", Rules::ALL, &schema).unwrap_err(),
            AnalyzeError::Schema(SchemaError::UnknownColumn {
                table: "t".into(),
                column: "ghost".into()
            })
        );
    }

    #[test]
    fn test_rules_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            rules: Rules,
        }
        let wrapper: Wrapper = toml::from_str(r#"rules = ["guaranteed_order"]"#).unwrap();
        assert_eq!(wrapper.rules, Rules::GUARANTEED_ORDER);
    }
}
