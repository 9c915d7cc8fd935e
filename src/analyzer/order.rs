//! Appends tie-breaking ORDER BY terms so every SELECT returns its rows in
//! a total order.
//!
//! | SELECT shape                    | Injected terms                          |
//! |---------------------------------|-----------------------------------------|
//! | plain, with FROM                | primary key of every visible instance   |
//! | grouped                         | every GROUP BY expression               |
//! | DISTINCT or compound            | every result column position            |
//! | aggregate without GROUP BY      | none (one row)                          |
//! | no FROM                         | none                                    |
//!
//! Terms always render `ASC NULLS LAST` and follow any user-supplied terms.
use tracing::debug;

use crate::ast::*;
use crate::schema::Table;

use super::aggregate::contains_aggregate;
use super::scope::ScopeArena;
use super::walk::{SelectRole, VisitorMut};
use super::AnalyzeError;

type Result<T = ()> = std::result::Result<T, AnalyzeError>;

pub struct OrderingInjector<'a> {
    scopes: ScopeArena<'a>,
}

impl<'a> OrderingInjector<'a> {
    pub fn new(schema: &'a [Table]) -> Self {
        Self {
            scopes: ScopeArena::new(schema),
        }
    }

    fn ordering_terms(&self, select: &SelectQuery) -> Result<Vec<OrderByExpr>> {
        if select.is_compound() || select.distinct {
            if select.distinct && !select.is_compound() && !select.group_by.is_empty() {
                return Err(AnalyzeError::DistinctWithGroupBy);
            }
            let width = self.scopes.projection_names(&select.projections)?.len();
            return Ok((1..=width)
                .map(|position| {
                    OrderByExpr::ascending_nulls_last(Expression::Literal(Literal::Integer(
                        position as i64,
                    )))
                })
                .collect());
        }

        if !select.group_by.is_empty() {
            return Ok(select
                .group_by
                .iter()
                .cloned()
                .map(OrderByExpr::ascending_nulls_last)
                .collect());
        }

        if select.from.is_empty() || select_is_aggregate(select) {
            return Ok(vec![]);
        }

        self.primary_key_terms()
    }

    /// One term per key column of every instance in the innermost scope,
    /// instances sorted by visible name and key columns sorted by name.
    fn primary_key_terms(&self) -> Result<Vec<OrderByExpr>> {
        let mut instances: Vec<(&str, Vec<String>)> = Vec::new();
        for relation in self.scopes.relations() {
            let mut key = relation.table.primary_key()?;
            key.sort();
            instances.push((relation.name.as_str(), key));
        }
        instances.sort_by(|a, b| a.0.cmp(b.0));

        Ok(instances
            .into_iter()
            .flat_map(|(name, key)| {
                key.into_iter().map(move |column| {
                    OrderByExpr::ascending_nulls_last(Expression::column(Some(name), &column))
                })
            })
            .collect())
    }
}

fn select_is_aggregate(select: &SelectQuery) -> bool {
    select.projections.iter().any(|item| match item {
        SelectItem::Expression { expr, .. } => contains_aggregate(expr),
        _ => false,
    })
}

impl VisitorMut for OrderingInjector<'_> {
    fn enter_with(&mut self, _with: &CTEQuery) -> Result {
        self.scopes.push();
        Ok(())
    }

    fn enter_cte(&mut self, cte: &CTE, recursive: bool) -> Result {
        // A recursive body refers to itself, so it must be visible first.
        if recursive {
            let table = self.scopes.cte_table(cte)?;
            self.scopes.register_cte(table);
        }
        Ok(())
    }

    fn exit_cte(&mut self, cte: &CTE) -> Result {
        if !self.scopes.defines_cte(&cte.name) {
            let table = self.scopes.cte_table(cte)?;
            self.scopes.register_cte(table);
        }
        Ok(())
    }

    fn exit_with(&mut self, _with: &CTEQuery) -> Result {
        self.scopes.pop();
        Ok(())
    }

    fn enter_dml(&mut self, target: &TableRef) -> Result {
        self.scopes.push_dml(target);
        Ok(())
    }

    fn exit_dml(&mut self, _target: &TableRef) -> Result {
        self.scopes.pop();
        Ok(())
    }

    fn enter_select(&mut self, select: &mut SelectQuery, _role: SelectRole) -> Result {
        self.scopes.push_select(select)?;
        Ok(())
    }

    fn exit_select(&mut self, select: &mut SelectQuery, role: SelectRole) -> Result {
        let terms = match role {
            SelectRole::CompoundMember => Ok(vec![]),
            _ => self.ordering_terms(select),
        };
        self.scopes.pop();

        let terms = terms?;
        if !terms.is_empty() {
            debug!(count = terms.len(), ?role, "injecting ordering terms");
            select.order_by.extend(terms);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::walk::walk_query;
    use crate::schema::{Attribute, Column, DataType, Index, IndexKind};

    fn schema() -> Vec<Table> {
        vec![
            Table::new(
                "users",
                vec![
                    Column::new("id", DataType::Integer).with(Attribute::PrimaryKey),
                    Column::new("name", DataType::Text),
                ],
            ),
            Table::new(
                "memberships",
                vec![
                    Column::new("user_id", DataType::Integer),
                    Column::new("group_id", DataType::Integer),
                    Column::new("role", DataType::Text),
                ],
            )
            .with_index(Index {
                name: "memberships_pk".into(),
                columns: vec!["user_id".into(), "group_id".into()],
                kind: IndexKind::Primary,
            }),
            Table::new("loose", vec![Column::new("x", DataType::Integer)]),
        ]
    }

    fn order(sql: &str) -> Result<String> {
        let schema = schema();
        let mut query = parse_single(sql).unwrap();
        walk_query(
            &mut query,
            &mut OrderingInjector::new(&schema),
            SelectRole::Statement,
        )?;
        Ok(compile(&query))
    }

    #[test]
    fn test_orders_by_primary_key() {
        assert_eq!(
            order("SELECT name FROM users").unwrap(),
            r#"SELECT "name" FROM "users" ORDER BY "users"."id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_user_terms_come_first() {
        assert_eq!(
            order("SELECT name FROM users ORDER BY name DESC").unwrap(),
            r#"SELECT "name" FROM "users" ORDER BY "name" DESC, "users"."id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_composite_key_columns_sorted() {
        assert_eq!(
            order("SELECT role FROM memberships AS m").unwrap(),
            r#"SELECT "role" FROM "memberships" AS "m" ORDER BY "m"."group_id" ASC NULLS LAST, "m"."user_id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_self_join_orders_each_alias() {
        assert_eq!(
            order("SELECT u2.name FROM users u2 JOIN users u1 ON u1.id = u2.id").unwrap(),
            r#"SELECT "u2"."name" FROM "users" AS "u2" JOIN "users" AS "u1" ON "u1"."id" = "u2"."id" ORDER BY "u1"."id" ASC NULLS LAST, "u2"."id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_grouped_select_orders_by_group_terms() {
        assert_eq!(
            order("SELECT user_id, COUNT(*) FROM memberships GROUP BY user_id").unwrap(),
            r#"SELECT "user_id", COUNT(*) FROM "memberships" GROUP BY "user_id" ORDER BY "user_id" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_aggregate_without_group_by_is_untouched() {
        assert_eq!(
            order("SELECT COUNT(*) FROM users").unwrap(),
            r#"SELECT COUNT(*) FROM "users""#
        );
    }

    #[test]
    fn test_select_without_from_is_untouched() {
        assert_eq!(order("SELECT 1").unwrap(), "SELECT 1");
    }

    #[test]
    fn test_distinct_orders_by_every_position() {
        assert_eq!(
            order("SELECT DISTINCT * FROM users").unwrap(),
            r#"SELECT DISTINCT * FROM "users" ORDER BY 1 ASC NULLS LAST, 2 ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_compound_ordered_as_a_whole() {
        assert_eq!(
            order("SELECT id FROM users UNION ALL SELECT user_id FROM memberships").unwrap(),
            r#"SELECT "id" FROM "users" UNION ALL SELECT "user_id" FROM "memberships" ORDER BY 1 ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_nested_selects_ordered_in_own_scope() {
        let sql = order(
            "SELECT name FROM users WHERE id IN (SELECT user_id FROM memberships LIMIT 3)",
        )
        .unwrap();
        assert!(sql.contains(
            r#"FROM "memberships" ORDER BY "memberships"."group_id" ASC NULLS LAST, "memberships"."user_id" ASC NULLS LAST LIMIT 3"#
        ));
        assert!(sql.ends_with(r#"ORDER BY "users"."id" ASC NULLS LAST"#));
    }

    #[test]
    fn test_cte_keyed_by_all_columns() {
        assert_eq!(
            order("WITH named AS (SELECT id AS uid, name FROM users) SELECT * FROM named").unwrap(),
            r#"WITH "named" AS (SELECT "id" AS "uid", "name" FROM "users" ORDER BY "users"."id" ASC NULLS LAST) SELECT * FROM "named" ORDER BY "named"."name" ASC NULLS LAST, "named"."uid" ASC NULLS LAST"#
        );
    }

    #[test]
    fn test_derived_table_keyed_by_all_columns() {
        let sql = order("SELECT d.n FROM (SELECT name AS n FROM users) AS d").unwrap();
        assert!(sql.ends_with(r#"ORDER BY "d"."n" ASC NULLS LAST"#));
    }

    #[test]
    fn test_recursive_cte_sees_itself() {
        let sql = order(
            "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt WHERE x < 5) \
             SELECT x FROM cnt",
        )
        .unwrap();
        assert!(sql.ends_with(r#"ORDER BY "cnt"."x" ASC NULLS LAST"#));
    }

    #[test]
    fn test_insert_select_source_ordered() {
        let sql = order("INSERT INTO users (id, name) SELECT user_id, role FROM memberships")
            .unwrap();
        assert!(sql.ends_with(
            r#"ORDER BY "memberships"."group_id" ASC NULLS LAST, "memberships"."user_id" ASC NULLS LAST"#
        ));
    }

    #[test]
    fn test_unknown_table_fails() {
        assert_eq!(
            order("SELECT * FROM ghosts").unwrap_err(),
            AnalyzeError::UnknownTable("ghosts".into())
        );
    }

    #[test]
    fn test_table_without_primary_key_fails() {
        assert!(matches!(
            order("SELECT x FROM loose").unwrap_err(),
            AnalyzeError::Schema(_)
        ));
    }

    #[test]
    fn test_distinct_with_group_by_fails() {
        assert_eq!(
            order("SELECT DISTINCT name FROM users GROUP BY name").unwrap_err(),
            AnalyzeError::DistinctWithGroupBy
        );
    }

    #[test]
    fn test_repeated_analysis_is_identical() {
        let sql = "SELECT u.name, m.role FROM users u JOIN memberships m ON m.user_id = u.id";
        let first = order(sql).unwrap();
        let second = order(sql).unwrap();
        assert_eq!(first, second);
    }
}
