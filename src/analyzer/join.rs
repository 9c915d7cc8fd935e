//! Rejects joins that could degrade into a cartesian product.
//!
//! Every join predicate is classified by structural recursion. Only a
//! predicate that equates column-bearing expressions from both sides is
//! accepted.
use crate::ast::*;

use super::walk::{SelectRole, VisitorMut};
use super::AnalyzeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    /// Cannot correlate rows on its own.
    Invalid,
    /// Carries at least one column reference but is not a comparison.
    ContainsColumn,
    /// An equi-correlation between column-bearing expressions.
    Valid,
}

pub fn classify(expr: &Expression) -> JoinStatus {
    match expr {
        Expression::Column { .. } => JoinStatus::ContainsColumn,

        Expression::Literal(_)
        | Expression::Placeholder(_)
        | Expression::Function { .. }
        | Expression::Aggregate { .. }
        | Expression::WindowFunction { .. }
        | Expression::InList { .. }
        | Expression::Subquery(_)
        | Expression::Exists(_)
        | Expression::InSubquery { .. }
        | Expression::Case { .. }
        | Expression::Wildcard => JoinStatus::Invalid,

        Expression::UnaryOp { expr, .. }
        | Expression::Collate { expr, .. }
        | Expression::IsNull { expr, .. }
        | Expression::Between { expr, .. }
        | Expression::Cast { expr, .. }
        | Expression::Nested(expr) => classify(expr),

        Expression::IsDistinctFrom { left, right, .. } => either_contains_column(left, right),

        Expression::BinaryOp { left, op, right } => match op {
            BinaryOperator::Eq => {
                if classify(left) == JoinStatus::ContainsColumn
                    && classify(right) == JoinStatus::ContainsColumn
                {
                    JoinStatus::Valid
                } else {
                    JoinStatus::Invalid
                }
            }
            BinaryOperator::And => {
                if classify(left) == JoinStatus::Valid || classify(right) == JoinStatus::Valid {
                    JoinStatus::Valid
                } else {
                    JoinStatus::Invalid
                }
            }
            BinaryOperator::Or => {
                if classify(left) == JoinStatus::Valid && classify(right) == JoinStatus::Valid {
                    JoinStatus::Valid
                } else {
                    JoinStatus::Invalid
                }
            }
            BinaryOperator::Plus
            | BinaryOperator::Minus
            | BinaryOperator::Multiply
            | BinaryOperator::Divide
            | BinaryOperator::Modulo
            | BinaryOperator::Concat
            | BinaryOperator::Like
            | BinaryOperator::NotLike => either_contains_column(left, right),
            BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => JoinStatus::Invalid,
        },
    }
}

fn either_contains_column(left: &Expression, right: &Expression) -> JoinStatus {
    if classify(left) == JoinStatus::ContainsColumn || classify(right) == JoinStatus::ContainsColumn
    {
        JoinStatus::ContainsColumn
    } else {
        JoinStatus::Invalid
    }
}

/// Validates every join in the statement, including those of nested
/// selects.
#[derive(Debug, Default)]
pub struct JoinValidator;

impl VisitorMut for JoinValidator {
    fn enter_select(
        &mut self,
        select: &mut SelectQuery,
        _role: SelectRole,
    ) -> Result<(), AnalyzeError> {
        if select.from.len() > 1 {
            let names: Vec<String> = select
                .from
                .iter()
                .map(|t| quote_ident(t.visible_name()))
                .collect();
            return Err(AnalyzeError::InvalidJoin {
                predicate: format!("FROM {}", names.join(", ")),
            });
        }
        Ok(())
    }

    fn visit_join(&mut self, join: &Join) -> Result<(), AnalyzeError> {
        let table = quote_ident(join.table.visible_name());
        let predicate = match (&join.join_type, &join.condition) {
            (JoinType::Cross, _) => format!("CROSS JOIN {}", table),
            (_, Some(JoinCondition::Natural)) => format!("NATURAL JOIN {}", table),
            (_, None) => format!("JOIN {} without constraint", table),
            (_, Some(JoinCondition::Using(_))) => return Ok(()),
            (_, Some(JoinCondition::On(expr))) => {
                if classify(expr) == JoinStatus::Valid {
                    return Ok(());
                }
                compile_expr(expr)
            }
        };
        Err(AnalyzeError::InvalidJoin { predicate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::walk::walk_query;

    fn on_clause(sql: &str) -> Expression {
        let query = parse_single(&format!("SELECT * FROM a JOIN b ON {}", sql)).unwrap();
        let Query::Select(select) = query else {
            panic!("Expected SELECT");
        };
        match select.joins[0].condition.clone() {
            Some(JoinCondition::On(expr)) => expr,
            other => panic!("Expected ON condition, got {:?}", other),
        }
    }

    fn validate(sql: &str) -> Result<(), AnalyzeError> {
        let mut query = parse_single(sql).unwrap();
        walk_query(&mut query, &mut JoinValidator, SelectRole::Statement)
    }

    #[test]
    fn test_classify_equality_of_columns() {
        assert_eq!(classify(&on_clause("a.id = b.a_id")), JoinStatus::Valid);
        assert_eq!(
            classify(&on_clause("a.id + 1 = (b.a_id)")),
            JoinStatus::Valid
        );
        assert_eq!(
            classify(&on_clause("a.name COLLATE NOCASE = b.name")),
            JoinStatus::Valid
        );
    }

    #[test]
    fn test_classify_rejects_constants() {
        assert_eq!(classify(&on_clause("1 = 1")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("t1.a + 1 = 5")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("a.id = 5")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("a.id = $id")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("a.id = abs(b.id)")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("a.id < b.id")), JoinStatus::Invalid);
        assert_eq!(classify(&on_clause("a.id")), JoinStatus::ContainsColumn);
    }

    #[test]
    fn test_classify_boolean_combinations() {
        assert_eq!(
            classify(&on_clause("a.id = b.a_id AND b.active = 1")),
            JoinStatus::Valid
        );
        assert_eq!(
            classify(&on_clause("a.id = b.a_id OR b.active = 1")),
            JoinStatus::Invalid
        );
        assert_eq!(
            classify(&on_clause("a.id = b.a_id OR a.id = b.b_id")),
            JoinStatus::Valid
        );
    }

    #[test]
    fn test_rejects_constant_join() {
        let err = validate("SELECT * FROM a JOIN b ON 1 = 1").unwrap_err();
        assert_eq!(
            err,
            AnalyzeError::InvalidJoin {
                predicate: "1 = 1".into()
            }
        );
    }

    #[test]
    fn test_rejects_column_compared_to_constant() {
        let err = validate("SELECT * FROM t1 JOIN t2 ON t1.a + 1 = 5").unwrap_err();
        assert_eq!(
            err,
            AnalyzeError::InvalidJoin {
                predicate: r#""t1"."a" + 1 = 5"#.into()
            }
        );
    }

    #[test]
    fn test_accepts_equi_join_and_using() {
        validate("SELECT * FROM a JOIN b ON a.id = b.a_id").unwrap();
        validate("SELECT * FROM a LEFT JOIN b USING (id)").unwrap();
    }

    #[test]
    fn test_rejects_cartesian_forms() {
        assert!(validate("SELECT * FROM a, b").is_err());
        assert!(validate("SELECT * FROM a CROSS JOIN b").is_err());
        assert!(validate("SELECT * FROM a NATURAL JOIN b").is_err());
    }

    #[test]
    fn test_rejects_join_inside_subquery() {
        let err = validate(
            "SELECT * FROM a WHERE a.id IN (SELECT b.id FROM b JOIN c ON b.x > c.y)",
        )
        .unwrap_err();
        assert!(matches!(err, AnalyzeError::InvalidJoin { .. }));
    }
}
