//! Accept/visit traversal over the statement tree.
//!
//! [`walk_query`] drives a [`VisitorMut`] through every statement, SELECT
//! core, join and expression, including nested subqueries, CTE bodies and
//! compound members. Hooks fire in source nesting order:
//!
//! ```text
//! enter_select
//!     FROM relations (derived subqueries walked first)
//!     visit_join per join, then its ON expression
//!     projections, WHERE, GROUP BY, HAVING, WINDOW, ORDER BY, LIMIT, OFFSET
//! exit_select
//! compound members (each as its own enter/exit pair)
//! ```
//!
//! A SELECT's nested subqueries are always walked between its `enter_select`
//! and `exit_select`, so scope-tracking visitors see the enclosing scope as
//! the parent of every nested one.
use crate::ast::*;

use super::AnalyzeError;

type Result<T = ()> = std::result::Result<T, AnalyzeError>;

/// Where a SELECT core sits in the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectRole {
    /// The statement itself, or the body of a top-level WITH.
    Statement,
    /// A member after the head of a compound chain. The head carries the
    /// compound's ORDER BY.
    CompoundMember,
    /// Subquery in FROM.
    Derived,
    /// Body of a common table expression.
    CommonTable,
    /// Scalar, IN or EXISTS subquery.
    Expression,
    /// Source of INSERT ... SELECT.
    InsertSource,
}

pub trait VisitorMut {
    fn enter_with(&mut self, _with: &CTEQuery) -> Result {
        Ok(())
    }

    fn enter_cte(&mut self, _cte: &CTE, _recursive: bool) -> Result {
        Ok(())
    }

    fn exit_cte(&mut self, _cte: &CTE) -> Result {
        Ok(())
    }

    fn exit_with(&mut self, _with: &CTEQuery) -> Result {
        Ok(())
    }

    /// Entering INSERT, UPDATE or DELETE against `target`.
    fn enter_dml(&mut self, _target: &TableRef) -> Result {
        Ok(())
    }

    fn exit_dml(&mut self, _target: &TableRef) -> Result {
        Ok(())
    }

    fn enter_select(&mut self, _select: &mut SelectQuery, _role: SelectRole) -> Result {
        Ok(())
    }

    fn exit_select(&mut self, _select: &mut SelectQuery, _role: SelectRole) -> Result {
        Ok(())
    }

    fn visit_join(&mut self, _join: &Join) -> Result {
        Ok(())
    }

    fn visit_expr(&mut self, _expr: &Expression) -> Result {
        Ok(())
    }
}

pub fn walk_query<V: VisitorMut + ?Sized>(
    query: &mut Query,
    visitor: &mut V,
    role: SelectRole,
) -> Result {
    match query {
        Query::Select(select) => walk_select(select, visitor, role),
        Query::With(with) => {
            visitor.enter_with(with)?;
            let recursive = with.recursive;
            for cte in &mut with.ctes {
                visitor.enter_cte(cte, recursive)?;
                walk_query(&mut cte.query, visitor, SelectRole::CommonTable)?;
                visitor.exit_cte(cte)?;
            }
            walk_query(&mut with.body, visitor, role)?;
            visitor.exit_with(with)
        }
        Query::Insert(insert) => {
            visitor.enter_dml(&insert.table)?;
            match &mut insert.source {
                InsertSource::Values(rows) => {
                    for expr in rows.iter_mut().flatten() {
                        walk_expr(expr, visitor)?;
                    }
                }
                InsertSource::Query(source) => {
                    walk_query(source, visitor, SelectRole::InsertSource)?
                }
                InsertSource::DefaultValues => {}
            }
            walk_select_items(&mut insert.returning, visitor)?;
            visitor.exit_dml(&insert.table)
        }
        Query::Update(update) => {
            visitor.enter_dml(&update.table)?;
            for assignment in &mut update.assignments {
                walk_expr(&mut assignment.value, visitor)?;
            }
            if let Some(filter) = &mut update.filter {
                walk_expr(filter, visitor)?;
            }
            walk_select_items(&mut update.returning, visitor)?;
            visitor.exit_dml(&update.table)
        }
        Query::Delete(delete) => {
            visitor.enter_dml(&delete.table)?;
            if let Some(filter) = &mut delete.filter {
                walk_expr(filter, visitor)?;
            }
            walk_select_items(&mut delete.returning, visitor)?;
            visitor.exit_dml(&delete.table)
        }
        Query::Raw(_) => Ok(()),
    }
}

fn walk_select<V: VisitorMut + ?Sized>(
    select: &mut SelectQuery,
    visitor: &mut V,
    role: SelectRole,
) -> Result {
    visitor.enter_select(select, role)?;

    for table in &mut select.from {
        walk_table_ref(table, visitor)?;
    }

    for join in &mut select.joins {
        walk_table_ref(&mut join.table, visitor)?;
        visitor.visit_join(join)?;
        if let Some(JoinCondition::On(expr)) = &mut join.condition {
            walk_expr(expr, visitor)?;
        }
    }

    walk_select_items(&mut select.projections, visitor)?;

    if let Some(filter) = &mut select.filter {
        walk_expr(filter, visitor)?;
    }
    for expr in &mut select.group_by {
        walk_expr(expr, visitor)?;
    }
    if let Some(having) = &mut select.having {
        walk_expr(having, visitor)?;
    }
    for window in &mut select.windows {
        walk_window(&mut window.spec, visitor)?;
    }
    for order in &mut select.order_by {
        walk_expr(&mut order.expr, visitor)?;
    }
    if let Some(limit) = &mut select.limit {
        walk_expr(limit, visitor)?;
    }
    if let Some(offset) = &mut select.offset {
        walk_expr(offset, visitor)?;
    }

    visitor.exit_select(select, role)?;

    if let Some(set_op) = &mut select.set_op {
        walk_query(&mut set_op.right, visitor, SelectRole::CompoundMember)?;
    }
    Ok(())
}

fn walk_select_items<V: VisitorMut + ?Sized>(items: &mut [SelectItem], visitor: &mut V) -> Result {
    for item in items {
        if let SelectItem::Expression { expr, .. } = item {
            walk_expr(expr, visitor)?;
        }
    }
    Ok(())
}

fn walk_table_ref<V: VisitorMut + ?Sized>(table: &mut TableRef, visitor: &mut V) -> Result {
    match table {
        TableRef::Table { .. } => Ok(()),
        TableRef::Subquery { query, .. } => walk_query(query, visitor, SelectRole::Derived),
        TableRef::Function { args, .. } => {
            for arg in args {
                walk_expr(arg, visitor)?;
            }
            Ok(())
        }
    }
}

fn walk_window<V: VisitorMut + ?Sized>(spec: &mut WindowSpec, visitor: &mut V) -> Result {
    for expr in &mut spec.partition_by {
        walk_expr(expr, visitor)?;
    }
    for order in &mut spec.order_by {
        walk_expr(&mut order.expr, visitor)?;
    }
    Ok(())
}

pub fn walk_expr<V: VisitorMut + ?Sized>(expr: &mut Expression, visitor: &mut V) -> Result {
    visitor.visit_expr(expr)?;

    match expr {
        Expression::Column { .. }
        | Expression::Literal(_)
        | Expression::Placeholder(_)
        | Expression::Wildcard => Ok(()),
        Expression::BinaryOp { left, right, .. }
        | Expression::IsDistinctFrom { left, right, .. } => {
            walk_expr(left, visitor)?;
            walk_expr(right, visitor)
        }
        Expression::UnaryOp { expr, .. }
        | Expression::IsNull { expr, .. }
        | Expression::Collate { expr, .. }
        | Expression::Cast { expr, .. }
        | Expression::Nested(expr) => walk_expr(expr, visitor),
        Expression::Function { args, .. } => {
            for arg in args {
                walk_expr(arg, visitor)?;
            }
            Ok(())
        }
        Expression::Aggregate { args, filter, .. } => {
            for arg in args {
                walk_expr(arg, visitor)?;
            }
            if let Some(filter) = filter {
                walk_expr(filter, visitor)?;
            }
            Ok(())
        }
        Expression::WindowFunction { function, window } => {
            walk_expr(function, visitor)?;
            walk_window(window, visitor)
        }
        Expression::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, visitor)?;
            }
            for (when, then) in when_clauses {
                walk_expr(when, visitor)?;
                walk_expr(then, visitor)?;
            }
            if let Some(else_clause) = else_clause {
                walk_expr(else_clause, visitor)?;
            }
            Ok(())
        }
        Expression::Subquery(query) | Expression::Exists(query) => {
            walk_query(query, visitor, SelectRole::Expression)
        }
        Expression::InList { expr, list, .. } => {
            walk_expr(expr, visitor)?;
            for item in list {
                walk_expr(item, visitor)?;
            }
            Ok(())
        }
        Expression::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, visitor)?;
            walk_query(subquery, visitor, SelectRole::Expression)
        }
        Expression::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, visitor)?;
            walk_expr(low, visitor)?;
            walk_expr(high, visitor)
        }
    }
}

/// Collects named bind parameters in order of first appearance.
#[derive(Debug, Default)]
pub struct ParameterCollector {
    pub parameters: Vec<String>,
}

impl VisitorMut for ParameterCollector {
    fn visit_expr(&mut self, expr: &Expression) -> Result {
        if let Expression::Placeholder(name) = expr {
            if name.len() > 1 && !name.starts_with('?') && !self.parameters.contains(name) {
                self.parameters.push(name.clone());
            }
        }
        Ok(())
    }
}
