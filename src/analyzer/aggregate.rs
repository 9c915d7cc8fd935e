//! Grouping determinism.
//!
//! SQLite happily evaluates a bare column in a grouped SELECT against an
//! arbitrary row of the group. This walker rejects every construct whose
//! value could depend on which row SQLite picks, or on the order rows reach
//! an aggregate.
use tracing::debug;

use crate::ast::*;
use crate::schema::Table;

use super::scope::{ResolvedColumn, ScopeArena};
use super::walk::{SelectRole, VisitorMut};
use super::AnalyzeError;

type Result<T = ()> = std::result::Result<T, AnalyzeError>;

/// Aggregates whose result depends on the order rows are fed to them.
const ORDER_DEPENDENT: &[&str] = &[
    "GROUP_CONCAT",
    "STRING_AGG",
    "JSON_GROUP_ARRAY",
    "JSON_GROUP_OBJECT",
    "ARRAY_AGG",
];

/// Immediate sub-expressions, not descending into subqueries.
fn children(expr: &Expression) -> Vec<&Expression> {
    match expr {
        Expression::Column { .. }
        | Expression::Literal(_)
        | Expression::Placeholder(_)
        | Expression::Wildcard
        | Expression::Subquery(_)
        | Expression::Exists(_) => vec![],
        Expression::BinaryOp { left, right, .. }
        | Expression::IsDistinctFrom { left, right, .. } => vec![&**left, &**right],
        Expression::UnaryOp { expr, .. }
        | Expression::IsNull { expr, .. }
        | Expression::Collate { expr, .. }
        | Expression::Cast { expr, .. }
        | Expression::Nested(expr)
        | Expression::InSubquery { expr, .. } => vec![&**expr],
        Expression::Function { args, .. } => args.iter().collect(),
        Expression::Aggregate { args, filter, .. } => {
            args.iter().chain(filter.as_deref()).collect()
        }
        Expression::WindowFunction { function, window } => std::iter::once(&**function)
            .chain(window.partition_by.iter())
            .chain(window.order_by.iter().map(|o| &o.expr))
            .collect(),
        Expression::Case {
            operand,
            when_clauses,
            else_clause,
        } => operand
            .as_deref()
            .into_iter()
            .chain(when_clauses.iter().flat_map(|(w, t)| [w, t]))
            .chain(else_clause.as_deref())
            .collect(),
        Expression::InList { expr, list, .. } => {
            std::iter::once(&**expr).chain(list.iter()).collect()
        }
        Expression::Between {
            expr, low, high, ..
        } => vec![&**expr, &**low, &**high],
    }
}

/// Whether the expression aggregates over the rows of its own SELECT.
/// Window functions and subqueries do not count.
pub fn contains_aggregate(expr: &Expression) -> bool {
    match expr {
        Expression::Aggregate { .. } => true,
        Expression::WindowFunction { .. } => false,
        _ => children(expr).into_iter().any(contains_aggregate),
    }
}

/// Window functions whose value for a row depends on its position in the
/// window.
const POSITIONAL: &[&str] = &[
    "ROW_NUMBER",
    "RANK",
    "DENSE_RANK",
    "PERCENT_RANK",
    "CUME_DIST",
    "NTILE",
    "FIRST_VALUE",
    "LAST_VALUE",
    "NTH_VALUE",
    "LAG",
    "LEAD",
];

/// Whether `window`, after following named window references through
/// `windows`, carries an ORDER BY. Unknown names count as unordered.
fn is_ordered(window: &WindowSpec, windows: &[NamedWindowSpec]) -> bool {
    let mut current = window;
    // Bounded so that a reference cycle terminates.
    for _ in 0..=windows.len() {
        if !current.order_by.is_empty() {
            return true;
        }
        let Some(base) = current.name.as_deref() else {
            return false;
        };
        match windows.iter().find(|w| w.name.eq_ignore_ascii_case(base)) {
            Some(named) => current = &named.spec,
            None => return false,
        }
    }
    false
}

/// The first aggregate or window function in `expr` whose result depends on
/// row order.
fn order_dependence(expr: &Expression, windows: &[NamedWindowSpec]) -> Option<AnalyzeError> {
    match expr {
        Expression::Aggregate { name, .. } if ORDER_DEPENDENT.contains(&name.as_str()) => {
            Some(AnalyzeError::OrderDependentAggregate(name.clone()))
        }
        Expression::WindowFunction { function, window } => {
            let unordered = match &**function {
                Expression::Aggregate { name, .. } if ORDER_DEPENDENT.contains(&name.as_str()) => {
                    Some(AnalyzeError::OrderDependentAggregate(name.clone()))
                }
                Expression::Function { name, .. } if POSITIONAL.contains(&name.as_str()) => {
                    Some(AnalyzeError::UnorderedWindow(name.clone()))
                }
                _ => None,
            };
            if unordered.is_some() && !is_ordered(window, windows) {
                return unordered;
            }
            children(function)
                .into_iter()
                .chain(window.partition_by.iter())
                .chain(window.order_by.iter().map(|o| &o.expr))
                .find_map(|child| order_dependence(child, windows))
        }
        _ => children(expr)
            .into_iter()
            .find_map(|child| order_dependence(child, windows)),
    }
}

/// What a grouped SELECT may reference outside aggregates.
#[derive(Clone)]
struct Grouping<'q> {
    terms: Vec<&'q Expression>,
    columns: Vec<ResolvedColumn>,
    aliases: Vec<&'q str>,
}

pub struct AggregateValidator<'a> {
    scopes: ScopeArena<'a>,
}

impl<'a> AggregateValidator<'a> {
    pub fn new(schema: &'a [Table]) -> Self {
        Self {
            scopes: ScopeArena::new(schema),
        }
    }

    fn check_select(&self, select: &SelectQuery) -> Result {
        if select.distinct && !select.group_by.is_empty() {
            return Err(AnalyzeError::DistinctWithGroupBy);
        }

        let projected = select.projections.iter().filter_map(|item| match item {
            SelectItem::Expression { expr, .. } => Some(expr),
            _ => None,
        });
        let clauses = projected
            .clone()
            .chain(select.having.as_ref())
            .chain(select.order_by.iter().map(|o| &o.expr));
        for expr in clauses {
            if let Some(err) = order_dependence(expr, &select.windows) {
                return Err(err);
            }
        }

        if select.group_by.is_empty() {
            let aggregated = projected.clone().filter(|e| contains_aggregate(e)).count();
            if aggregated > 0 && aggregated != select.projections.len() {
                return Err(AnalyzeError::MixedAggregate);
            }
            return Ok(());
        }

        let grouping = self.grouping(select);
        for item in &select.projections {
            match item {
                SelectItem::Wildcard => return Err(AnalyzeError::UngroupedColumn("*".into())),
                SelectItem::QualifiedWildcard(table) => {
                    return Err(AnalyzeError::UngroupedColumn(format!(
                        "{}.*",
                        quote_ident(table)
                    )))
                }
                // Projection aliases are not visible inside the projection.
                SelectItem::Expression { expr, .. } => self.check_grouped(
                    expr,
                    &Grouping {
                        aliases: vec![],
                        ..grouping.clone()
                    },
                )?,
            }
        }
        if let Some(having) = &select.having {
            self.check_grouped(having, &grouping)?;
        }
        for order in &select.order_by {
            self.check_grouped(&order.expr, &grouping)?;
        }
        Ok(())
    }

    fn grouping<'q>(&self, select: &'q SelectQuery) -> Grouping<'q> {
        let mut terms = Vec::new();
        for term in &select.group_by {
            terms.push(term);
            // GROUP BY 2 groups by the second result column.
            if let Expression::Literal(Literal::Integer(position)) = term {
                let projected = usize::try_from(*position)
                    .ok()
                    .and_then(|p| p.checked_sub(1))
                    .and_then(|p| select.projections.get(p));
                if let Some(SelectItem::Expression { expr, .. }) = projected {
                    terms.push(expr);
                }
            }
        }

        let columns = terms
            .iter()
            .filter_map(|term| match term {
                Expression::Column { table, name } => {
                    self.scopes.resolve_column(table.as_deref(), name)
                }
                _ => None,
            })
            .filter(|resolved| resolved.depth == 0)
            .collect();

        let aliases = select
            .projections
            .iter()
            .filter_map(|item| match item {
                SelectItem::Expression {
                    alias: Some(alias), ..
                } => Some(alias.as_str()),
                _ => None,
            })
            .collect();

        Grouping {
            terms,
            columns,
            aliases,
        }
    }

    fn check_grouped(&self, expr: &Expression, grouping: &Grouping<'_>) -> Result {
        if grouping.terms.iter().any(|term| *term == expr) {
            return Ok(());
        }

        match expr {
            Expression::Aggregate { .. } | Expression::Subquery(_) | Expression::Exists(_) => {
                Ok(())
            }
            // Window inputs are evaluated over grouped rows.
            Expression::WindowFunction { function, window } => children(function)
                .into_iter()
                .chain(window.partition_by.iter())
                .chain(window.order_by.iter().map(|o| &o.expr))
                .try_for_each(|child| self.check_grouped(child, grouping)),
            Expression::Column { table, name } => {
                if table.is_none()
                    && grouping
                        .aliases
                        .iter()
                        .any(|alias| alias.eq_ignore_ascii_case(name))
                {
                    return Ok(());
                }
                match self.scopes.resolve_column(table.as_deref(), name) {
                    // Outer references are constant within a group.
                    Some(resolved) if resolved.depth > 0 => Ok(()),
                    Some(resolved) if grouping.columns.contains(&resolved) => Ok(()),
                    _ => Err(AnalyzeError::UngroupedColumn(compile_expr(expr))),
                }
            }
            _ => children(expr)
                .into_iter()
                .try_for_each(|child| self.check_grouped(child, grouping)),
        }
    }
}

impl VisitorMut for AggregateValidator<'_> {
    fn enter_with(&mut self, _with: &CTEQuery) -> Result {
        self.scopes.push();
        Ok(())
    }

    fn enter_cte(&mut self, cte: &CTE, recursive: bool) -> Result {
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
        let result = self.check_select(select);
        self.scopes.pop();
        if let Err(err) = &result {
            debug!(?role, %err, "grouping check failed");
        }
        result
    }
}
