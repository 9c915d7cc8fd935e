//! SQL → statement tree parser.
//!
//! Translates SQLite-flavored SQL text into the analyzer's statement tree
//! using `sqlparser` as the parsing frontend. Constructs the analyzer cannot
//! reason about are rejected here instead of being passed through, so a
//! rewritten statement never hides a column reference inside opaque text.
use anyhow::{anyhow, Result};
use sqlparser::ast as sp;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser as SqlParser;

use super::types::*;

/// Parse a SQL string into statement trees.
pub fn parse_sql(sql: &str) -> Result<Vec<Query>> {
    let dialect = SQLiteDialect {};
    let statements =
        SqlParser::parse_sql(&dialect, sql).map_err(|e| anyhow!("SQL parse error: {}", e))?;

    statements.into_iter().map(convert_statement).collect()
}

/// Parse a single SQL statement. Returns an error if the input contains
/// more than one statement.
pub fn parse_single(sql: &str) -> Result<Query> {
    let mut queries = parse_sql(sql)?;
    if queries.len() != 1 {
        return Err(anyhow!("Expected 1 statement, found {}", queries.len()));
    }
    Ok(queries.remove(0))
}

fn convert_statement(stmt: sp::Statement) -> Result<Query> {
    match stmt {
        sp::Statement::Query(q) => convert_query(*q),
        sp::Statement::Insert(insert) => convert_insert(insert),
        sp::Statement::Update {
            table,
            assignments,
            from,
            selection,
            returning,
            ..
        } => {
            if from.is_some() {
                return Err(anyhow!("UPDATE ... FROM is not supported"));
            }
            convert_update(table, assignments, selection, returning)
        }
        sp::Statement::Delete(delete) => convert_delete(delete),
        _ => Ok(Query::Raw(stmt.to_string())),
    }
}

fn convert_query(query: sp::Query) -> Result<Query> {
    let order_by_exprs: Vec<sp::OrderByExpr> =
        query.order_by.map(|ob| ob.exprs).unwrap_or_default();

    if let Some(with) = query.with {
        let recursive = with.recursive;
        let ctes = with
            .cte_tables
            .into_iter()
            .map(convert_cte)
            .collect::<Result<Vec<_>>>()?;

        let body = convert_set_expr(*query.body)?;
        let body = apply_query_modifiers(body, &order_by_exprs, &query.limit, &query.offset)?;

        return Ok(Query::With(CTEQuery {
            recursive,
            ctes,
            body: Box::new(body),
        }));
    }

    let body = convert_set_expr(*query.body)?;
    apply_query_modifiers(body, &order_by_exprs, &query.limit, &query.offset)
}

fn apply_query_modifiers(
    query: Query,
    order_by: &[sp::OrderByExpr],
    limit: &Option<sp::Expr>,
    offset: &Option<sp::Offset>,
) -> Result<Query> {
    let has_modifiers = !order_by.is_empty() || limit.is_some() || offset.is_some();
    match query {
        Query::Select(mut select) => {
            if !order_by.is_empty() {
                select.order_by = order_by
                    .iter()
                    .map(|o| convert_order_by(o.clone()))
                    .collect::<Result<Vec<_>>>()?;
            }
            if let Some(l) = limit {
                select.limit = Some(convert_expr(l.clone())?);
            }
            if let Some(o) = offset {
                select.offset = Some(convert_expr(o.value.clone())?);
            }
            Ok(Query::Select(select))
        }
        other if has_modifiers => Err(anyhow!(
            "ORDER BY / LIMIT on a non-SELECT body is not supported: {:?}",
            other
        )),
        other => Ok(other),
    }
}

fn convert_cte(cte: sp::Cte) -> Result<CTE> {
    let columns = cte
        .alias
        .columns
        .iter()
        .map(|c| c.name.value.clone())
        .collect();
    Ok(CTE {
        name: cte.alias.name.value.clone(),
        columns,
        query: convert_query(*cte.query)?,
    })
}

fn convert_set_expr(expr: sp::SetExpr) -> Result<Query> {
    match expr {
        sp::SetExpr::Select(select) => convert_select(*select),
        sp::SetExpr::Query(query) => convert_query(*query),
        sp::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            let left_query = convert_set_expr(*left)?;
            let right_query = convert_set_expr(*right)?;

            let all = matches!(
                set_quantifier,
                sp::SetQuantifier::All | sp::SetQuantifier::AllByName
            );

            let set_op = SetOperation {
                op: match op {
                    sp::SetOperator::Union => SetOperator::Union,
                    sp::SetOperator::Intersect => SetOperator::Intersect,
                    sp::SetOperator::Except => SetOperator::Except,
                },
                all,
                right: match right_query {
                    Query::Select(s) if s.order_by.is_empty() && s.limit.is_none() => {
                        Query::Select(s)
                    }
                    _ => return Err(anyhow!("Unsupported compound member")),
                },
            };

            // `a UNION b UNION c` arrives left-nested; the chain is kept flat
            // so the compound compiles back in its original member order.
            match left_query {
                Query::Select(mut s) => {
                    s.push_set_op(set_op)?;
                    Ok(Query::Select(s))
                }
                _ => Err(anyhow!("Unsupported compound member")),
            }
        }
        sp::SetExpr::Values(values) => Ok(Query::Raw(format!("VALUES {}", values))),
        _ => Ok(Query::Raw(expr.to_string())),
    }
}

fn convert_select(select: sp::Select) -> Result<Query> {
    let distinct = match select.distinct {
        None => false,
        Some(sp::Distinct::Distinct) => true,
        Some(sp::Distinct::On(_)) => return Err(anyhow!("DISTINCT ON is not supported")),
    };

    let projections = select
        .projection
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    let from = select
        .from
        .into_iter()
        .map(convert_table_with_joins)
        .collect::<Result<Vec<_>>>()?;

    let (tables, join_lists): (Vec<_>, Vec<_>) = from.into_iter().unzip();
    let joins: Vec<Join> = join_lists.into_iter().flatten().collect();

    let filter = select.selection.map(convert_expr).transpose()?;

    let group_by = match select.group_by {
        sp::GroupByExpr::Expressions(exprs, _modifiers) => exprs
            .into_iter()
            .map(convert_expr)
            .collect::<Result<Vec<_>>>()?,
        sp::GroupByExpr::All(_) => return Err(anyhow!("GROUP BY ALL is not supported")),
    };

    let having = select.having.map(convert_expr).transpose()?;

    let windows = select
        .named_window
        .into_iter()
        .map(|nw| {
            Ok(NamedWindowSpec {
                name: nw.0.value.clone(),
                spec: convert_named_window(&nw.1)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Select(Box::new(SelectQuery {
        distinct,
        projections,
        from: tables,
        joins,
        filter,
        group_by,
        having,
        windows,
        order_by: vec![],
        limit: None,
        offset: None,
        set_op: None,
    })))
}

fn convert_table_with_joins(twj: sp::TableWithJoins) -> Result<(TableRef, Vec<Join>)> {
    let table = convert_table_factor(twj.relation)?;
    let joins = twj
        .joins
        .into_iter()
        .map(convert_join)
        .collect::<Result<Vec<_>>>()?;
    Ok((table, joins))
}

fn convert_table_factor(tf: sp::TableFactor) -> Result<TableRef> {
    match tf {
        sp::TableFactor::Table {
            name, alias, args, ..
        } => {
            let alias = alias.map(|a| a.name.value);
            if let Some(args) = args {
                let args = args
                    .args
                    .into_iter()
                    .map(convert_function_arg)
                    .collect::<Result<Vec<_>>>()?;
                return Ok(TableRef::Function {
                    name: name.to_string(),
                    args,
                    alias,
                });
            }

            let mut parts: Vec<String> = name.0.into_iter().map(|p| p.value).collect();
            let table_name = parts
                .pop()
                .ok_or_else(|| anyhow!("Empty table name"))?;
            let schema = match parts.len() {
                0 => None,
                1 => parts.pop(),
                _ => return Err(anyhow!("Unsupported table name: {}", parts.join("."))),
            };
            Ok(TableRef::Table {
                schema,
                name: table_name,
                alias,
            })
        }
        sp::TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias_name = alias
                .map(|a| a.name.value)
                .ok_or_else(|| anyhow!("Subquery in FROM requires an alias"))?;
            Ok(TableRef::Subquery {
                query: Box::new(convert_query(*subquery)?),
                alias: alias_name,
            })
        }
        sp::TableFactor::TableFunction { expr, alias } => Ok(TableRef::Function {
            name: expr.to_string(),
            args: vec![],
            alias: alias.map(|a| a.name.value),
        }),
        other => Err(anyhow!("Unsupported table reference: {}", other)),
    }
}

fn convert_function_arg(arg: sp::FunctionArg) -> Result<Expression> {
    match arg {
        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => convert_expr(e),
        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => Ok(Expression::Wildcard),
        sp::FunctionArg::Named {
            arg: sp::FunctionArgExpr::Expr(e),
            ..
        } => convert_expr(e),
        other => Err(anyhow!("Unsupported function argument: {}", other)),
    }
}

fn convert_join(join: sp::Join) -> Result<Join> {
    let join_type = match &join.join_operator {
        sp::JoinOperator::Inner(_) => JoinType::Inner,
        sp::JoinOperator::LeftOuter(_) => JoinType::Left,
        sp::JoinOperator::RightOuter(_) => JoinType::Right,
        sp::JoinOperator::FullOuter(_) => JoinType::Full,
        sp::JoinOperator::CrossJoin => JoinType::Cross,
        other => return Err(anyhow!("Unsupported join operator: {:?}", other)),
    };

    let condition = match &join.join_operator {
        sp::JoinOperator::Inner(c)
        | sp::JoinOperator::LeftOuter(c)
        | sp::JoinOperator::RightOuter(c)
        | sp::JoinOperator::FullOuter(c) => convert_join_constraint(c)?,
        _ => None,
    };

    Ok(Join {
        join_type,
        table: convert_table_factor(join.relation)?,
        condition,
    })
}

fn convert_join_constraint(constraint: &sp::JoinConstraint) -> Result<Option<JoinCondition>> {
    match constraint {
        sp::JoinConstraint::On(expr) => Ok(Some(JoinCondition::On(convert_expr(expr.clone())?))),
        sp::JoinConstraint::Using(cols) => Ok(Some(JoinCondition::Using(
            cols.iter().map(|c| c.to_string()).collect(),
        ))),
        sp::JoinConstraint::Natural => Ok(Some(JoinCondition::Natural)),
        sp::JoinConstraint::None => Ok(None),
    }
}

fn convert_select_item(item: sp::SelectItem) -> Result<SelectItem> {
    match item {
        sp::SelectItem::UnnamedExpr(expr) => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: None,
        }),
        sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Expression {
            expr: convert_expr(expr)?,
            alias: Some(alias.value),
        }),
        sp::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
        sp::SelectItem::QualifiedWildcard(name, _) => {
            let table = name
                .0
                .last()
                .map(|i| i.value.clone())
                .ok_or_else(|| anyhow!("Empty qualified wildcard"))?;
            Ok(SelectItem::QualifiedWildcard(table))
        }
    }
}

/// SQLite treats `$name` as an identifier start, so unquoted identifiers
/// carrying a parameter sigil are bind parameters, not columns.
fn is_parameter_ident(ident: &sp::Ident) -> bool {
    ident.quote_style.is_none() && ident.value.starts_with(['$', '@', ':', '?'])
}

fn convert_expr(expr: sp::Expr) -> Result<Expression> {
    match expr {
        sp::Expr::Identifier(ident) if is_parameter_ident(&ident) => {
            Ok(Expression::Placeholder(ident.value))
        }
        sp::Expr::Identifier(ident) => Ok(Expression::Column {
            table: None,
            name: ident.value,
        }),
        sp::Expr::CompoundIdentifier(parts) => {
            let mut names: Vec<String> = parts.into_iter().map(|p| p.value).collect();
            let name = names
                .pop()
                .ok_or_else(|| anyhow!("Empty compound identifier"))?;
            match names.len() {
                0 => Ok(Expression::Column { table: None, name }),
                1 => Ok(Expression::Column {
                    table: names.pop(),
                    name,
                }),
                // schema.table.column resolves by table name only
                2 => Ok(Expression::Column {
                    table: names.pop(),
                    name,
                }),
                _ => Err(anyhow!("Unsupported identifier: {}.{}", names.join("."), name)),
            }
        }
        sp::Expr::Value(val) => convert_value(val),
        sp::Expr::BinaryOp { left, op, right } => Ok(Expression::BinaryOp {
            left: Box::new(convert_expr(*left)?),
            op: convert_binary_op(op)?,
            right: Box::new(convert_expr(*right)?),
        }),
        sp::Expr::UnaryOp { op, expr } => Ok(Expression::UnaryOp {
            op: convert_unary_op(op)?,
            expr: Box::new(convert_expr(*expr)?),
        }),
        sp::Expr::Function(func) => convert_function(func),
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            let when_clauses = conditions
                .into_iter()
                .zip(results)
                .map(|(c, r)| Ok((convert_expr(c)?, convert_expr(r)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expression::Case {
                operand: operand.map(|o| convert_expr(*o)).transpose()?.map(Box::new),
                when_clauses,
                else_clause: else_result
                    .map(|e| convert_expr(*e))
                    .transpose()?
                    .map(Box::new),
            })
        }
        sp::Expr::Subquery(q) => Ok(Expression::Subquery(Box::new(convert_query(*q)?))),
        sp::Expr::Exists { subquery, negated } => {
            let exists = Expression::Exists(Box::new(convert_query(*subquery)?));
            if negated {
                Ok(Expression::UnaryOp {
                    op: UnaryOperator::Not,
                    expr: Box::new(exists),
                })
            } else {
                Ok(exists)
            }
        }
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Ok(Expression::InList {
            expr: Box::new(convert_expr(*expr)?),
            list: list
                .into_iter()
                .map(convert_expr)
                .collect::<Result<Vec<_>>>()?,
            negated,
        }),
        sp::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Ok(Expression::InSubquery {
            expr: Box::new(convert_expr(*expr)?),
            subquery: Box::new(convert_query(*subquery)?),
            negated,
        }),
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expression::Between {
            expr: Box::new(convert_expr(*expr)?),
            low: Box::new(convert_expr(*low)?),
            high: Box::new(convert_expr(*high)?),
            negated,
        }),
        sp::Expr::IsNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: false,
        }),
        sp::Expr::IsNotNull(expr) => Ok(Expression::IsNull {
            expr: Box::new(convert_expr(*expr)?),
            negated: true,
        }),
        sp::Expr::IsDistinctFrom(left, right) => Ok(Expression::IsDistinctFrom {
            left: Box::new(convert_expr(*left)?),
            right: Box::new(convert_expr(*right)?),
            negated: false,
        }),
        sp::Expr::IsNotDistinctFrom(left, right) => Ok(Expression::IsDistinctFrom {
            left: Box::new(convert_expr(*left)?),
            right: Box::new(convert_expr(*right)?),
            negated: true,
        }),
        sp::Expr::Collate { expr, collation } => Ok(Expression::Collate {
            expr: Box::new(convert_expr(*expr)?),
            collation: collation.to_string(),
        }),
        sp::Expr::Cast {
            expr, data_type, ..
        } => Ok(Expression::Cast {
            expr: Box::new(convert_expr(*expr)?),
            data_type: data_type.to_string(),
        }),
        sp::Expr::Nested(expr) => Ok(Expression::Nested(Box::new(convert_expr(*expr)?))),
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            escape_char: None,
            ..
        } => {
            let op = if negated {
                BinaryOperator::NotLike
            } else {
                BinaryOperator::Like
            };
            Ok(Expression::BinaryOp {
                left: Box::new(convert_expr(*expr)?),
                op,
                right: Box::new(convert_expr(*pattern)?),
            })
        }
        other => Err(anyhow!("Unsupported expression: {}", other)),
    }
}

fn convert_value(val: sp::Value) -> Result<Expression> {
    match val {
        sp::Value::Null => Ok(Expression::Literal(Literal::Null)),
        sp::Value::Boolean(b) => Ok(Expression::Literal(Literal::Boolean(b))),
        sp::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Expression::Literal(Literal::Integer(i)))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Expression::Literal(Literal::Float(f)))
            } else {
                Err(anyhow!("Invalid numeric literal: {}", n))
            }
        }
        sp::Value::SingleQuotedString(s) => Ok(Expression::Literal(Literal::String(s))),
        sp::Value::Placeholder(p) => Ok(Expression::Placeholder(p)),
        other => Err(anyhow!("Unsupported literal: {}", other)),
    }
}

fn convert_binary_op(op: sp::BinaryOperator) -> Result<BinaryOperator> {
    match op {
        sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
        sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
        sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
        sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
        sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
        sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
        sp::BinaryOperator::And => Ok(BinaryOperator::And),
        sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
        sp::BinaryOperator::Plus => Ok(BinaryOperator::Plus),
        sp::BinaryOperator::Minus => Ok(BinaryOperator::Minus),
        sp::BinaryOperator::Multiply => Ok(BinaryOperator::Multiply),
        sp::BinaryOperator::Divide => Ok(BinaryOperator::Divide),
        sp::BinaryOperator::Modulo => Ok(BinaryOperator::Modulo),
        sp::BinaryOperator::StringConcat => Ok(BinaryOperator::Concat),
        _ => Err(anyhow!("Unsupported binary operator: {:?}", op)),
    }
}

fn convert_unary_op(op: sp::UnaryOperator) -> Result<UnaryOperator> {
    match op {
        sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
        sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
        sp::UnaryOperator::Plus => Ok(UnaryOperator::Plus),
        _ => Err(anyhow!("Unsupported unary operator: {:?}", op)),
    }
}

/// Aggregate functions known to SQLite. `MIN` and `MAX` with more than one
/// argument are scalar functions.
fn is_aggregate(name: &str, arg_count: usize) -> bool {
    match name {
        "MIN" | "MAX" => arg_count == 1,
        "COUNT" | "SUM" | "TOTAL" | "AVG" | "GROUP_CONCAT" | "STRING_AGG" | "JSON_GROUP_ARRAY"
        | "JSON_GROUP_OBJECT" | "ARRAY_AGG" => true,
        _ => false,
    }
}

fn convert_function(func: sp::Function) -> Result<Expression> {
    let name = func.name.to_string().to_uppercase();

    let (args, distinct) = match func.args {
        sp::FunctionArguments::List(arg_list) => {
            let distinct = matches!(
                arg_list.duplicate_treatment,
                Some(sp::DuplicateTreatment::Distinct)
            );
            let args = arg_list
                .args
                .into_iter()
                .map(convert_function_arg)
                .collect::<Result<Vec<_>>>()?;
            (args, distinct)
        }
        sp::FunctionArguments::None => (vec![], false),
        sp::FunctionArguments::Subquery(q) => (
            vec![Expression::Subquery(Box::new(convert_query(*q)?))],
            false,
        ),
    };

    let filter = func
        .filter
        .map(|f| convert_expr(*f))
        .transpose()?
        .map(Box::new);
    let function = if is_aggregate(&name, args.len()) {
        Expression::Aggregate {
            name,
            args,
            distinct,
            filter,
        }
    } else {
        Expression::Function {
            name,
            args,
            distinct,
        }
    };

    match func.over {
        Some(over) => {
            let window = match over {
                sp::WindowType::WindowSpec(spec) => convert_window_spec(spec)?,
                sp::WindowType::NamedWindow(ident) => WindowSpec {
                    name: Some(ident.value),
                    ..Default::default()
                },
            };
            Ok(Expression::WindowFunction {
                function: Box::new(function),
                window,
            })
        }
        None => Ok(function),
    }
}

fn convert_window_spec(spec: sp::WindowSpec) -> Result<WindowSpec> {
    let partition_by = spec
        .partition_by
        .into_iter()
        .map(convert_expr)
        .collect::<Result<Vec<_>>>()?;

    let order_by = spec
        .order_by
        .into_iter()
        .map(convert_order_by)
        .collect::<Result<Vec<_>>>()?;

    let frame = spec.window_frame.map(convert_window_frame).transpose()?;

    Ok(WindowSpec {
        name: spec.window_name.map(|ident| ident.value),
        partition_by,
        order_by,
        frame,
    })
}

fn convert_named_window(spec: &sp::NamedWindowExpr) -> Result<WindowSpec> {
    match spec {
        sp::NamedWindowExpr::NamedWindow(ident) => Ok(WindowSpec {
            name: Some(ident.value.clone()),
            ..Default::default()
        }),
        sp::NamedWindowExpr::WindowSpec(spec) => convert_window_spec(spec.clone()),
    }
}

fn convert_window_frame(frame: sp::WindowFrame) -> Result<WindowFrame> {
    let mode = match frame.units {
        sp::WindowFrameUnits::Rows => WindowFrameMode::Rows,
        sp::WindowFrameUnits::Range => WindowFrameMode::Range,
        sp::WindowFrameUnits::Groups => WindowFrameMode::Groups,
    };

    let start = convert_window_frame_bound(frame.start_bound)?;
    let end = frame
        .end_bound
        .map(convert_window_frame_bound)
        .transpose()?;

    Ok(WindowFrame { mode, start, end })
}

fn frame_offset(expr: sp::Expr) -> Result<u64> {
    match expr {
        sp::Expr::Value(sp::Value::Number(n, _)) => n
            .parse()
            .map_err(|_| anyhow!("Invalid window frame offset: {}", n)),
        other => Err(anyhow!("Unsupported window frame offset: {}", other)),
    }
}

fn convert_window_frame_bound(bound: sp::WindowFrameBound) -> Result<WindowFrameBound> {
    match bound {
        sp::WindowFrameBound::CurrentRow => Ok(WindowFrameBound::CurrentRow),
        sp::WindowFrameBound::Preceding(None) => Ok(WindowFrameBound::Preceding(None)),
        sp::WindowFrameBound::Preceding(Some(expr)) => {
            Ok(WindowFrameBound::Preceding(Some(frame_offset(*expr)?)))
        }
        sp::WindowFrameBound::Following(None) => Ok(WindowFrameBound::Following(None)),
        sp::WindowFrameBound::Following(Some(expr)) => {
            Ok(WindowFrameBound::Following(Some(frame_offset(*expr)?)))
        }
    }
}

fn convert_order_by(order: sp::OrderByExpr) -> Result<OrderByExpr> {
    Ok(OrderByExpr {
        expr: convert_expr(order.expr)?,
        asc: order.asc,
        nulls_first: order.nulls_first,
    })
}

fn convert_insert(insert: sp::Insert) -> Result<Query> {
    let name = insert
        .table_name
        .0
        .last()
        .map(|i| i.value.clone())
        .ok_or_else(|| anyhow!("INSERT without table name"))?;
    let table = TableRef::Table {
        schema: None,
        name,
        alias: None,
    };

    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let source = match insert.source {
        Some(src) => match *src.body {
            sp::SetExpr::Values(values) if src.with.is_none() => {
                let rows = values
                    .rows
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(convert_expr)
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                InsertSource::Values(rows)
            }
            _ => InsertSource::Query(Box::new(convert_query(*src)?)),
        },
        None => InsertSource::DefaultValues,
    };

    let returning = insert
        .returning
        .unwrap_or_default()
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Insert(InsertQuery {
        table,
        columns,
        source,
        returning,
    }))
}

fn convert_update(
    table: sp::TableWithJoins,
    assignments: Vec<sp::Assignment>,
    selection: Option<sp::Expr>,
    returning: Option<Vec<sp::SelectItem>>,
) -> Result<Query> {
    if !table.joins.is_empty() {
        return Err(anyhow!("UPDATE with joins is not supported"));
    }
    let table_ref = convert_table_factor(table.relation)?;

    let assigns = assignments
        .into_iter()
        .map(|a| {
            let column = match a.target {
                sp::AssignmentTarget::ColumnName(name) => name
                    .0
                    .last()
                    .map(|i| i.value.clone())
                    .ok_or_else(|| anyhow!("Empty assignment target"))?,
                other => return Err(anyhow!("Unsupported assignment target: {}", other)),
            };
            Ok(Assignment {
                column,
                value: convert_expr(a.value)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let filter = selection.map(convert_expr).transpose()?;

    let ret = returning
        .unwrap_or_default()
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Update(UpdateQuery {
        table: table_ref,
        assignments: assigns,
        filter,
        returning: ret,
    }))
}

fn convert_delete(delete: sp::Delete) -> Result<Query> {
    let from_tables = match delete.from {
        sp::FromTable::WithFromKeyword(tables) => tables,
        sp::FromTable::WithoutKeyword(tables) => tables,
    };

    let table_ref = match from_tables.into_iter().next() {
        Some(twj) if twj.joins.is_empty() => convert_table_factor(twj.relation)?,
        Some(_) => return Err(anyhow!("DELETE with joins is not supported")),
        None => return Err(anyhow!("DELETE without table reference")),
    };

    let filter = delete.selection.map(convert_expr).transpose()?;

    let returning = delete
        .returning
        .unwrap_or_default()
        .into_iter()
        .map(convert_select_item)
        .collect::<Result<Vec<_>>>()?;

    Ok(Query::Delete(DeleteQuery {
        table: table_ref,
        filter,
        returning,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(sql: &str) -> SelectQuery {
        match parse_single(sql).unwrap() {
            Query::Select(s) => *s,
            other => panic!("Expected Select query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_select() {
        let s = select("SELECT * FROM users");
        assert_eq!(s.projections.len(), 1);
        assert!(matches!(s.projections[0], SelectItem::Wildcard));
        assert_eq!(s.from.len(), 1);
    }

    #[test]
    fn test_parse_select_with_join() {
        let s = select("SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id");
        assert_eq!(s.joins.len(), 1);
        assert!(matches!(s.joins[0].join_type, JoinType::Inner));
        assert_eq!(s.joins[0].table.visible_name(), "o");
    }

    #[test]
    fn test_parse_comma_join_keeps_every_table() {
        let s = select("SELECT * FROM a, b");
        assert_eq!(s.from.len(), 2);
    }

    #[test]
    fn test_parse_using_and_natural() {
        let s = select("SELECT * FROM a JOIN b USING (id)");
        assert!(matches!(
            s.joins[0].condition,
            Some(JoinCondition::Using(ref cols)) if cols == &vec!["id".to_string()]
        ));

        let s = select("SELECT * FROM a NATURAL JOIN b");
        assert!(matches!(s.joins[0].condition, Some(JoinCondition::Natural)));
    }

    #[test]
    fn test_parse_named_placeholders() {
        let s = select("SELECT * FROM users WHERE id = $id AND owner = @caller");
        let filter = s.filter.unwrap();
        let Expression::BinaryOp { left, right, .. } = filter else {
            panic!("Expected AND");
        };
        let Expression::BinaryOp { right: id, .. } = *left else {
            panic!("Expected comparison");
        };
        assert_eq!(*id, Expression::Placeholder("$id".into()));
        let Expression::BinaryOp { right: caller, .. } = *right else {
            panic!("Expected comparison");
        };
        assert_eq!(*caller, Expression::Placeholder("@caller".into()));
    }

    #[test]
    fn test_parse_quoted_dollar_identifier_is_column() {
        let s = select(r#"SELECT "$id" FROM users"#);
        assert!(matches!(
            &s.projections[0],
            SelectItem::Expression { expr: Expression::Column { name, .. }, .. } if name == "$id"
        ));
    }

    #[test]
    fn test_parse_cte() {
        let q = parse_single(
            "WITH active AS (SELECT * FROM users WHERE active = true) SELECT * FROM active",
        )
        .unwrap();
        match q {
            Query::With(cte) => {
                assert!(!cte.recursive);
                assert_eq!(cte.ctes.len(), 1);
                assert_eq!(cte.ctes[0].name, "active");
            }
            _ => panic!("Expected CTE query"),
        }
    }

    #[test]
    fn test_parse_chained_union_keeps_all_members() {
        let s = select("SELECT id FROM a UNION SELECT id FROM b EXCEPT SELECT id FROM c");
        let cores = s.cores();
        assert_eq!(cores.len(), 3);
        assert_eq!(cores[2].from[0].visible_name(), "c");
        assert!(matches!(s.set_op.as_ref().unwrap().op, SetOperator::Union));
    }

    #[test]
    fn test_parse_compound_order_by_lands_on_head() {
        let s = select("SELECT id FROM a UNION ALL SELECT id FROM b ORDER BY id");
        assert_eq!(s.order_by.len(), 1);
        assert!(s.set_op.unwrap().all);
    }

    #[test]
    fn test_parse_insert() {
        let q = parse_single("INSERT INTO users (name, email) VALUES ('John', 'john@example.com')")
            .unwrap();
        match q {
            Query::Insert(i) => {
                assert_eq!(i.columns.len(), 2);
                match &i.source {
                    InsertSource::Values(rows) => assert_eq!(rows.len(), 1),
                    _ => panic!("Expected values source"),
                }
            }
            _ => panic!("Expected Insert query"),
        }
    }

    #[test]
    fn test_parse_insert_select() {
        let q = parse_single("INSERT INTO archive SELECT * FROM users").unwrap();
        match q {
            Query::Insert(i) => assert!(matches!(i.source, InsertSource::Query(_))),
            _ => panic!("Expected Insert query"),
        }
    }

    #[test]
    fn test_parse_update() {
        let q = parse_single("UPDATE users SET name = 'Jane' WHERE id = 1").unwrap();
        match q {
            Query::Update(u) => {
                assert_eq!(u.assignments.len(), 1);
                assert_eq!(u.assignments[0].column, "name");
                assert!(u.filter.is_some());
            }
            _ => panic!("Expected Update query"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let q = parse_single("DELETE FROM users WHERE id = 1").unwrap();
        assert!(matches!(q, Query::Delete(DeleteQuery { filter: Some(_), .. })));
    }

    #[test]
    fn test_parse_aggregates() {
        let s = select("SELECT COUNT(DISTINCT status), MAX(a, b), TOTAL(x) FROM orders");
        let exprs: Vec<&Expression> = s
            .projections
            .iter()
            .map(|p| match p {
                SelectItem::Expression { expr, .. } => expr,
                _ => panic!("Expected expression"),
            })
            .collect();
        assert!(matches!(
            exprs[0],
            Expression::Aggregate { distinct: true, name, .. } if name == "COUNT"
        ));
        assert!(matches!(exprs[1], Expression::Function { name, .. } if name == "MAX"));
        assert!(matches!(exprs[2], Expression::Aggregate { name, .. } if name == "TOTAL"));
    }

    #[test]
    fn test_parse_collate_and_distinct_from() {
        let s =
            select("SELECT * FROM a WHERE name COLLATE NOCASE = 'x' AND b IS NOT DISTINCT FROM c");
        let Some(Expression::BinaryOp { left, right, .. }) = s.filter else {
            panic!("Expected AND");
        };
        assert!(matches!(
            *left,
            Expression::BinaryOp { ref left, .. } if matches!(**left, Expression::Collate { .. })
        ));
        assert!(matches!(
            *right,
            Expression::IsDistinctFrom { negated: true, .. }
        ));
    }

    #[test]
    fn test_parse_window_function() {
        let s = select(
            "SELECT name, ROW_NUMBER() OVER (PARTITION BY dept ORDER BY salary DESC) FROM employees",
        );
        match &s.projections[1] {
            SelectItem::Expression { expr, .. } => {
                assert!(matches!(expr, Expression::WindowFunction { .. }));
            }
            _ => panic!("Expected window function expression"),
        }
    }

    #[test]
    fn test_parse_windowed_aggregate() {
        let s = select(
            "SELECT SUM(salary) FILTER (WHERE salary > 0) OVER w, RANK() OVER (w ORDER BY id) \
             FROM employees WINDOW w AS (PARTITION BY dept)",
        );
        let SelectItem::Expression {
            expr: Expression::WindowFunction { function, window },
            ..
        } = &s.projections[0]
        else {
            panic!("Expected window function expression");
        };
        assert!(matches!(
            **function,
            Expression::Aggregate { ref name, filter: Some(_), .. } if name == "SUM"
        ));
        assert_eq!(window.name.as_deref(), Some("w"));

        let SelectItem::Expression {
            expr: Expression::WindowFunction { function, window },
            ..
        } = &s.projections[1]
        else {
            panic!("Expected window function expression");
        };
        assert!(matches!(**function, Expression::Function { .. }));
        assert_eq!(window.name.as_deref(), Some("w"));
        assert_eq!(window.order_by.len(), 1);
        assert_eq!(s.windows[0].name, "w");
    }

    #[test]
    fn test_parse_multiple_statements() {
        let queries = parse_sql("SELECT 1; SELECT 2").unwrap();
        assert_eq!(queries.len(), 2);
        assert!(parse_single("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_parse_invalid_sql() {
        assert!(parse_single("SELCT * FORM users").is_err());
    }

    #[test]
    fn test_parse_ddl_is_raw() {
        let q = parse_single("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        assert!(matches!(q, Query::Raw(_)));
    }
}
