//! Statement tree → canonical SQL compiler.
//!
//! Every identifier is double-quoted and every clause is rendered in a fixed
//! shape, so two structurally equal trees always compile to byte-identical
//! text. The output targets SQLite.
use super::types::*;

/// Compile a statement tree into canonical SQLite SQL.
pub fn compile(query: &Query) -> String {
    match query {
        Query::Select(s) => compile_select(s),
        Query::Insert(i) => compile_insert(i),
        Query::Update(u) => compile_update(u),
        Query::Delete(d) => compile_delete(d),
        Query::With(cte) => compile_cte(cte),
        Query::Raw(sql) => sql.clone(),
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn compile_select(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    let mut select_clause = String::from("SELECT ");
    if select.distinct {
        select_clause.push_str("DISTINCT ");
    }

    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    if !select.from.is_empty() {
        let tables: Vec<String> = select.from.iter().map(compile_table_ref).collect();
        parts.push(format!("FROM {}", tables.join(", ")));
    }

    for join in &select.joins {
        parts.push(compile_join(join));
    }

    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter)));
    }

    if !select.group_by.is_empty() {
        let groups: Vec<String> = select.group_by.iter().map(compile_expr).collect();
        parts.push(format!("GROUP BY {}", groups.join(", ")));
    }

    if let Some(ref having) = select.having {
        parts.push(format!("HAVING {}", compile_expr(having)));
    }

    if !select.windows.is_empty() {
        let windows: Vec<String> = select
            .windows
            .iter()
            .map(|w| {
                format!(
                    "{} AS ({})",
                    quote_ident(&w.name),
                    compile_window_spec(&w.spec)
                )
            })
            .collect();
        parts.push(format!("WINDOW {}", windows.join(", ")));
    }

    if let Some(ref set_op) = select.set_op {
        let op_str = match set_op.op {
            SetOperator::Union => "UNION",
            SetOperator::Intersect => "INTERSECT",
            SetOperator::Except => "EXCEPT",
        };
        let all_str = if set_op.all { " ALL" } else { "" };
        parts.push(format!("{}{} {}", op_str, all_str, compile(&set_op.right)));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(ref limit) = select.limit {
        parts.push(format!("LIMIT {}", compile_expr(limit)));
    }

    if let Some(ref offset) = select.offset {
        parts.push(format!("OFFSET {}", compile_expr(offset)));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::QualifiedWildcard(table) => format!("{}.*", quote_ident(table)),
        SelectItem::Expression { expr, alias } => {
            let expr_str = compile_expr(expr);
            match alias {
                Some(a) => format!("{} AS {}", expr_str, quote_ident(a)),
                None => expr_str,
            }
        }
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    match table {
        TableRef::Table {
            schema,
            name,
            alias,
        } => {
            let mut s = match schema {
                Some(sc) => format!("{}.{}", quote_ident(sc), quote_ident(name)),
                None => quote_ident(name),
            };
            if let Some(a) = alias {
                s.push_str(&format!(" AS {}", quote_ident(a)));
            }
            s
        }
        TableRef::Subquery { query, alias } => {
            format!("({}) AS {}", compile(query), quote_ident(alias))
        }
        TableRef::Function { name, args, alias } => {
            let mut s = if args.is_empty() && name.ends_with(')') {
                name.clone()
            } else {
                let args_str: Vec<String> = args.iter().map(compile_expr).collect();
                format!("{}({})", name, args_str.join(", "))
            };
            if let Some(a) = alias {
                s.push_str(&format!(" AS {}", quote_ident(a)));
            }
            s
        }
    }
}

fn compile_join(join: &Join) -> String {
    let natural = matches!(join.condition, Some(JoinCondition::Natural));
    let type_str = match join.join_type {
        JoinType::Inner => "JOIN",
        JoinType::Left => "LEFT JOIN",
        JoinType::Right => "RIGHT JOIN",
        JoinType::Full => "FULL JOIN",
        JoinType::Cross => "CROSS JOIN",
    };

    let table_str = compile_table_ref(&join.table);

    let condition_str = match &join.condition {
        Some(JoinCondition::On(expr)) => format!(" ON {}", compile_expr(expr)),
        Some(JoinCondition::Using(cols)) => {
            let cols: Vec<String> = cols.iter().map(|c| quote_ident(c)).collect();
            format!(" USING ({})", cols.join(", "))
        }
        Some(JoinCondition::Natural) | None => String::new(),
    };

    if natural {
        format!("NATURAL {} {}", type_str, table_str)
    } else {
        format!("{} {}{}", type_str, table_str, condition_str)
    }
}

/// Compile a single expression.
pub fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", quote_ident(t), quote_ident(name)),
            None => quote_ident(name),
        },
        Expression::Literal(lit) => compile_literal(lit),
        Expression::Placeholder(p) => p.clone(),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::NotEq => "<>",
                BinaryOperator::Lt => "<",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::Gt => ">",
                BinaryOperator::GtEq => ">=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
                BinaryOperator::Plus => "+",
                BinaryOperator::Minus => "-",
                BinaryOperator::Multiply => "*",
                BinaryOperator::Divide => "/",
                BinaryOperator::Modulo => "%",
                BinaryOperator::Like => "LIKE",
                BinaryOperator::NotLike => "NOT LIKE",
                BinaryOperator::Concat => "||",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::UnaryOp { op, expr } => {
            let op_str = match op {
                UnaryOperator::Not => "NOT",
                UnaryOperator::Minus => "-",
                UnaryOperator::Plus => "+",
            };
            format!("{} {}", op_str, compile_expr(expr))
        }
        Expression::Function {
            name,
            args,
            distinct,
        } => {
            let distinct_str = if *distinct { "DISTINCT " } else { "" };
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({}{})", name, distinct_str, args_str.join(", "))
        }
        Expression::Aggregate {
            name,
            args,
            distinct,
            filter,
        } => {
            let distinct_str = if *distinct { "DISTINCT " } else { "" };
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            let mut s = format!("{}({}{})", name, distinct_str, args_str.join(", "));
            if let Some(f) = filter {
                s.push_str(&format!(" FILTER (WHERE {})", compile_expr(f)));
            }
            s
        }
        Expression::WindowFunction { function, window } => match (&window.name, is_bare(window)) {
            (Some(name), true) => format!("{} OVER {}", compile_expr(function), quote_ident(name)),
            _ => format!(
                "{} OVER ({})",
                compile_expr(function),
                compile_window_spec(window)
            ),
        },
        Expression::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            let mut s = String::from("CASE");
            if let Some(op) = operand {
                s.push_str(&format!(" {}", compile_expr(op)));
            }
            for (when, then) in when_clauses {
                s.push_str(&format!(
                    " WHEN {} THEN {}",
                    compile_expr(when),
                    compile_expr(then)
                ));
            }
            if let Some(else_expr) = else_clause {
                s.push_str(&format!(" ELSE {}", compile_expr(else_expr)));
            }
            s.push_str(" END");
            s
        }
        Expression::Subquery(q) => format!("({})", compile(q)),
        Expression::Exists(q) => format!("EXISTS ({})", compile(q)),
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            let items: Vec<String> = list.iter().map(compile_expr).collect();
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                items.join(", ")
            )
        }
        Expression::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                compile(subquery)
            )
        }
        Expression::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} {}BETWEEN {} AND {}",
                compile_expr(expr),
                not_str,
                compile_expr(low),
                compile_expr(high)
            )
        }
        Expression::IsNull { expr, negated } => {
            if *negated {
                format!("{} IS NOT NULL", compile_expr(expr))
            } else {
                format!("{} IS NULL", compile_expr(expr))
            }
        }
        Expression::IsDistinctFrom {
            left,
            right,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} IS {}DISTINCT FROM {}",
                compile_expr(left),
                not_str,
                compile_expr(right)
            )
        }
        Expression::Collate { expr, collation } => {
            format!("{} COLLATE {}", compile_expr(expr), collation)
        }
        Expression::Cast { expr, data_type } => {
            format!("CAST({} AS {})", compile_expr(expr), data_type)
        }
        Expression::Wildcard => "*".to_string(),
        Expression::Nested(expr) => format!("({})", compile_expr(expr)),
    }
}

fn is_bare(spec: &WindowSpec) -> bool {
    spec.partition_by.is_empty() && spec.order_by.is_empty() && spec.frame.is_none()
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "NULL".to_string(),
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::Float(f) => format!("{:?}", f),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn compile_window_spec(spec: &WindowSpec) -> String {
    let mut parts = Vec::new();

    if let Some(ref name) = spec.name {
        parts.push(quote_ident(name));
    }

    if !spec.partition_by.is_empty() {
        let cols: Vec<String> = spec.partition_by.iter().map(compile_expr).collect();
        parts.push(format!("PARTITION BY {}", cols.join(", ")));
    }

    if !spec.order_by.is_empty() {
        let orders: Vec<String> = spec.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(ref frame) = spec.frame {
        parts.push(compile_window_frame(frame));
    }

    parts.join(" ")
}

fn compile_window_frame(frame: &WindowFrame) -> String {
    let mode = match frame.mode {
        WindowFrameMode::Rows => "ROWS",
        WindowFrameMode::Range => "RANGE",
        WindowFrameMode::Groups => "GROUPS",
    };

    let start = compile_window_frame_bound(&frame.start);

    match &frame.end {
        Some(end) => format!(
            "{} BETWEEN {} AND {}",
            mode,
            start,
            compile_window_frame_bound(end)
        ),
        None => format!("{} {}", mode, start),
    }
}

fn compile_window_frame_bound(bound: &WindowFrameBound) -> String {
    match bound {
        WindowFrameBound::CurrentRow => "CURRENT ROW".to_string(),
        WindowFrameBound::Preceding(None) => "UNBOUNDED PRECEDING".to_string(),
        WindowFrameBound::Preceding(Some(n)) => format!("{} PRECEDING", n),
        WindowFrameBound::Following(None) => "UNBOUNDED FOLLOWING".to_string(),
        WindowFrameBound::Following(Some(n)) => format!("{} FOLLOWING", n),
    }
}

fn compile_order_by(order: &OrderByExpr) -> String {
    let mut s = compile_expr(&order.expr);
    match order.asc {
        Some(true) => s.push_str(" ASC"),
        Some(false) => s.push_str(" DESC"),
        None => {}
    }
    match order.nulls_first {
        Some(true) => s.push_str(" NULLS FIRST"),
        Some(false) => s.push_str(" NULLS LAST"),
        None => {}
    }
    s
}

fn compile_cte(cte: &CTEQuery) -> String {
    let recursive = if cte.recursive { "RECURSIVE " } else { "" };

    let ctes: Vec<String> = cte
        .ctes
        .iter()
        .map(|c| {
            let cols = if c.columns.is_empty() {
                String::new()
            } else {
                let cols: Vec<String> = c.columns.iter().map(|col| quote_ident(col)).collect();
                format!("({})", cols.join(", "))
            };
            format!("{}{} AS ({})", quote_ident(&c.name), cols, compile(&c.query))
        })
        .collect();

    format!(
        "WITH {}{} {}",
        recursive,
        ctes.join(", "),
        compile(&cte.body)
    )
}

fn compile_returning(items: &[SelectItem]) -> String {
    if items.is_empty() {
        String::new()
    } else {
        let items: Vec<String> = items.iter().map(compile_select_item).collect();
        format!(" RETURNING {}", items.join(", "))
    }
}

fn compile_insert(insert: &InsertQuery) -> String {
    let table = compile_table_ref(&insert.table);
    let columns = if insert.columns.is_empty() {
        String::new()
    } else {
        let cols: Vec<String> = insert.columns.iter().map(|c| quote_ident(c)).collect();
        format!(" ({})", cols.join(", "))
    };

    let source = match &insert.source {
        InsertSource::Values(rows) => {
            let row_strs: Vec<String> = rows
                .iter()
                .map(|row| {
                    let vals: Vec<String> = row.iter().map(compile_expr).collect();
                    format!("({})", vals.join(", "))
                })
                .collect();
            format!("VALUES {}", row_strs.join(", "))
        }
        InsertSource::Query(q) => compile(q),
        InsertSource::DefaultValues => "DEFAULT VALUES".to_string(),
    };

    format!(
        "INSERT INTO {}{} {}{}",
        table,
        columns,
        source,
        compile_returning(&insert.returning)
    )
}

fn compile_update(update: &UpdateQuery) -> String {
    let table = compile_table_ref(&update.table);

    let sets: Vec<String> = update
        .assignments
        .iter()
        .map(|a| format!("{} = {}", quote_ident(&a.column), compile_expr(&a.value)))
        .collect();

    let filter = match &update.filter {
        Some(f) => format!(" WHERE {}", compile_expr(f)),
        None => String::new(),
    };

    format!(
        "UPDATE {} SET {}{}{}",
        table,
        sets.join(", "),
        filter,
        compile_returning(&update.returning)
    )
}

fn compile_delete(delete: &DeleteQuery) -> String {
    let table = compile_table_ref(&delete.table);

    let filter = match &delete.filter {
        Some(f) => format!(" WHERE {}", compile_expr(f)),
        None => String::new(),
    };

    format!(
        "DELETE FROM {}{}{}",
        table,
        filter,
        compile_returning(&delete.returning)
    )
}
