//! Statement tree consumed by the determinism analyzer.
//!
//! The tree is produced by [`super::parser`] from SQL text and turned back
//! into canonical SQL by [`super::compiler`]. Rewrites happen in place through
//! [`crate::analyzer::walk`], so every node owns its children.

/// Top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<SelectQuery>),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
    /// Common Table Expressions wrapping an inner statement.
    With(CTEQuery),
    /// Statements the analyzer does not rewrite (DDL, pragmas, bare VALUES).
    Raw(String),
}

impl Query {
    /// Whether executing this statement writes to the datastore.
    pub fn is_mutative(&self) -> bool {
        match self {
            Query::Insert(_) | Query::Update(_) | Query::Delete(_) => true,
            Query::With(cte) => cte.body.is_mutative(),
            Query::Select(_) => false,
            Query::Raw(sql) => {
                let head = sql.trim_start().to_ascii_uppercase();
                !(head.starts_with("SELECT") || head.starts_with("VALUES"))
            }
        }
    }
}

/// A SELECT core, optionally heading a compound chain through `set_op`.
///
/// For a compound statement the ORDER BY, LIMIT and OFFSET stored on the head
/// apply to the whole compound.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub joins: Vec<Join>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub having: Option<Expression>,
    pub windows: Vec<NamedWindowSpec>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expression>,
    pub offset: Option<Expression>,
    /// Set operations (UNION, INTERSECT, EXCEPT).
    pub set_op: Option<Box<SetOperation>>,
}

impl SelectQuery {
    pub fn is_compound(&self) -> bool {
        self.set_op.is_some()
    }

    /// Appends a set operation at the end of the compound chain.
    pub fn push_set_op(&mut self, op: SetOperation) -> anyhow::Result<()> {
        match self.set_op.as_mut() {
            Some(existing) => match &mut existing.right {
                Query::Select(right) => right.push_set_op(op),
                other => Err(anyhow::anyhow!(
                    "compound member is not a SELECT: {:?}",
                    other
                )),
            },
            None => {
                self.set_op = Some(Box::new(op));
                Ok(())
            }
        }
    }

    /// Every core of a compound chain, head first.
    pub fn cores(&self) -> Vec<&SelectQuery> {
        let mut cores = vec![self];
        let mut current = self;
        while let Some(Query::Select(next)) = current.set_op.as_ref().map(|s| &s.right) {
            cores.push(next);
            current = next;
        }
        cores
    }
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// `table.*`
    QualifiedWildcard(String),
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// Simple table: `schema.table AS alias`
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// Subquery: `(SELECT ...) AS alias`
    Subquery { query: Box<Query>, alias: String },
    /// Table-valued function: `json_each(x) AS alias`
    Function {
        name: String,
        args: Vec<Expression>,
        alias: Option<String>,
    },
}

impl TableRef {
    /// The name this relation is visible under: its alias, or its base name.
    pub fn visible_name(&self) -> &str {
        match self {
            TableRef::Table { name, alias, .. } => alias.as_deref().unwrap_or(name),
            TableRef::Subquery { alias, .. } => alias,
            TableRef::Function { name, alias, .. } => alias.as_deref().unwrap_or(name),
        }
    }
}

/// JOIN clause representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub condition: Option<JoinCondition>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinCondition {
    On(Expression),
    Using(Vec<String>),
    Natural,
}

/// Core expression type. Recursive to support arbitrary nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    /// Literal value.
    Literal(Literal),
    /// Named or anonymous bind parameter: `$id`, `@caller`, `:name`, `?`.
    Placeholder(String),
    /// Binary operation: `left op right`.
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Unary operation: `op expr` (e.g., NOT, -).
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// Function call: `name(args)`.
    Function {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    /// Aggregate function with optional filter.
    Aggregate {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
        filter: Option<Box<Expression>>,
    },
    /// Window function: `expr OVER (...)`.
    WindowFunction {
        function: Box<Expression>,
        window: WindowSpec,
    },
    /// CASE expression.
    Case {
        operand: Option<Box<Expression>>,
        when_clauses: Vec<(Expression, Expression)>,
        else_clause: Option<Box<Expression>>,
    },
    /// Subquery expression: `(SELECT ...)`.
    Subquery(Box<Query>),
    /// EXISTS (SELECT ...).
    Exists(Box<Query>),
    /// expr IN (values).
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expression>,
        subquery: Box<Query>,
        negated: bool,
    },
    /// expr BETWEEN low AND high.
    Between {
        expr: Box<Expression>,
        low: Box<Expression>,
        high: Box<Expression>,
        negated: bool,
    },
    /// expr IS NULL / IS NOT NULL.
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// left IS [NOT] DISTINCT FROM right.
    IsDistinctFrom {
        left: Box<Expression>,
        right: Box<Expression>,
        negated: bool,
    },
    /// expr COLLATE collation.
    Collate {
        expr: Box<Expression>,
        collation: String,
    },
    /// CAST(expr AS type).
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// Wildcard `*` (used in COUNT(*)).
    Wildcard,
    /// Nested expression (parenthesized).
    Nested(Box<Expression>),
}

impl Expression {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        Expression::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// Binary operators.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // Arithmetic
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    // String
    Like,
    NotLike,
    Concat,
}

impl BinaryOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        )
    }
}

/// Unary operators.
#[derive(Debug, Clone, PartialEq)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
}

/// Window specification for window functions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowSpec {
    pub name: Option<String>,
    pub partition_by: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub frame: Option<WindowFrame>,
}

/// Named window definition for WINDOW clause.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedWindowSpec {
    pub name: String,
    pub spec: WindowSpec,
}

/// Window frame specification.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFrame {
    pub mode: WindowFrameMode,
    pub start: WindowFrameBound,
    pub end: Option<WindowFrameBound>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowFrameMode {
    Rows,
    Range,
    Groups,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowFrameBound {
    CurrentRow,
    Preceding(Option<u64>),
    Following(Option<u64>),
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}

impl OrderByExpr {
    /// The canonical tie-breaker form: `expr ASC NULLS LAST`.
    pub fn ascending_nulls_last(expr: Expression) -> Self {
        Self {
            expr,
            asc: Some(true),
            nulls_first: Some(false),
        }
    }
}

/// Set operations (UNION, INTERSECT, EXCEPT).
#[derive(Debug, Clone, PartialEq)]
pub struct SetOperation {
    pub op: SetOperator,
    pub all: bool,
    pub right: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOperator {
    Union,
    Intersect,
    Except,
}

/// Common Table Expression (WITH clause).
#[derive(Debug, Clone, PartialEq)]
pub struct CTEQuery {
    pub recursive: bool,
    pub ctes: Vec<CTE>,
    pub body: Box<Query>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CTE {
    pub name: String,
    pub columns: Vec<String>,
    pub query: Query,
}

/// INSERT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub source: InsertSource,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertSource {
    Values(Vec<Vec<Expression>>),
    Query(Box<Query>),
    DefaultValues,
}

/// UPDATE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: TableRef,
    pub assignments: Vec<Assignment>,
    pub filter: Option<Expression>,
    pub returning: Vec<SelectItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub value: Expression,
}

/// DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: TableRef,
    pub filter: Option<Expression>,
    pub returning: Vec<SelectItem>,
}
