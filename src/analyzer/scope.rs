//! Scope arena shared by the ordering and aggregate walkers.
//!
//! Scopes live in a flat vector and point at their parent by index. A scope
//! is pushed for every SELECT core, WITH clause and DML target, and popped
//! when the walker leaves it. Popping only moves the cursor back to the
//! parent; the arena itself lives as long as one analysis.
use crate::ast::*;
use crate::schema::{find_table, Table};

use super::AnalyzeError;

type Result<T> = std::result::Result<T, AnalyzeError>;

pub type ScopeId = usize;

/// A table instance visible in a SELECT core, keyed by alias or base name.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub table: Table,
}

/// A column reference resolved through the scope chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumn {
    /// 0 for the innermost scope, 1 for its parent, and so on.
    pub depth: usize,
    pub relation: String,
    pub column: String,
}

#[derive(Debug, Default)]
struct Scope {
    parent: Option<ScopeId>,
    relations: Vec<Relation>,
    ctes: Vec<Table>,
}

pub struct ScopeArena<'a> {
    schema: &'a [Table],
    scopes: Vec<Scope>,
    current: Option<ScopeId>,
}

impl<'a> ScopeArena<'a> {
    pub fn new(schema: &'a [Table]) -> Self {
        Self {
            schema,
            scopes: Vec::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<ScopeId> {
        self.current
    }

    pub fn push(&mut self) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            parent: self.current,
            ..Default::default()
        });
        self.current = Some(id);
        id
    }

    pub fn pop(&mut self) {
        if let Some(id) = self.current {
            self.current = self.scopes[id].parent;
        }
    }

    /// Relations of the innermost scope.
    pub fn relations(&self) -> &[Relation] {
        match self.current {
            Some(id) => &self.scopes[id].relations,
            None => &[],
        }
    }

    fn chain(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(self.current.map(|id| &self.scopes[id]), move |scope| {
            scope.parent.map(|id| &self.scopes[id])
        })
    }

    pub fn register_cte(&mut self, table: Table) {
        let id = match self.current {
            Some(id) => id,
            None => self.push(),
        };
        self.scopes[id].ctes.push(table);
    }

    /// Whether the innermost scope already defines a CTE named `name`.
    pub fn defines_cte(&self, name: &str) -> bool {
        self.current.is_some_and(|id| {
            self.scopes[id]
                .ctes
                .iter()
                .any(|t| t.name.eq_ignore_ascii_case(name))
        })
    }

    /// CTEs shadow schema tables; inner CTEs shadow outer ones.
    pub fn lookup_table(&self, name: &str) -> Option<Table> {
        for scope in self.chain() {
            if let Some(table) = scope
                .ctes
                .iter()
                .rev()
                .find(|t| t.name.eq_ignore_ascii_case(name))
            {
                return Some(table.clone());
            }
        }
        find_table(self.schema, name).cloned()
    }

    /// Resolves every relation in the core's FROM clause and joins, then
    /// pushes a scope holding them.
    pub fn push_select(&mut self, select: &SelectQuery) -> Result<ScopeId> {
        let mut relations: Vec<Relation> = Vec::new();
        let refs = select
            .from
            .iter()
            .chain(select.joins.iter().map(|join| &join.table));
        for table_ref in refs {
            let relation = self.resolve_relation(table_ref)?;
            if relations
                .iter()
                .any(|r| r.name.eq_ignore_ascii_case(&relation.name))
            {
                return Err(AnalyzeError::DuplicateRelation(relation.name));
            }
            relations.push(relation);
        }

        let id = self.push();
        self.scopes[id].relations = relations;
        Ok(id)
    }

    /// Pushes a scope holding the target of an INSERT, UPDATE or DELETE so
    /// that correlated subqueries can see it. Unknown targets yield an
    /// empty scope.
    pub fn push_dml(&mut self, target: &TableRef) -> ScopeId {
        let relation = match target {
            TableRef::Table { name, .. } => self.lookup_table(name).map(|table| Relation {
                name: target.visible_name().to_string(),
                table,
            }),
            _ => None,
        };
        let id = self.push();
        self.scopes[id].relations.extend(relation);
        id
    }

    pub fn resolve_relation(&mut self, table_ref: &TableRef) -> Result<Relation> {
        let name = table_ref.visible_name().to_string();
        match table_ref {
            TableRef::Table { name: base, .. } => {
                let table = self
                    .lookup_table(base)
                    .ok_or_else(|| AnalyzeError::UnknownTable(base.clone()))?;
                Ok(Relation { name, table })
            }
            TableRef::Subquery { query, alias } => {
                let columns = self.query_columns(query, alias)?;
                Ok(Relation {
                    table: Table::derived(alias.clone(), columns),
                    name,
                })
            }
            TableRef::Function { name: function, .. } => {
                Err(AnalyzeError::UnorderableRelation(function.clone()))
            }
        }
    }

    /// The relation a CTE defines: its declared column list, or the named
    /// result columns of its body.
    pub fn cte_table(&mut self, cte: &CTE) -> Result<Table> {
        let columns = if cte.columns.is_empty() {
            self.query_columns(&cte.query, &cte.name)?
        } else {
            cte.columns.clone()
        };
        Ok(Table::derived(cte.name.clone(), columns))
    }

    /// Result column names of a query used as a relation. A compound takes
    /// its names from the head.
    pub fn query_columns(&mut self, query: &Query, relation: &str) -> Result<Vec<String>> {
        match query {
            Query::Select(select) => {
                self.push_select(select)?;
                let names = self.projection_names(&select.projections);
                self.pop();
                names?
                    .into_iter()
                    .enumerate()
                    .map(|(i, name)| {
                        name.ok_or_else(|| AnalyzeError::UnnamedResultColumn {
                            relation: relation.to_string(),
                            column: i + 1,
                        })
                    })
                    .collect()
            }
            Query::With(with) => {
                self.push();
                let columns = self.with_body_columns(with, relation);
                self.pop();
                columns
            }
            _ => Err(AnalyzeError::UnorderableRelation(relation.to_string())),
        }
    }

    fn with_body_columns(&mut self, with: &CTEQuery, relation: &str) -> Result<Vec<String>> {
        for cte in &with.ctes {
            let table = self.cte_table(cte)?;
            self.register_cte(table);
        }
        self.query_columns(&with.body, relation)
    }

    /// Names of a projection list evaluated against the innermost scope,
    /// with wildcards expanded. Computed expressions without an alias have
    /// no name.
    pub fn projection_names(&self, items: &[SelectItem]) -> Result<Vec<Option<String>>> {
        let mut names = Vec::new();
        for item in items {
            match item {
                SelectItem::Wildcard => {
                    for relation in self.relations() {
                        names.extend(relation.table.columns.iter().map(|c| Some(c.name.clone())));
                    }
                }
                SelectItem::QualifiedWildcard(qualifier) => {
                    let relation = self
                        .relations()
                        .iter()
                        .find(|r| r.name.eq_ignore_ascii_case(qualifier))
                        .ok_or_else(|| AnalyzeError::UnknownTable(qualifier.clone()))?;
                    names.extend(relation.table.columns.iter().map(|c| Some(c.name.clone())));
                }
                SelectItem::Expression {
                    alias: Some(alias), ..
                } => names.push(Some(alias.clone())),
                SelectItem::Expression {
                    expr: Expression::Column { name, .. },
                    alias: None,
                } => names.push(Some(name.clone())),
                SelectItem::Expression { alias: None, .. } => names.push(None),
            }
        }
        Ok(names)
    }

    /// Resolves a column reference, innermost scope first. A qualified
    /// reference binds to the first relation with that visible name.
    pub fn resolve_column(&self, table: Option<&str>, name: &str) -> Option<ResolvedColumn> {
        for (depth, scope) in self.chain().enumerate() {
            for relation in &scope.relations {
                let column = relation.table.column(name);
                let matched = match table {
                    Some(qualifier) => relation.name.eq_ignore_ascii_case(qualifier),
                    None => column.is_some(),
                };
                if matched {
                    return Some(ResolvedColumn {
                        depth,
                        relation: relation.name.clone(),
                        column: column.map_or_else(|| name.to_string(), |c| c.name.clone()),
                    });
                }
            }
        }
        None
    }
}
