//! Table metadata shared by the analyzer and the engine.
//!
//! A table carries exactly one primary key, declared either as a single
//! column attribute or as exactly one `primary` index. Composite keys use the
//! index form.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::quote_ident;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("table {0} has no primary key")]
    MissingPrimaryKey(String),

    #[error("table {table} has more than one primary key: {reason}")]
    DuplicatePrimaryKey { table: String, reason: String },

    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("table {table} declares column {column} twice")]
    DuplicateColumn { table: String, column: String },

    #[error("table {0} has no columns")]
    NoColumns(String),

    #[error("table {0} already exists")]
    DuplicateTable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    /// Type of a derived column (CTE or subquery result) that is not tracked.
    Any,
}

impl DataType {
    pub fn sql_name(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Real => "REAL",
            DataType::Text => "TEXT",
            DataType::Blob => "BLOB",
            DataType::Boolean => "BOOLEAN",
            DataType::Any => "ANY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    PrimaryKey,
    Unique,
    NotNull,
    /// Default value, as SQL expression text.
    Default(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            attributes: vec![],
        }
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn has(&self, attribute: &Attribute) -> bool {
        self.attributes.contains(attribute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Btree,
    Unique,
    Primary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl ForeignKeyAction {
    fn sql(&self) -> &'static str {
        match self {
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::Restrict => "RESTRICT",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
            ForeignKeyAction::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub child_keys: Vec<String>,
    pub parent_table: String,
    pub parent_keys: Vec<String>,
    #[serde(default)]
    pub on_delete: Option<ForeignKeyAction>,
    #[serde(default)]
    pub on_update: Option<ForeignKeyAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// A relation derived from a CTE or subquery. Its rows are only
    /// distinguishable by their full contents, so every column is part of
    /// the key.
    pub fn derived(name: impl Into<String>, columns: Vec<String>) -> Self {
        let name = name.into();
        let index = Index {
            name: format!("{}_pk", name),
            columns: columns.clone(),
            kind: IndexKind::Primary,
        };
        Self {
            name,
            columns: columns
                .into_iter()
                .map(|c| Column::new(c, DataType::Any))
                .collect(),
            indexes: vec![index],
            foreign_keys: vec![],
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The primary key columns, in declaration order.
    pub fn primary_key(&self) -> Result<Vec<String>, SchemaError> {
        let mut from_attribute: Option<Vec<String>> = None;
        for column in &self.columns {
            if column.has(&Attribute::PrimaryKey) {
                if from_attribute.is_some() {
                    return Err(SchemaError::DuplicatePrimaryKey {
                        table: self.name.clone(),
                        reason: "multiple primary key attributes".into(),
                    });
                }
                from_attribute = Some(vec![column.name.clone()]);
            }
        }

        let mut from_index: Option<Vec<String>> = None;
        for index in self.indexes.iter().filter(|i| i.kind == IndexKind::Primary) {
            if from_index.is_some() {
                return Err(SchemaError::DuplicatePrimaryKey {
                    table: self.name.clone(),
                    reason: "multiple primary indexes".into(),
                });
            }
            from_index = Some(index.columns.clone());
        }

        match (from_attribute, from_index) {
            (Some(_), Some(_)) => Err(SchemaError::DuplicatePrimaryKey {
                table: self.name.clone(),
                reason: "both a primary key attribute and a primary index".into(),
            }),
            (None, None) => Err(SchemaError::MissingPrimaryKey(self.name.clone())),
            (Some(key), None) => Ok(key),
            (None, Some(key)) if key.is_empty() => {
                Err(SchemaError::MissingPrimaryKey(self.name.clone()))
            }
            (None, Some(key)) => {
                if let Some(missing) = key.iter().find(|name| self.column(name).is_none()) {
                    return Err(SchemaError::UnknownColumn {
                        table: self.name.clone(),
                        column: missing.clone(),
                    });
                }
                Ok(key)
            }
        }
    }

    /// Checks column uniqueness, index and foreign key column references,
    /// and the primary key invariant.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name.clone()));
        }

        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }

        let referenced = self
            .indexes
            .iter()
            .flat_map(|i| i.columns.iter())
            .chain(self.foreign_keys.iter().flat_map(|fk| fk.child_keys.iter()));
        for name in referenced {
            if self.column(name).is_none() {
                return Err(SchemaError::UnknownColumn {
                    table: self.name.clone(),
                    column: name.clone(),
                });
            }
        }

        self.primary_key().map(|_| ())
    }

    /// `CREATE TABLE` followed by one `CREATE INDEX` per non-primary index.
    pub fn create_statements(&self) -> Vec<String> {
        let mut defs: Vec<String> = self.columns.iter().map(column_definition).collect();

        for index in self.indexes.iter().filter(|i| i.kind == IndexKind::Primary) {
            defs.push(format!("PRIMARY KEY ({})", quote_list(&index.columns)));
        }

        for fk in &self.foreign_keys {
            let mut def = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_list(&fk.child_keys),
                quote_ident(&fk.parent_table),
                quote_list(&fk.parent_keys)
            );
            if let Some(action) = fk.on_delete {
                def.push_str(&format!(" ON DELETE {}", action.sql()));
            }
            if let Some(action) = fk.on_update {
                def.push_str(&format!(" ON UPDATE {}", action.sql()));
            }
            defs.push(def);
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            defs.join(", ")
        )];

        for index in self.indexes.iter().filter(|i| i.kind != IndexKind::Primary) {
            let unique = if index.kind == IndexKind::Unique {
                "UNIQUE "
            } else {
                ""
            };
            statements.push(format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                unique,
                quote_ident(&index.name),
                quote_ident(&self.name),
                quote_list(&index.columns)
            ));
        }

        statements
    }
}

fn column_definition(column: &Column) -> String {
    let mut def = format!("{} {}", quote_ident(&column.name), column.data_type.sql_name());
    for attribute in &column.attributes {
        match attribute {
            Attribute::PrimaryKey => def.push_str(" PRIMARY KEY"),
            Attribute::Unique => def.push_str(" UNIQUE"),
            Attribute::NotNull => def.push_str(" NOT NULL"),
            Attribute::Default(value) => def.push_str(&format!(" DEFAULT {}", value)),
        }
    }
    def
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Find a table by name. SQLite identifiers are case-insensitive.
pub fn find_table<'a>(tables: &'a [Table], name: &str) -> Option<&'a Table> {
    tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Table {
        Table::new(
            "users",
            vec![
                Column::new("id", DataType::Integer).with(Attribute::PrimaryKey),
                Column::new("name", DataType::Text).with(Attribute::NotNull),
            ],
        )
    }

    #[test]
    fn test_primary_key_from_attribute() {
        assert_eq!(users().primary_key().unwrap(), vec!["id".to_string()]);
    }

    #[test]
    fn test_primary_key_from_index() {
        let table = Table::new(
            "memberships",
            vec![
                Column::new("user_id", DataType::Integer),
                Column::new("group_id", DataType::Integer),
            ],
        )
        .with_index(Index {
            name: "memberships_pk".into(),
            columns: vec!["user_id".into(), "group_id".into()],
            kind: IndexKind::Primary,
        });
        assert_eq!(
            table.primary_key().unwrap(),
            vec!["user_id".to_string(), "group_id".to_string()]
        );
    }

    #[test]
    fn test_primary_key_missing() {
        let table = Table::new("t", vec![Column::new("a", DataType::Text)]);
        assert_eq!(
            table.primary_key(),
            Err(SchemaError::MissingPrimaryKey("t".into()))
        );
    }

    #[test]
    fn test_primary_key_both_forms_rejected() {
        let table = users().with_index(Index {
            name: "users_pk".into(),
            columns: vec!["id".into()],
            kind: IndexKind::Primary,
        });
        assert!(matches!(
            table.primary_key(),
            Err(SchemaError::DuplicatePrimaryKey { .. })
        ));
    }

    #[test]
    fn test_primary_key_unknown_column() {
        let table = Table::new("t", vec![Column::new("id", DataType::Integer)])
            .with_index(Index {
                name: "t_pk".into(),
                columns: vec!["ghost".into()],
                kind: IndexKind::Primary,
            });
        assert_eq!(
            table.primary_key(),
            Err(SchemaError::UnknownColumn {
                table: "t".into(),
                column: "ghost".into()
            })
        );
    }

    #[test]
    fn test_primary_key_two_attributes_rejected() {
        let table = Table::new(
            "t",
            vec![
                Column::new("a", DataType::Integer).with(Attribute::PrimaryKey),
                Column::new("b", DataType::Integer).with(Attribute::PrimaryKey),
            ],
        );
        assert!(matches!(
            table.primary_key(),
            Err(SchemaError::DuplicatePrimaryKey { .. })
        ));
    }

    #[test]
    fn test_validate_unknown_index_column() {
        let table = users().with_index(Index {
            name: "by_email".into(),
            columns: vec!["email".into()],
            kind: IndexKind::Btree,
        });
        assert_eq!(
            table.validate(),
            Err(SchemaError::UnknownColumn {
                table: "users".into(),
                column: "email".into()
            })
        );
    }

    #[test]
    fn test_validate_duplicate_column() {
        let mut table = users();
        table.columns.push(Column::new("ID", DataType::Integer));
        assert!(matches!(
            table.validate(),
            Err(SchemaError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_derived_table_keys_every_column() {
        let table = Table::derived("cte", vec!["b".into(), "a".into()]);
        assert_eq!(
            table.primary_key().unwrap(),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_create_statements() {
        let table = users()
            .with_index(Index {
                name: "users_name".into(),
                columns: vec!["name".into()],
                kind: IndexKind::Unique,
            });
        let stmts = table.create_statements();
        assert_eq!(
            stmts[0],
            r#"CREATE TABLE IF NOT EXISTS "users" ("id" INTEGER PRIMARY KEY, "name" TEXT NOT NULL)"#
        );
        assert_eq!(
            stmts[1],
            r#"CREATE UNIQUE INDEX IF NOT EXISTS "users_name" ON "users" ("name")"#
        );
    }

    #[test]
    fn test_create_statements_composite_key_and_foreign_key() {
        let mut table = Table::new(
            "posts",
            vec![
                Column::new("author", DataType::Integer),
                Column::new("slug", DataType::Text),
            ],
        )
        .with_index(Index {
            name: "posts_pk".into(),
            columns: vec!["author".into(), "slug".into()],
            kind: IndexKind::Primary,
        });
        table.foreign_keys.push(ForeignKey {
            child_keys: vec!["author".into()],
            parent_table: "users".into(),
            parent_keys: vec!["id".into()],
            on_delete: Some(ForeignKeyAction::Cascade),
            on_update: None,
        });
        let stmts = table.create_statements();
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains(r#"PRIMARY KEY ("author", "slug")"#));
        assert!(stmts[0]
            .contains(r#"FOREIGN KEY ("author") REFERENCES "users" ("id") ON DELETE CASCADE"#));
    }

    #[test]
    fn test_table_from_toml() {
        let table: Table = toml::from_str(
            r#"
            name = "users"
            [[columns]]
            name = "id"
            data_type = "integer"
            attributes = ["primary_key"]
            [[columns]]
            name = "credits"
            data_type = "integer"
            attributes = ["not_null", { default = "0" }]
            "#,
        )
        .unwrap();
        assert_eq!(table.primary_key().unwrap(), vec!["id".to_string()]);
        assert!(table.columns[1].has(&Attribute::Default("0".into())));
    }
}
