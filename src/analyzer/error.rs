use thiserror::Error;

use crate::schema::SchemaError;

/// Why a statement could not be made deterministic.
///
/// Any error aborts the whole analysis; no partially rewritten statement is
/// ever returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalyzeError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("relation name {0} is used more than once in the same scope")]
    DuplicateRelation(String),

    #[error("join would produce a cartesian product: {predicate}")]
    InvalidJoin { predicate: String },

    #[error("column {0} must appear in GROUP BY or be used in an aggregate function")]
    UngroupedColumn(String),

    #[error("SELECT DISTINCT with GROUP BY is not supported")]
    DistinctWithGroupBy,

    #[error("all result columns must be aggregates when an aggregate is used without GROUP BY")]
    MixedAggregate,

    #[error("aggregate {0} depends on input row order")]
    OrderDependentAggregate(String),

    #[error("window function {0} needs an ORDER BY in its window")]
    UnorderedWindow(String),

    #[error("result column {column} of {relation} needs a name")]
    UnnamedResultColumn { relation: String, column: usize },

    #[error("relation {0} cannot be ordered deterministically")]
    UnorderableRelation(String),

    #[error("internal analyzer error: {0}")]
    Internal(String),
}
