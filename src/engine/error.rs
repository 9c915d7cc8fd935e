use thiserror::Error;

use crate::analyzer::AnalyzeError;
use crate::datastore::DatastoreError;
use crate::schema::SchemaError;

use super::instruction::OpCode;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown extension: {0}")]
    UnknownExtension(String),

    #[error("extension instance {0} has not been initialized")]
    UninitializedExtension(String),

    #[error("unknown prepared statement: {0}")]
    UnknownPreparedStatement(String),

    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("procedure {procedure} takes {expected} argument(s), got {got}")]
    IncorrectArgumentCount {
        procedure: String,
        expected: usize,
        got: usize,
    },

    #[error("extension returned {got} value(s) for {expected} receiver(s)")]
    ReturnCountMismatch { expected: usize, got: usize },

    #[error("invalid input: {0}")]
    InputType(String),

    #[error("procedure {0} is private and cannot be called directly")]
    ScopingViolation(String),

    #[error("statement {0} mutates state in a read-only context")]
    MutativeStatement(String),

    #[error("call depth exceeds {0}")]
    MaxStackDepth(usize),

    #[error("procedure {0} is already defined")]
    DuplicateProcedure(String),

    #[error("extension {0} is already registered")]
    DuplicateExtension(String),

    #[error(transparent)]
    Analysis(#[from] AnalyzeError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("extension failed: {0:#}")]
    Extension(anyhow::Error),

    #[error("instruction {index} ({op}) of procedure {procedure} failed")]
    Instruction {
        procedure: String,
        index: usize,
        op: OpCode,
        #[source]
        source: Box<EngineError>,
    },

    #[error("failed to release {} resource(s): {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),
}

impl EngineError {
    /// The innermost error, unwrapping instruction context added by every
    /// procedure level.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Instruction { source, .. } => source.root(),
            other => other,
        }
    }
}
