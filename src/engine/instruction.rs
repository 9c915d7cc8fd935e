//! The six-opcode instruction set procedures are written in.
//!
//! Instructions are plain data and (de)serialize as
//! `{ op = "dml_prepare", args = ["stmt", "SELECT ..."] }`. Argument shapes
//! are only checked when the VM executes the instruction.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analyzer::{apply_rules, AnalyzeError, Rules};
use crate::datastore::Value;
use crate::schema::Table;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpCode {
    /// `[name, value]`
    SetVariable,
    /// `[statement, sql]`
    DmlPrepare,
    /// `[statement]`
    DmlExecute,
    /// `[extension, instance, {key = value-or-variable}]`
    ExtensionInitialize,
    /// `[instance, method, [argument variables], [receiver variables]]`
    ExtensionExecute,
    /// `[procedure, [argument variables]]`
    ProcedureCall,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::SetVariable => "set_variable",
            OpCode::DmlPrepare => "dml_prepare",
            OpCode::DmlExecute => "dml_execute",
            OpCode::ExtensionInitialize => "extension_initialize",
            OpCode::ExtensionExecute => "extension_execute",
            OpCode::ProcedureCall => "procedure_call",
        };
        f.write_str(name)
    }
}

/// One instruction argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
    Value(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    #[serde(default)]
    pub args: Vec<Arg>,
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl Instruction {
    pub fn new(op: OpCode, args: Vec<Arg>) -> Self {
        Self { op, args }
    }

    pub fn set_variable(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            OpCode::SetVariable,
            vec![Arg::Text(name.into()), Arg::Value(value.into())],
        )
    }

    pub fn dml_prepare(statement: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(
            OpCode::DmlPrepare,
            vec![Arg::Text(statement.into()), Arg::Text(sql.into())],
        )
    }

    /// A `dml_prepare` whose SQL has been rewritten by the determinism
    /// analyzer against `tables`.
    pub fn analyzed_dml_prepare(
        statement: impl Into<String>,
        sql: &str,
        rules: Rules,
        tables: &[Table],
    ) -> Result<Self, AnalyzeError> {
        let analyzed = apply_rules(sql, rules, tables)?;
        Ok(Self::dml_prepare(statement, analyzed.statement))
    }

    pub fn dml_execute(statement: impl Into<String>) -> Self {
        Self::new(OpCode::DmlExecute, vec![Arg::Text(statement.into())])
    }

    pub fn extension_initialize<K, V>(
        extension: impl Into<String>,
        instance: impl Into<String>,
        config: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let config = config
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(
            OpCode::ExtensionInitialize,
            vec![
                Arg::Text(extension.into()),
                Arg::Text(instance.into()),
                Arg::Map(config),
            ],
        )
    }

    pub fn extension_execute<A, R>(
        instance: impl Into<String>,
        method: impl Into<String>,
        args: impl IntoIterator<Item = A>,
        returns: impl IntoIterator<Item = R>,
    ) -> Self
    where
        A: Into<String>,
        R: Into<String>,
    {
        Self::new(
            OpCode::ExtensionExecute,
            vec![
                Arg::Text(instance.into()),
                Arg::Text(method.into()),
                Arg::List(strings(args)),
                Arg::List(strings(returns)),
            ],
        )
    }

    pub fn procedure_call<A: Into<String>>(
        procedure: impl Into<String>,
        args: impl IntoIterator<Item = A>,
    ) -> Self {
        Self::new(
            OpCode::ProcedureCall,
            vec![Arg::Text(procedure.into()), Arg::List(strings(args))],
        )
    }

    fn arg(&self, index: usize) -> Result<&Arg, EngineError> {
        self.args.get(index).ok_or_else(|| {
            EngineError::InputType(format!(
                "{} expects argument {}, got {} argument(s)",
                self.op,
                index,
                self.args.len()
            ))
        })
    }

    fn mismatch(&self, index: usize, expected: &str) -> EngineError {
        EngineError::InputType(format!(
            "{} argument {} must be {}",
            self.op, index, expected
        ))
    }

    pub(crate) fn text(&self, index: usize) -> Result<&str, EngineError> {
        match self.arg(index)? {
            Arg::Text(s) | Arg::Value(Value::Text(s)) => Ok(s.as_str()),
            _ => Err(self.mismatch(index, "a string")),
        }
    }

    pub(crate) fn value(&self, index: usize) -> Result<Value, EngineError> {
        match self.arg(index)? {
            Arg::Text(s) => Ok(Value::Text(s.clone())),
            Arg::Value(v) => Ok(v.clone()),
            _ => Err(self.mismatch(index, "a scalar value")),
        }
    }

    pub(crate) fn list(&self, index: usize) -> Result<&[String], EngineError> {
        match self.arg(index)? {
            Arg::List(items) => Ok(items.as_slice()),
            // An empty TOML/JSON table is an acceptable empty list.
            Arg::Map(map) if map.is_empty() => Ok(&[][..]),
            _ => Err(self.mismatch(index, "a list of variable names")),
        }
    }

    pub(crate) fn map(&self, index: usize) -> Result<&BTreeMap<String, String>, EngineError> {
        match self.arg(index)? {
            Arg::Map(map) => Ok(map),
            _ => Err(self.mismatch(index, "a table of strings")),
        }
    }
}
