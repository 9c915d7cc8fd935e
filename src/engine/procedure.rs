use serde::{Deserialize, Serialize};

use super::context::is_variable;
use super::instruction::Instruction;
use super::EngineError;

/// Who may invoke a procedure as the entry point of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoping {
    #[default]
    Public,
    /// Reachable only through `procedure_call` from an executing procedure.
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    /// Variable names bound positionally to the call arguments.
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub scoping: Scoping,
    /// A view procedure always runs read-only.
    #[serde(default)]
    pub view: bool,
    #[serde(default)]
    pub body: Vec<Instruction>,
}

impl Procedure {
    pub fn new<P: Into<String>>(
        name: impl Into<String>,
        parameters: impl IntoIterator<Item = P>,
        scoping: Scoping,
        body: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            parameters: parameters.into_iter().map(Into::into).collect(),
            scoping,
            view: false,
            body,
        }
    }

    pub fn view(mut self) -> Self {
        self.view = true;
        self
    }

    pub fn is_public(&self) -> bool {
        self.scoping == Scoping::Public
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::InputType("procedure name is empty".into()));
        }
        for (i, parameter) in self.parameters.iter().enumerate() {
            if !is_variable(parameter) {
                return Err(EngineError::InputType(format!(
                    "parameter {} of procedure {} is not a variable name",
                    parameter, self.name
                )));
            }
            if self.parameters[..i].contains(parameter) {
                return Err(EngineError::InputType(format!(
                    "procedure {} declares parameter {} twice",
                    self.name, parameter
                )));
            }
        }
        Ok(())
    }
}
