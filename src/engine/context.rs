use crate::datastore::{Bindings, ResultSet, Value};

use super::EngineError;

/// Whether `name` is a variable name: a `$` (parameter or local), `@`
/// (contextual) or `!` (load-time) sigil followed by at least one character.
pub fn is_variable(name: &str) -> bool {
    name.len() >= 2 && name.starts_with(['$', '@', '!'])
}

/// State of one top-level invocation, shared by every nested call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub caller: String,
    /// The procedure requested by the caller.
    pub action: String,
    pub dataset: String,
    /// Whether mutating statements may run.
    pub mutative: bool,
    pub last_result: Option<ResultSet>,
}

impl ExecutionContext {
    pub fn new(
        caller: impl Into<String>,
        action: impl Into<String>,
        dataset: impl Into<String>,
        mutative: bool,
    ) -> Self {
        Self {
            caller: caller.into(),
            action: action.into(),
            dataset: dataset.into(),
            mutative,
            last_result: None,
        }
    }
}

/// Variable bindings of one procedure invocation.
pub struct ProcedureContext<'e> {
    exec: &'e mut ExecutionContext,
    values: Bindings,
    depth: usize,
}

impl<'e> ProcedureContext<'e> {
    /// A fresh scope seeded with `@caller`, `@action` and `@dataset`.
    pub fn new(exec: &'e mut ExecutionContext, depth: usize) -> Self {
        let values = Bindings::from([
            ("@caller".to_string(), Value::Text(exec.caller.clone())),
            ("@action".to_string(), Value::Text(exec.action.clone())),
            ("@dataset".to_string(), Value::Text(exec.dataset.clone())),
        ]);
        Self {
            exec,
            values,
            depth,
        }
    }

    pub fn exec(&self) -> &ExecutionContext {
        self.exec
    }

    pub fn exec_mut(&mut self) -> &mut ExecutionContext {
        self.exec
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn set(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        if !is_variable(name) {
            return Err(EngineError::InputType(format!(
                "{} is not a variable name",
                name
            )));
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Value, EngineError> {
        self.values
            .get(name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))
    }

    /// Resolves a list of variable names to their values.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Value>, EngineError> {
        names.iter().map(|n| self.get(n).cloned()).collect()
    }

    pub fn bindings(&self) -> &Bindings {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_variable() {
        assert!(is_variable("$a"));
        assert!(is_variable("@caller"));
        assert!(is_variable("!address"));
        assert!(!is_variable("$"));
        assert!(!is_variable("name"));
        assert!(!is_variable(""));
    }

    #[test]
    fn test_contextual_variables_seeded() {
        let mut exec = ExecutionContext::new("0xabc", "transfer", "bank", true);
        let ctx = ProcedureContext::new(&mut exec, 0);
        assert_eq!(ctx.get("@caller").unwrap(), &Value::from("0xabc"));
        assert_eq!(ctx.get("@action").unwrap(), &Value::from("transfer"));
        assert_eq!(ctx.get("@dataset").unwrap(), &Value::from("bank"));
    }

    #[test]
    fn test_set_and_resolve() {
        let mut exec = ExecutionContext::default();
        let mut ctx = ProcedureContext::new(&mut exec, 3);
        ctx.set("$amount", Value::from(5)).unwrap();
        assert_eq!(ctx.depth(), 3);
        assert_eq!(
            ctx.resolve(&["$amount".to_string(), "@caller".to_string()])
                .unwrap(),
            vec![Value::from(5), Value::from("")]
        );
        assert!(matches!(
            ctx.resolve(&["$missing".to_string()]),
            Err(EngineError::UnknownVariable(name)) if name == "$missing"
        ));
        assert!(matches!(
            ctx.set("plain", Value::Null),
            Err(EngineError::InputType(_))
        ));
    }

    #[test]
    fn test_nested_context_shares_execution_state() {
        let mut exec = ExecutionContext::new("me", "outer", "", true);
        {
            let mut outer = ProcedureContext::new(&mut exec, 0);
            outer.set("$x", Value::from(1)).unwrap();
            let inner = ProcedureContext::new(outer.exec_mut(), 1);
            assert!(inner.get("$x").is_err());
            assert_eq!(inner.get("@caller").unwrap(), &Value::from("me"));
        }
        exec.last_result = Some(ResultSet::default());
        assert!(exec.last_result.is_some());
    }
}
