//! Sequential evaluation of procedure bodies.
//!
//! Every invocation, top-level or nested, runs inside its own datastore
//! savepoint. The first failing instruction aborts the body, the guard rolls
//! the savepoint back, and the error propagates through every enclosing call
//! wrapped in the position of the instruction that failed.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::datastore::{Datastore, PreparedStatement, Savepoint, Value};

use super::cache::ResourceCache;
use super::context::{is_variable, ExecutionContext, ProcedureContext};
use super::extension::{ExtensionRegistry, InitializedExtension};
use super::instruction::{Instruction, OpCode};
use super::procedure::Procedure;
use super::EngineError;

/// Deepest permitted `procedure_call` nesting.
pub const MAX_STACK_DEPTH: usize = 1000;

/// Rolls the savepoint back when dropped without [`commit`](Self::commit).
pub struct SavepointGuard {
    savepoint: Option<Box<dyn Savepoint>>,
}

impl SavepointGuard {
    pub fn open(datastore: &dyn Datastore) -> Result<Self, EngineError> {
        Ok(Self {
            savepoint: Some(datastore.savepoint()?),
        })
    }

    pub fn commit(mut self) -> Result<(), EngineError> {
        match self.savepoint.take() {
            Some(savepoint) => Ok(savepoint.commit()?),
            None => Ok(()),
        }
    }
}

impl Drop for SavepointGuard {
    fn drop(&mut self) {
        if let Some(savepoint) = self.savepoint.take() {
            let name = savepoint.name().to_string();
            match savepoint.rollback() {
                Ok(()) => debug!(savepoint = %name, "rolled back"),
                Err(err) => warn!(savepoint = %name, %err, "failed to roll back"),
            }
        }
    }
}

/// Borrowed view of the engine state an evaluation needs.
pub struct Vm<'e> {
    pub datastore: &'e dyn Datastore,
    pub extensions: &'e ExtensionRegistry,
    pub procedures: &'e HashMap<String, Arc<Procedure>>,
    pub statements: &'e ResourceCache<dyn PreparedStatement>,
    pub instances: &'e ResourceCache<dyn InitializedExtension>,
}

impl<'e> Vm<'e> {
    /// Runs `procedure` with positional `args` at nesting level `depth`.
    pub fn invoke(
        &self,
        procedure: &Procedure,
        args: Vec<Value>,
        exec: &mut ExecutionContext,
        depth: usize,
    ) -> Result<(), EngineError> {
        if depth > MAX_STACK_DEPTH {
            return Err(EngineError::MaxStackDepth(MAX_STACK_DEPTH));
        }
        if args.len() != procedure.parameters.len() {
            return Err(EngineError::IncorrectArgumentCount {
                procedure: procedure.name.clone(),
                expected: procedure.parameters.len(),
                got: args.len(),
            });
        }

        let guard = SavepointGuard::open(self.datastore)?;
        let mutative = exec.mutative;
        if procedure.view {
            exec.mutative = false;
        }
        let result = self.run_body(procedure, args, exec, depth);
        exec.mutative = mutative;

        result?;
        guard.commit()
    }

    fn run_body(
        &self,
        procedure: &Procedure,
        args: Vec<Value>,
        exec: &mut ExecutionContext,
        depth: usize,
    ) -> Result<(), EngineError> {
        let mut ctx = ProcedureContext::new(exec, depth);
        for (parameter, value) in procedure.parameters.iter().zip(args) {
            ctx.set(parameter, value)?;
        }
        self.evaluate(&procedure.name, &procedure.body, &mut ctx)
    }

    /// Executes `body` in order, stopping at the first failure.
    pub fn evaluate(
        &self,
        procedure: &str,
        body: &[Instruction],
        ctx: &mut ProcedureContext<'_>,
    ) -> Result<(), EngineError> {
        for (index, instruction) in body.iter().enumerate() {
            debug!(
                procedure,
                index,
                op = %instruction.op,
                depth = ctx.depth(),
                "executing instruction"
            );
            self.step(instruction, ctx)
                .map_err(|source| EngineError::Instruction {
                    procedure: procedure.to_string(),
                    index,
                    op: instruction.op,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    fn step(
        &self,
        instruction: &Instruction,
        ctx: &mut ProcedureContext<'_>,
    ) -> Result<(), EngineError> {
        match instruction.op {
            OpCode::SetVariable => {
                let name = instruction.text(0)?;
                ctx.set(name, instruction.value(1)?)
            }
            OpCode::DmlPrepare => {
                let name = instruction.text(0)?;
                let statement = self.datastore.prepare(instruction.text(1)?)?;
                self.statements.install(name, statement);
                Ok(())
            }
            OpCode::DmlExecute => {
                let name = instruction.text(0)?;
                let statement = self
                    .statements
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownPreparedStatement(name.to_string()))?;
                if statement.is_mutative() && !ctx.exec().mutative {
                    return Err(EngineError::MutativeStatement(name.to_string()));
                }
                let result = statement.execute(ctx.bindings())?;
                debug!(statement = name, rows = result.rows.len(), "statement executed");
                ctx.exec_mut().last_result = Some(result);
                Ok(())
            }
            OpCode::ExtensionInitialize => {
                let extension = instruction.text(0)?;
                let instance = instruction.text(1)?;
                let initializer = self.extensions.get(extension)?;
                let config = instruction
                    .map(2)?
                    .iter()
                    .map(|(key, value)| {
                        let value = if is_variable(value) {
                            ctx.get(value)?.clone()
                        } else {
                            Value::Text(value.clone())
                        };
                        Ok((key.clone(), value))
                    })
                    .collect::<Result<BTreeMap<_, _>, EngineError>>()?;
                let initialized = initializer
                    .initialize(ctx.exec(), &config)
                    .map_err(|err| EngineError::Extension(err.context(extension.to_string())))?;
                self.instances.install(instance, initialized);
                Ok(())
            }
            OpCode::ExtensionExecute => {
                let instance = instruction.text(0)?;
                let method = instruction.text(1)?;
                let receivers = instruction.list(3)?;
                let extension = self
                    .instances
                    .get(instance)
                    .ok_or_else(|| EngineError::UninitializedExtension(instance.to_string()))?;
                let args = ctx.resolve(instruction.list(2)?)?;
                let results = extension
                    .execute(ctx.exec(), method, &args)
                    .map_err(|err| {
                        EngineError::Extension(err.context(format!("{instance}.{method}")))
                    })?;
                if results.len() != receivers.len() {
                    return Err(EngineError::ReturnCountMismatch {
                        expected: receivers.len(),
                        got: results.len(),
                    });
                }
                for (receiver, value) in receivers.iter().zip(results) {
                    ctx.set(receiver, value)?;
                }
                Ok(())
            }
            OpCode::ProcedureCall => {
                let name = instruction.text(0)?;
                let callee = self
                    .procedures
                    .get(name)
                    .ok_or_else(|| EngineError::UnknownProcedure(name.to_string()))?;
                let args = ctx.resolve(instruction.list(1)?)?;
                let depth = ctx.depth() + 1;
                self.invoke(callee, args, ctx.exec_mut(), depth)
            }
        }
    }
}
