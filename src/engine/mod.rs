//! Atomic execution of stored procedures.
//!
//! ```text
//!   execute_procedure(name, args)
//!        │ scoping check
//!        ▼
//!   Vm::invoke ── savepoint ──► instruction 0 .. n ──► commit
//!        │                         │ procedure_call
//!        │                         ▼
//!        │                      Vm::invoke (nested savepoint)
//!        └── any failure ──► rollback, EngineError::Instruction
//! ```
//!
//! Prepared statements and extension instances live in engine-wide caches,
//! so a statement prepared by the load list is visible to every procedure.
//!
//! Top-level work runs one invocation at a time. Savepoints opened on a
//! shared connection nest, so two interleaved invocations would otherwise
//! share a rollback scope. An extension must not wait on another top-level
//! invocation of the same engine.
pub mod cache;
pub mod context;
pub mod error;
pub mod extension;
pub mod instruction;
pub mod procedure;
pub mod vm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use tracing::info;

use crate::analyzer::{apply_rules, AnalyzedStatement, Rules};
use crate::datastore::{Bindings, Datastore, PreparedStatement, ResultSet, Value};
use crate::schema::{find_table, SchemaError, Table};

use cache::ResourceCache;
use context::{ExecutionContext, ProcedureContext};
use extension::InitializedExtension;
use vm::{SavepointGuard, Vm};

pub use error::EngineError;
pub use extension::{ExtensionRegistry, Initializer};
pub use instruction::{Arg, Instruction, OpCode};
pub use procedure::{Procedure, Scoping};
pub use vm::MAX_STACK_DEPTH;

/// Everything an engine is built from.
#[derive(Debug, Default)]
pub struct EngineOpts {
    pub extensions: ExtensionRegistry,
    pub procedures: Vec<Procedure>,
    pub tables: Vec<Table>,
    /// Run once, inside its own savepoint, when the engine is built.
    pub load: Vec<Instruction>,
}

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub caller: String,
    pub dataset: String,
    pub read_only: bool,
}

impl ExecutionOptions {
    pub fn caller(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

pub struct Engine {
    datastore: Arc<dyn Datastore>,
    extensions: ExtensionRegistry,
    procedures: RwLock<HashMap<String, Arc<Procedure>>>,
    tables: RwLock<Vec<Table>>,
    statements: ResourceCache<dyn PreparedStatement>,
    instances: ResourceCache<dyn InitializedExtension>,
    /// Held for the whole of each top-level savepoint.
    serial: Mutex<()>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(datastore: Arc<dyn Datastore>, opts: EngineOpts) -> Result<Self, EngineError> {
        let mut procedures = HashMap::new();
        for procedure in opts.procedures {
            procedure.validate()?;
            if procedures.contains_key(&procedure.name) {
                return Err(EngineError::DuplicateProcedure(procedure.name));
            }
            procedures.insert(procedure.name.clone(), Arc::new(procedure));
        }

        let mut tables: Vec<Table> = Vec::with_capacity(opts.tables.len());
        for table in opts.tables {
            table.validate()?;
            if find_table(&tables, &table.name).is_some() {
                return Err(SchemaError::DuplicateTable(table.name).into());
            }
            tables.push(table);
        }

        let engine = Self {
            datastore,
            extensions: opts.extensions,
            procedures: RwLock::new(procedures),
            tables: RwLock::new(vec![]),
            statements: ResourceCache::new("statement"),
            instances: ResourceCache::new("instance"),
            serial: Mutex::new(()),
        };

        let guard = SavepointGuard::open(engine.datastore.as_ref())?;
        for table in &tables {
            engine.create_table(table)?;
        }
        {
            let procedures = read(&engine.procedures);
            let mut exec = ExecutionContext::new("", "load", "", true);
            let mut ctx = ProcedureContext::new(&mut exec, 0);
            engine.vm(&procedures).evaluate("load", &opts.load, &mut ctx)?;
        }
        guard.commit()?;

        info!(
            procedures = read(&engine.procedures).len(),
            tables = tables.len(),
            extensions = engine.extensions.names().count(),
            load = opts.load.len(),
            "engine ready"
        );
        *engine.tables.write().unwrap_or_else(PoisonError::into_inner) = tables;
        Ok(engine)
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn vm<'e>(&'e self, procedures: &'e HashMap<String, Arc<Procedure>>) -> Vm<'e> {
        Vm {
            datastore: self.datastore.as_ref(),
            extensions: &self.extensions,
            procedures,
            statements: &self.statements,
            instances: &self.instances,
        }
    }

    fn create_table(&self, table: &Table) -> Result<(), EngineError> {
        for sql in table.create_statements() {
            let statement = self.datastore.prepare(&sql)?;
            statement.execute(&Bindings::new())?;
            statement.close()?;
        }
        Ok(())
    }

    /// Runs the public procedure `name` atomically and returns the result
    /// of the last statement it executed, if any.
    pub fn execute_procedure(
        &self,
        name: &str,
        args: Vec<Value>,
        opts: ExecutionOptions,
    ) -> Result<Option<ResultSet>, EngineError> {
        let _serial = self.serialize();
        let procedures = read(&self.procedures);
        let procedure = procedures
            .get(name)
            .ok_or_else(|| EngineError::UnknownProcedure(name.to_string()))?;
        if !procedure.is_public() {
            return Err(EngineError::ScopingViolation(name.to_string()));
        }

        let mut exec = ExecutionContext::new(opts.caller, name, opts.dataset, !opts.read_only);
        self.vm(&procedures).invoke(procedure, args, &mut exec, 0)?;
        Ok(exec.last_result)
    }

    /// Closes every cached statement and extension instance.
    pub fn close(&self) -> Result<(), EngineError> {
        let mut failures = self.statements.drain();
        failures.extend(self.instances.drain());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Close(failures))
        }
    }

    pub fn list_tables(&self) -> Vec<Table> {
        read(&self.tables).clone()
    }

    /// All procedures, sorted by name.
    pub fn list_procedures(&self) -> Vec<Arc<Procedure>> {
        let mut procedures: Vec<_> = read(&self.procedures).values().cloned().collect();
        procedures.sort_by(|a, b| a.name.cmp(&b.name));
        procedures
    }

    /// Validates `table` and creates it in the datastore.
    pub fn define_table(&self, table: Table) -> Result<(), EngineError> {
        table.validate()?;
        let _serial = self.serialize();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if find_table(&tables, &table.name).is_some() {
            return Err(SchemaError::DuplicateTable(table.name).into());
        }

        let guard = SavepointGuard::open(self.datastore.as_ref())?;
        self.create_table(&table)?;
        guard.commit()?;

        info!(table = %table.name, "table defined");
        tables.push(table);
        Ok(())
    }

    pub fn define_procedure(&self, procedure: Procedure) -> Result<(), EngineError> {
        procedure.validate()?;
        let mut procedures = self
            .procedures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if procedures.contains_key(&procedure.name) {
            return Err(EngineError::DuplicateProcedure(procedure.name));
        }
        info!(procedure = %procedure.name, "procedure defined");
        procedures.insert(procedure.name.clone(), Arc::new(procedure));
        Ok(())
    }

    /// Defines `procedure`, replacing any procedure of the same name.
    /// Returns whether one was replaced.
    pub fn redefine_procedure(&self, procedure: Procedure) -> Result<bool, EngineError> {
        procedure.validate()?;
        let mut procedures = self
            .procedures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!(procedure = %procedure.name, "procedure redefined");
        Ok(procedures
            .insert(procedure.name.clone(), Arc::new(procedure))
            .is_some())
    }

    /// Analyzes `sql` against the engine's tables.
    pub fn analyze(&self, sql: &str, rules: Rules) -> Result<AnalyzedStatement, EngineError> {
        Ok(apply_rules(sql, rules, &read(&self.tables))?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, bail};

    use super::*;
    use crate::datastore::{DatastoreError, Savepoint};

    pub type Events = Arc<Mutex<Vec<String>>>;

    fn push(events: &Events, event: String) {
        events.lock().unwrap().push(event);
    }

    /// Records every call. Executing a statement returns the bindings it
    /// saw as a single row.
    #[derive(Default)]
    pub struct MockDatastore {
        pub events: Events,
        /// When set, no statement reports itself as mutative.
        pub read_only_statements: bool,
        savepoints: AtomicU64,
    }

    impl MockDatastore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_read_only_statements() -> Self {
            Self {
                read_only_statements: true,
                ..Self::default()
            }
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Datastore for MockDatastore {
        fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DatastoreError> {
            push(&self.events, format!("prepare {}", sql));
            let upper = sql.trim_start().to_ascii_uppercase();
            let mutative = !self.read_only_statements
                && ["INSERT", "UPDATE", "DELETE", "CREATE"]
                    .iter()
                    .any(|kw| upper.starts_with(kw));
            Ok(Box::new(MockStatement {
                sql: sql.to_string(),
                mutative,
                events: Arc::clone(&self.events),
            }))
        }

        fn savepoint(&self) -> Result<Box<dyn Savepoint>, DatastoreError> {
            let name = format!("sp_{}", self.savepoints.fetch_add(1, Ordering::Relaxed));
            push(&self.events, format!("savepoint {}", name));
            Ok(Box::new(MockSavepoint {
                name,
                events: Arc::clone(&self.events),
            }))
        }
    }

    struct MockStatement {
        sql: String,
        mutative: bool,
        events: Events,
    }

    impl PreparedStatement for MockStatement {
        fn sql(&self) -> &str {
            &self.sql
        }

        fn execute(&self, bindings: &Bindings) -> Result<ResultSet, DatastoreError> {
            push(&self.events, format!("execute {}", self.sql));
            Ok(ResultSet {
                columns: bindings.keys().cloned().collect(),
                rows: vec![bindings.values().cloned().collect()],
                rows_affected: 0,
            })
        }

        fn is_mutative(&self) -> bool {
            self.mutative
        }

        fn close(&self) -> Result<(), DatastoreError> {
            push(&self.events, format!("close {}", self.sql));
            if self.sql.contains("fail_close") {
                return Err(DatastoreError::Backend("close failed".into()));
            }
            Ok(())
        }
    }

    struct MockSavepoint {
        name: String,
        events: Events,
    }

    impl Savepoint for MockSavepoint {
        fn name(&self) -> &str {
            &self.name
        }

        fn commit(self: Box<Self>) -> Result<(), DatastoreError> {
            push(&self.events, format!("commit {}", self.name));
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<(), DatastoreError> {
            push(&self.events, format!("rollback {}", self.name));
            Ok(())
        }
    }

    /// A token contract stand-in: every address holds 100.
    pub struct Erc20;

    struct Erc20Instance {
        address: String,
    }

    impl Initializer for Erc20 {
        fn initialize(
            &self,
            _ctx: &ExecutionContext,
            config: &BTreeMap<String, Value>,
        ) -> anyhow::Result<Box<dyn InitializedExtension>> {
            let address = config
                .get("address")
                .and_then(Value::as_text)
                .ok_or_else(|| anyhow!("missing address"))?;
            Ok(Box::new(Erc20Instance {
                address: address.to_string(),
            }))
        }
    }

    impl InitializedExtension for Erc20Instance {
        fn execute(
            &self,
            ctx: &ExecutionContext,
            method: &str,
            args: &[Value],
        ) -> anyhow::Result<Vec<Value>> {
            match method {
                "balanceOf" => Ok(vec![Value::Integer(100)]),
                "owner" => Ok(vec![Value::Text(self.address.clone())]),
                "caller" => Ok(vec![Value::Text(ctx.caller.clone())]),
                "echo" => Ok(args.to_vec()),
                other => bail!("unknown method {}", other),
            }
        }

        fn close(&self) -> anyhow::Result<()> {
            if self.address == "bad" {
                bail!("cannot close {}", self.address);
            }
            Ok(())
        }
    }

    pub fn extensions() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        registry
            .register("erc20", Erc20)
            .expect("fresh registry");
        registry
    }
}
