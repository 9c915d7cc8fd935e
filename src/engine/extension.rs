//! Extensions: named plugins a procedure initializes into instances and
//! then calls methods on.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::datastore::Value;

use super::context::ExecutionContext;
use super::EngineError;

/// Creates extension instances from a resolved configuration.
pub trait Initializer: Send + Sync {
    fn initialize(
        &self,
        ctx: &ExecutionContext,
        config: &BTreeMap<String, Value>,
    ) -> anyhow::Result<Box<dyn InitializedExtension>>;
}

pub trait InitializedExtension: Send + Sync {
    /// Runs `method`, returning one value per receiver variable.
    fn execute(
        &self,
        ctx: &ExecutionContext,
        method: &str,
        args: &[Value],
    ) -> anyhow::Result<Vec<Value>>;

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Initializers available to an engine, keyed by extension name.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    initializers: BTreeMap<String, Arc<dyn Initializer>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        initializer: impl Initializer + 'static,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.initializers.contains_key(&name) {
            return Err(EngineError::DuplicateExtension(name));
        }
        self.initializers.insert(name, Arc::new(initializer));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(
        mut self,
        name: impl Into<String>,
        initializer: impl Initializer + 'static,
    ) -> Result<Self, EngineError> {
        self.register(name, initializer)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Initializer>, EngineError> {
        self.initializers
            .get(name)
            .ok_or_else(|| EngineError::UnknownExtension(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.initializers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.initializers.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
