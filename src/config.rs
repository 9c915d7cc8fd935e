//! Engine definition file.
//!
//! ```toml
//! database = "state.db"          # omit for an in-memory datastore
//! rules = ["all"]
//!
//! [[tables]]
//! name = "accounts"
//! columns = [{ name = "id", data_type = "integer", attributes = ["primary_key"] }]
//!
//! [[procedures]]
//! name = "balance"
//! parameters = ["$id"]
//! view = true
//! body = [
//!     { op = "dml_prepare", args = ["get", "SELECT balance FROM accounts WHERE id = $id"] },
//!     { op = "dml_execute", args = ["get"] },
//! ]
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analyzer::{apply_rules, Rules};
use crate::datastore::{Datastore, SqliteDatastore};
use crate::engine::{Arg, Engine, EngineOpts, ExtensionRegistry, Instruction, OpCode, Procedure};
use crate::schema::Table;

fn default_rules() -> Rules {
    Rules::ALL
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file, relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    /// Rules applied to every `dml_prepare` statement before it reaches the
    /// datastore.
    #[serde(default = "default_rules")]
    pub rules: Rules,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub procedures: Vec<Procedure>,
    #[serde(default)]
    pub load: Vec<Instruction>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            rules: default_rules(),
            tables: vec![],
            procedures: vec![],
            load: vec![],
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("detsql")
            .join("engine.toml")
    }

    /// Reads `path`, or the default location when `path` is `None`. A
    /// missing default file yields an empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::default_path();
                if !path.exists() {
                    debug!(path = %path.display(), "no engine config, using defaults");
                    return Ok(Self::default());
                }
                path
            }
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rewrites the SQL of every `dml_prepare` in `body` under the
    /// configured rules.
    fn analyze_body(&self, owner: &str, body: &[Instruction]) -> Result<Vec<Instruction>> {
        let mut analyzed = body.to_vec();
        if self.rules.is_empty() {
            return Ok(analyzed);
        }
        for (index, instruction) in analyzed.iter_mut().enumerate() {
            if instruction.op != OpCode::DmlPrepare {
                continue;
            }
            let sql = instruction
                .text(1)
                .with_context(|| format!("instruction {} of {}", index, owner))?;
            let statement = apply_rules(sql, self.rules, &self.tables)
                .with_context(|| format!("instruction {} of {}: {}", index, owner, sql))?
                .statement;
            instruction.args[1] = Arg::Text(statement);
        }
        Ok(analyzed)
    }

    /// Engine options with every statement analyzed.
    pub fn engine_opts(&self, extensions: ExtensionRegistry) -> Result<EngineOpts> {
        let procedures = self
            .procedures
            .iter()
            .map(|procedure| {
                Ok(Procedure {
                    body: self.analyze_body(&procedure.name, &procedure.body)?,
                    ..procedure.clone()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EngineOpts {
            extensions,
            procedures,
            tables: self.tables.clone(),
            load: self.analyze_body("load", &self.load)?,
        })
    }

    pub fn open_datastore(&self) -> Result<SqliteDatastore> {
        match &self.database {
            Some(path) => SqliteDatastore::open(path)
                .with_context(|| format!("failed to open {}", path.display())),
            None => Ok(SqliteDatastore::open_in_memory()?),
        }
    }

    pub fn build(&self, extensions: ExtensionRegistry) -> Result<Engine> {
        let datastore: Arc<dyn Datastore> = Arc::new(self.open_datastore()?);
        Ok(Engine::new(datastore, self.engine_opts(extensions)?)?)
    }
}
