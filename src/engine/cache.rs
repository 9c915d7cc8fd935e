//! Named caches of prepared statements and extension instances.
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::datastore::PreparedStatement;

use super::extension::InitializedExtension;

/// A cached resource that holds something to release.
pub trait Closeable: Send + Sync {
    fn close_resource(&self) -> anyhow::Result<()>;
}

impl Closeable for dyn PreparedStatement {
    fn close_resource(&self) -> anyhow::Result<()> {
        Ok(self.close()?)
    }
}

impl Closeable for dyn InitializedExtension {
    fn close_resource(&self) -> anyhow::Result<()> {
        self.close()
    }
}

pub struct ResourceCache<T: ?Sized> {
    kind: &'static str,
    entries: Mutex<BTreeMap<String, Arc<T>>>,
}

impl<T: Closeable + ?Sized> ResourceCache<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries().get(name).cloned()
    }

    /// Installs `resource` under `name`. A resource already cached under
    /// that name is removed and closed first; a failed close is logged and
    /// does not block the install.
    pub fn install(&self, name: &str, resource: Box<T>) {
        let mut entries = self.entries();
        if let Some(previous) = entries.remove(name) {
            debug!(kind = self.kind, name, "replacing cached resource");
            if let Err(err) = previous.close_resource() {
                warn!(
                    kind = self.kind,
                    name,
                    error = %format!("{err:#}"),
                    "failed to close replaced resource"
                );
            }
        }
        entries.insert(name.to_string(), Arc::from(resource));
    }

    /// Empties the cache and closes every entry, returning one message per
    /// failed close.
    pub fn drain(&self) -> Vec<String> {
        let entries = std::mem::take(&mut *self.entries());
        entries
            .into_iter()
            .filter_map(|(name, resource)| {
                resource
                    .close_resource()
                    .err()
                    .map(|err| format!("{} {}: {:#}", self.kind, name, err))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }
}
