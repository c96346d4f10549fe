//! Per-session extension managers, constructed lazily from a factory map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::session::Session;

pub type ExtensionInstance = Arc<dyn Any + Send + Sync>;
pub type ExtensionFactory = Arc<dyn Fn(&Session) -> ExtensionInstance + Send + Sync>;

#[derive(Default)]
pub struct ExtensionRegistry {
    factories: HashMap<&'static str, ExtensionFactory>,
    instances: Mutex<HashMap<&'static str, ExtensionInstance>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `key`. Only possible before the
    /// registry is handed to a session.
    pub fn register(&mut self, key: &'static str, factory: ExtensionFactory) {
        if self.factories.insert(key, factory).is_some() {
            debug!(key, "Extension factory replaced");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// The instance for `key`, built on first use. `None` when nothing is
    /// registered under `key` or the instance is not a `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str, session: &Session) -> Option<Arc<T>> {
        let (key, factory) = self.factories.get_key_value(key)?;
        let existing = self.instances.lock().ok()?.get(key).cloned();
        let instance = match existing {
            Some(instance) => instance,
            None => {
                // Built outside the lock: a factory may look up other extensions
                let created = factory(session);
                let mut instances = self.instances.lock().ok()?;
                instances.entry(*key).or_insert(created).clone()
            }
        };
        match instance.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                warn!(key, "Extension has a different type than requested");
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.clear();
        }
    }
}
