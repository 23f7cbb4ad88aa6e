//! Module loader: resolves the `module.path` half of a dotted callback reference.
//!
//! Rust has no runtime import, so modules are declared up front as factories
//! keyed by their dotted path. A factory runs the first time its module is
//! loaded (that is the "import side effect") and the result is cached.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::reference::Callback;
use crate::domain::TaskError;

/// Something a module exposes under an attribute name.
#[derive(Clone)]
pub enum Export {
    Callable(Callback),
    /// Non-callable attribute; resolving it as a callback fails.
    Value(Value),
}

#[derive(Clone, Default)]
pub struct Module {
    exports: HashMap<String, Export>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.exports
            .insert(name.into(), Export::Callable(Arc::new(f)));
        self
    }

    pub fn export_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.exports.insert(name.into(), Export::Value(value));
        self
    }

    pub fn get(&self, attr: &str) -> Option<&Export> {
        self.exports.get(attr)
    }
}

pub trait ModuleLoader: Send + Sync {
    /// `None` when no module is known under `path`.
    fn load(&self, path: &str) -> Option<Arc<Module>>;
}

type ModuleFactory = Box<dyn Fn() -> Module + Send + Sync>;

/// Loader over a fixed table of module factories.
#[derive(Default)]
pub struct StaticModules {
    factories: HashMap<String, ModuleFactory>,
    loaded: RwLock<HashMap<String, Arc<Module>>>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module<F>(mut self, path: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Module + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Box::new(factory));
        self
    }
}

impl ModuleLoader for StaticModules {
    fn load(&self, path: &str) -> Option<Arc<Module>> {
        {
            let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(module) = loaded.get(path) {
                return Some(Arc::clone(module));
            }
        }

        let factory = self.factories.get(path)?;
        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        // 別スレッドが先に load した場合はそれを使う（factory は一度だけ）
        let module = loaded
            .entry(path.to_string())
            .or_insert_with(|| {
                tracing::debug!(module = path, "loading callback module");
                Arc::new(factory())
            });
        Some(Arc::clone(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn factory_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = StaticModules::new().module("hooks.audit", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Module::new().export_fn("record", |_, _| {})
        });

        assert!(loader.load("hooks.audit").is_some());
        assert!(loader.load("hooks.audit").is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_module_is_none() {
        let loader = StaticModules::new();
        assert!(loader.load("nope").is_none());
    }
}
