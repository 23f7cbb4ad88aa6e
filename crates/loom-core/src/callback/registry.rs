//! CallbackRegistry - name → callable の表と、文字列参照の解決
//!
//! Worker の境界を越えるのは名前だけなので、実行時にここで callable に戻す。
//!
//! # 使用例
//! ```ignore
//! let registry = CallbackRegistry::new();
//! registry.register_fn("notify", |result, _| println!("{result:?}"))?;
//!
//! let hook = registry.resolve(&CallbackRef::named("notify"))?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::loader::{Export, ModuleLoader, StaticModules};
use super::reference::{Callback, CallbackRef};
use crate::domain::{CallbackError, TaskError};

/// Process-wide hook table. Build one at startup and share it as `Arc`.
///
/// - 同名の再登録は上書き（後勝ち）
/// - 削除はサポートしない
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Callback>>,
    loader: Arc<dyn ModuleLoader>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::with_loader(Arc::new(StaticModules::new()))
    }

    pub fn with_loader(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            loader,
        }
    }

    /// Register `callback` under `name`. Overwrites an existing entry.
    pub fn register(&self, name: &str, callback: Callback) -> Result<(), CallbackError> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(CallbackError::DuplicateOrInvalidCallback(name.to_string()));
        }
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if callbacks.insert(name.to_string(), callback).is_some() {
            tracing::debug!(callback = name, "callback re-registered, previous entry replaced");
        }
        Ok(())
    }

    pub fn register_fn<F>(&self, name: &str, f: F) -> Result<(), CallbackError>
    where
        F: Fn(Option<&Value>, Option<&TaskError>) + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Turn a reference into a callable.
    ///
    /// `Absent` resolves to `None` (no-op hook).
    pub fn resolve(&self, reference: &CallbackRef) -> Result<Option<Callback>, CallbackError> {
        match reference {
            CallbackRef::Absent => Ok(None),
            CallbackRef::Direct(callback) => Ok(Some(Arc::clone(callback))),
            CallbackRef::Named(name) => self.resolve_name(name).map(Some),
        }
    }

    /// Resolve a hook given as raw JSON (`null` or a string).
    pub fn resolve_value(&self, value: &Value) -> Result<Option<Callback>, CallbackError> {
        let reference = CallbackRef::try_from(value)?;
        self.resolve(&reference)
    }

    fn resolve_name(&self, name: &str) -> Result<Callback, CallbackError> {
        {
            let callbacks = self
                .callbacks
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(callback) = callbacks.get(name) {
                return Ok(Arc::clone(callback));
            }
        }

        let fail = |reason: String| CallbackError::Resolution {
            reference: name.to_string(),
            reason,
        };

        let (module_path, attr) = name
            .rsplit_once('.')
            .ok_or_else(|| fail("not registered and not a dotted path".into()))?;
        if module_path.is_empty() || attr.is_empty() {
            return Err(fail("malformed dotted path".into()));
        }

        let module = self
            .loader
            .load(module_path)
            .ok_or_else(|| fail(format!("module '{module_path}' cannot be loaded")))?;
        match module.get(attr) {
            Some(Export::Callable(callback)) => Ok(Arc::clone(callback)),
            Some(Export::Value(_)) => Err(fail(format!(
                "attribute '{attr}' of '{module_path}' is not callable"
            ))),
            None => Err(fail(format!(
                "module '{module_path}' has no attribute '{attr}'"
            ))),
        }
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
