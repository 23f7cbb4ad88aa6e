//! Callback - success/failure hook の参照と解決
//!
//! - **reference**: `CallbackRef`（Absent / Direct / Named）
//! - **registry**: `CallbackRegistry`（名前表 + dotted path 解決）
//! - **loader**: `ModuleLoader`（dotted path の module 部分）

pub mod loader;
pub mod reference;
pub mod registry;

pub use self::loader::{Export, Module, ModuleLoader, StaticModules};
pub use self::reference::{Callback, CallbackRef};
pub use self::registry::CallbackRegistry;
