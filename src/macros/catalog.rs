//! Registry of macro definitions.

use super::MacroBody;
use crate::error::{MacroError, MacroResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Creates a fresh body for every invocation.
pub type MacroFactory = Arc<dyn Fn() -> Box<dyn MacroBody> + Send + Sync>;

/// A registered macro.
#[derive(Clone)]
pub struct MacroDefinition {
    pub name: String,
    pub description: String,
    /// Environment variables that must be defined before the macro runs
    pub env: Vec<String>,
    factory: MacroFactory,
}

impl std::fmt::Debug for MacroDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacroDefinition")
            .field("name", &self.name)
            .field("env", &self.env)
            .finish()
    }
}

impl MacroDefinition {
    /// New body instance
    pub fn instantiate(&self) -> Box<dyn MacroBody> {
        (self.factory)()
    }
}

/// Name-indexed macro definitions.
#[derive(Debug, Default, Clone)]
pub struct MacroCatalog {
    macros: BTreeMap<String, MacroDefinition>,
}

impl MacroCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the builtin and scan macros
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        super::builtin::register(&mut catalog);
        crate::scan::macros::register(&mut catalog);
        catalog
    }

    /// Register (or replace) a macro.
    pub fn register<F>(&mut self, name: &str, description: &str, env: &[&str], factory: F)
    where
        F: Fn() -> Box<dyn MacroBody> + Send + Sync + 'static,
    {
        self.macros.insert(
            name.to_string(),
            MacroDefinition {
                name: name.to_string(),
                description: description.to_string(),
                env: env.iter().map(|e| e.to_string()).collect(),
                factory: Arc::new(factory),
            },
        );
    }

    /// Definition of `name`
    pub fn get(&self, name: &str) -> MacroResult<&MacroDefinition> {
        self.macros
            .get(name)
            .ok_or_else(|| MacroError::UnknownMacro(name.to_string()))
    }

    /// Sorted macro names
    pub fn names(&self) -> Vec<&str> {
        self.macros.keys().map(String::as_str).collect()
    }

    /// All definitions, sorted by name
    pub fn definitions(&self) -> impl Iterator<Item = &MacroDefinition> {
        self.macros.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let catalog = MacroCatalog::with_builtins();
        for name in ["mv", "ct", "wait", "ascan", "a2scan", "dscan", "ascanc", "ascanct", "timescan"] {
            assert!(catalog.get(name).is_ok(), "{} missing", name);
        }
        assert!(matches!(
            catalog.get("nope"),
            Err(MacroError::UnknownMacro(_))
        ));
        assert_eq!(catalog.get("ascan").unwrap().env, vec!["ActiveMntGrp".to_string()]);
    }
}
