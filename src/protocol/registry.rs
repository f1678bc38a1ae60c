//! Lookup of command types by name and by numeric code.

use std::collections::HashMap;
use std::sync::Arc;

use super::catalog;
use super::command::CommandType;
use crate::error::{GearmanError, Result};

/// Table of known command types.
///
/// Built once and shared read-only between a connection's decoder and the
/// participant that builds outgoing commands.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    by_name: HashMap<&'static str, &'static CommandType>,
    by_code: HashMap<u32, &'static CommandType>,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the full protocol catalog.
    pub fn with_catalog() -> Self {
        let mut registry = Self::new();
        for command_type in catalog::ALL.iter().copied() {
            registry.register(command_type);
        }
        registry
    }

    /// Shared registry with the full catalog.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::with_catalog())
    }

    /// Add a command type, replacing any type with the same name or code.
    pub fn register(&mut self, command_type: &'static CommandType) {
        self.by_name.insert(command_type.name, command_type);
        self.by_code.insert(command_type.code, command_type);
    }

    /// Look up a command type by protocol name.
    pub fn by_name(&self, name: &str) -> Result<&'static CommandType> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| GearmanError::UnknownCommand(name.to_string()))
    }

    /// Look up a command type by numeric code.
    pub fn by_code(&self, code: u32) -> Result<&'static CommandType> {
        self.by_code
            .get(&code)
            .copied()
            .ok_or_else(|| GearmanError::UnknownCommand(code.to_string()))
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Check whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_lookup() {
        let registry = CommandRegistry::with_catalog();
        assert_eq!(registry.len(), catalog::ALL.len());

        let by_name = registry.by_name("JOB_ASSIGN_UNIQ").unwrap();
        let by_code = registry.by_code(31).unwrap();
        assert_eq!(by_name, by_code);
        assert_eq!(by_name.arguments.len(), 4);
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = CommandRegistry::with_catalog();
        assert!(matches!(
            registry.by_code(5),
            Err(GearmanError::UnknownCommand(code)) if code == "5"
        ));
        assert!(registry.by_name("SUBMIT_REDUCE_JOB").is_err());
        assert!(CommandRegistry::new().is_empty());
    }
}
