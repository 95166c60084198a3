use std::collections::BTreeMap;

use sable_core::{Error, Result};
use tracing::debug;

use super::registry::GraphRegistry;

/// Named registries with one current selection.
///
/// Callers hold the set explicitly and pass the current registry into graph
/// calls. Adding or selecting a registry never touches the others, and a
/// registry lives as long as the set does.
#[derive(Debug, Default)]
pub struct RegistrySet {
    registries: BTreeMap<String, GraphRegistry>,
    current: Option<String>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registry under its configured name. The first registry added
    /// becomes current.
    pub fn add(&mut self, registry: GraphRegistry) -> Result<()> {
        let name = registry.name().to_string();
        if self.registries.contains_key(&name) {
            return Err(Error::invalid_argument(format!(
                "registry '{name}' already exists"
            )));
        }
        debug!(registry = %name, "registry added");
        if self.current.is_none() {
            self.current = Some(name.clone());
        }
        self.registries.insert(name, registry);
        Ok(())
    }

    /// Make `name` the current registry.
    pub fn select(&mut self, name: &str) -> Result<()> {
        if !self.registries.contains_key(name) {
            return Err(unknown(name));
        }
        debug!(registry = %name, "registry selected");
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Result<&GraphRegistry> {
        let name = self.current.as_deref().ok_or_else(no_current)?;
        self.get(name)
    }

    pub fn current_mut(&mut self) -> Result<&mut GraphRegistry> {
        let name = self.current.clone().ok_or_else(no_current)?;
        self.get_mut(&name)
    }

    pub fn get(&self, name: &str) -> Result<&GraphRegistry> {
        self.registries.get(name).ok_or_else(|| unknown(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut GraphRegistry> {
        self.registries.get_mut(name).ok_or_else(|| unknown(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.registries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }
}

fn unknown(name: &str) -> Error {
    Error::invalid_argument(format!("no registry named '{name}'"))
}

fn no_current() -> Error {
    Error::msg("no registry selected")
}
