//! Workflow router.
//!
//! Maps the ordered list of function names from the workflow to positions so
//! handshakes can be validated and the pipeline stages derived. The router is
//! built once and only read afterwards.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One step of the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct App {
    pub name: String,
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Ordered workflow with constant-time name lookup.
#[derive(Debug)]
pub struct Router {
    functions: Vec<App>,
    positions: DashMap<String, usize>,
}

impl Router {
    /// Build a router from the workflow order. For duplicate names the first
    /// position wins.
    pub fn new(functions: impl IntoIterator<Item = App>) -> Self {
        let functions: Vec<App> = functions.into_iter().collect();
        let positions = DashMap::with_capacity(functions.len());
        for (index, app) in functions.iter().enumerate() {
            positions.entry(app.name.clone()).or_insert(index);
        }
        Self { functions, positions }
    }

    /// Whether `name` is part of the workflow.
    pub fn exists(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Every function after `current` in workflow order. Empty if `current`
    /// is unknown or the last step.
    pub fn forward_routes(&self, current: &str) -> Vec<App> {
        match self.positions.get(current) {
            Some(position) => self.functions[*position + 1..].to_vec(),
            None => Vec::new(),
        }
    }

    /// The workflow in order.
    pub fn functions(&self) -> &[App] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
