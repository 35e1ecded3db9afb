//! Tool registry, allowlist filtering, and the lazy binder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use crate::llm::ToolDefinition;
use crate::tools::tool::Tool;

/// Tools that are always bound regardless of lazy loading: the delegation
/// surface and the tool discovery entry point.
pub const CORE_TOOLS: &[&str] = &[
    "spawn_worker",
    "wait_for_worker",
    "check_worker_status",
    "search_tools",
    "get_tool_output",
    "get_current_time",
];

/// Registry mapping names to tool handlers, initialized at startup.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Pure filter over (registry, globs): keep tools whose name matches any
    /// allowlist pattern. `http_*` matches every HTTP tool; a bare name
    /// matches exactly.
    pub fn filtered(&self, allowlist: &[String]) -> ToolRegistry {
        let patterns: Vec<Regex> = allowlist.iter().filter_map(|g| compile_glob(g)).collect();
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| patterns.iter().any(|p| p.is_match(name)))
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        ToolRegistry { tools }
    }
}

fn compile_glob(glob: &str) -> Option<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 4);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// Holds the subset of tools currently bound to the model and grows it on
/// demand. The engine rebinds the model whenever the subset changed.
pub struct LazyToolBinder {
    registry: Arc<ToolRegistry>,
    loaded: HashSet<String>,
    rebind_needed: bool,
    lazy: bool,
}

impl LazyToolBinder {
    /// Eager binder: everything in the registry is bound up front.
    pub fn eager(registry: Arc<ToolRegistry>) -> Self {
        let loaded = registry.names().into_iter().collect();
        Self {
            registry,
            loaded,
            rebind_needed: false,
            lazy: false,
        }
    }

    /// Lazy binder: only core tools are bound initially; the rest load via
    /// `search_tools`.
    pub fn lazy(registry: Arc<ToolRegistry>) -> Self {
        let loaded = registry
            .names()
            .into_iter()
            .filter(|n| CORE_TOOLS.contains(&n.as_str()))
            .collect();
        Self {
            registry,
            loaded,
            rebind_needed: false,
            lazy: true,
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Definitions for the currently bound subset.
    pub fn bound_definitions(&self) -> Vec<ToolDefinition> {
        self.registry
            .definitions()
            .into_iter()
            .filter(|d| self.loaded.contains(&d.name))
            .collect()
    }

    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.iter().cloned().collect();
        names.sort();
        names
    }

    /// Execution lookup. Uses the full registry: a tool discovered this turn
    /// is callable even before the next rebind.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// Load tools into the bound set; returns the names actually added.
    pub fn load_tools(&mut self, names: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for name in names {
            if self.registry.get(name).is_some() && self.loaded.insert(name.clone()) {
                added.push(name.clone());
            }
        }
        if !added.is_empty() {
            self.rebind_needed = true;
        }
        added
    }

    pub fn needs_rebind(&self) -> bool {
        self.rebind_needed
    }

    pub fn clear_rebind_flag(&mut self) {
        self.rebind_needed = false;
    }

    /// Catalog text for prompt injection: name and description of every
    /// registered tool not already bound.
    pub fn catalog_for_prompt(&self) -> String {
        let mut lines = Vec::new();
        for def in self.registry.definitions() {
            if self.loaded.contains(&def.name) {
                continue;
            }
            lines.push(format!("- `{}`: {}", def.name, def.description));
        }
        lines.join("\n")
    }
}
