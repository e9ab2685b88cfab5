//! Tool registry and namespace visibility
//!
//! A tool is a named callable with a small schema: the argument names it
//! requires and whether it returns a single value or a keyed mapping. A
//! namespace is an allow-list of tool names; a task may execute only tools
//! visible to its namespace, checked before every dispatch. The registry is
//! read-only after startup and shared behind an `Arc`.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A tool invocation result: one value, or a mapping with enumerated keys
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Single(Value),
    Keyed(Map<String, Value>),
}

impl ToolOutput {
    /// Collapse into a plain value, objects for keyed results.
    pub fn into_value(self) -> Value {
        match self {
            ToolOutput::Single(v) => v,
            ToolOutput::Keyed(map) => Value::Object(map),
        }
    }
}

/// Failure reported by a tool handler
#[derive(Debug, Clone)]
pub struct ToolFailure {
    pub message: String,
    /// Transient failures (network hiccups, service unavailable) are
    /// eligible for a single retry.
    pub transient: bool,
    /// Set when the failure was a per-call deadline, with the deadline in
    /// seconds. Keeps the timeout error kind distinct through dispatch.
    pub timeout_seconds: Option<u64>,
}

impl ToolFailure {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            timeout_seconds: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            timeout_seconds: None,
        }
    }

    pub fn timed_out(seconds: u64) -> Self {
        Self {
            message: format!("call timed out after {}s", seconds),
            transient: true,
            timeout_seconds: Some(seconds),
        }
    }
}

/// Callable side of a tool
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, params: Map<String, Value>) -> std::result::Result<ToolOutput, ToolFailure>;
}

/// Declarative side of a tool, shown to the planner as the tool catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Argument names that must be present in `tool_params`
    pub required_params: Vec<String>,
}

#[derive(Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("spec", &self.spec).finish()
    }
}

/// Registry mapping tool names to handlers
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(spec.name.clone(), Tool { spec, handler });
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool specs visible to `namespace`, for the planner's tool catalog.
    pub fn catalog(&self, namespace: &Namespace) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| namespace.allows(&t.spec.name))
            .map(|t| t.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Resolve a tool for dispatch, enforcing namespace visibility.
    pub fn resolve(&self, name: &str, namespace: &Namespace) -> Result<&Tool> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| VmError::ToolNotFound { name: name.to_string() })?;
        if !namespace.allows(name) {
            return Err(VmError::ToolNotAllowed {
                name: name.to_string(),
                namespace: namespace.name.clone(),
            });
        }
        Ok(tool)
    }
}

/// Named allow-list of tool names constraining a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub allowed_tools: Vec<String>,
}

impl Namespace {
    pub fn new(name: impl Into<String>, allowed_tools: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            allowed_tools,
        }
    }

    /// The default namespace exposing every registered tool.
    pub fn open(registry: &ToolRegistry) -> Self {
        Self::new("default", registry.tool_names())
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }
}
