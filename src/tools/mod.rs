//! Tool trait and registry
//!
//! Tools are registered once at startup and never change afterwards.
//! The model sees them through `describe_all`.

use crate::error::OrchestrationError;
use crate::models::{JsonMap, ToolDescriptor};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod finance;

pub use finance::{create_default_registry, FinanceSnapshot};

/// A named, schema-described function the model may ask to run
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments
    fn arg_schema(&self) -> Value;

    /// Arguments arrive untyped; each tool validates its own.
    async fn execute(&self, args: &JsonMap) -> Result<JsonMap>;
}

/// Tool registry for looking up tools by name
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(OrchestrationError::DuplicateToolName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestrationError::ToolNotFound(name.to_string()))
    }

    /// Descriptors for every tool, sorted by name so prompts are stable
    pub fn describe_all(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.arg_schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

//
// ================= Argument helpers =================
//

pub(crate) fn require_str<'a>(args: &'a JsonMap, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            OrchestrationError::InvalidToolInput(format!("Missing required argument '{}'", key))
        })
}

pub(crate) fn require_f64(args: &JsonMap, key: &str) -> Result<f64> {
    optional_f64(args, key)?.ok_or_else(|| {
        OrchestrationError::InvalidToolInput(format!("Missing required argument '{}'", key))
    })
}

/// Accepts numbers and numeric strings, since models often quote numbers.
/// NaN and infinities are rejected.
pub(crate) fn optional_f64(args: &JsonMap, key: &str) -> Result<Option<f64>> {
    let raw = match args.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(raw) => raw,
    };

    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    };

    match parsed {
        Some(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(OrchestrationError::InvalidToolInput(format!(
            "Argument '{}' must be a finite number, got {}",
            key, raw
        ))),
    }
}
