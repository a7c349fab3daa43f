//! Registry of available tools.
//!
//! Built once at startup; input schemas are compiled at registration so a
//! malformed schema fails startup instead of the first call. The registry is
//! never mutated afterwards and is shared across agents behind an `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{
    RegistryError, Tool, ToolDescriptor, ToolDiscovery, ToolError, ToolInvocation, DiscoveryEnv,
};
use crate::llm::{FunctionDefinition, ToolDefinition};

struct Entry {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
    validator: jsonschema::Validator,
}

pub struct ToolRegistry {
    tools: BTreeMap<String, Entry>,
}

impl ToolRegistry {
    /// Register `tools`, compiling each input schema.
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self, RegistryError> {
        let mut entries = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if entries.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            let schema = tool.parameters_schema();
            let validator =
                jsonschema::validator_for(&schema).map_err(|e| RegistryError::InvalidSchema {
                    tool: name.clone(),
                    message: e.to_string(),
                })?;
            let descriptor = ToolDescriptor {
                name: name.clone(),
                description: tool.description().to_string(),
                input_schema: schema,
                capabilities: tool.capabilities(),
            };
            entries.insert(
                name,
                Entry {
                    tool,
                    descriptor,
                    validator,
                },
            );
        }
        Ok(Self { tools: entries })
    }

    /// Run a discovery strategy and register what it finds.
    pub async fn discover(
        strategy: &dyn ToolDiscovery,
        env: &DiscoveryEnv,
    ) -> Result<Self, RegistryError> {
        let tools = strategy.discover(env).await?;
        let registry = Self::from_tools(tools)?;
        tracing::info!(
            strategy = strategy.name(),
            "Tool registry complete with {} tools: {}",
            registry.len(),
            registry.names().join(", ")
        );
        Ok(registry)
    }

    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.tools
            .get(name)
            .map(|e| &e.descriptor)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// Check a call against the tool's input schema. Pure: the same call
    /// always yields the same result.
    pub fn validate(&self, call: &ToolInvocation) -> Result<(), ToolError> {
        let entry = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let instance = call.arguments_value();
        let errors: Vec<String> = entry
            .validator
            .iter_errors(&instance)
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{}: {}", path, error)
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ToolError::SchemaInvalid {
                tool: call.name.clone(),
                errors,
            })
        }
    }

    pub(crate) fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().map(|e| &e.descriptor)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool schemas in LLM-compatible format.
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors()
            .map(|d| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    parameters: d.input_schema.clone(),
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::tools::{ToolContext, ToolOutput};

    struct Echo {
        schema: Value,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo a message"
        }

        fn parameters_schema(&self) -> Value {
            self.schema.clone()
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::text(args["message"].as_str().unwrap_or_default()))
        }
    }

    fn echo() -> Arc<dyn Tool> {
        Arc::new(Echo {
            schema: json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
        })
    }

    fn call(args: Value) -> ToolInvocation {
        let Value::Object(map) = args else {
            panic!("object expected")
        };
        ToolInvocation::new("c1", "echo", map)
    }

    #[test]
    fn test_lookup() {
        let registry = ToolRegistry::from_tools(vec![echo()]).unwrap();
        assert_eq!(registry.lookup("echo").unwrap().name, "echo");
        assert_eq!(
            registry.lookup("ghost_tool").unwrap_err(),
            ToolError::NotFound("ghost_tool".into())
        );
    }

    #[test]
    fn test_validate_is_idempotent() {
        let registry = ToolRegistry::from_tools(vec![echo()]).unwrap();
        let good = call(json!({"message": "hi"}));
        let bad = call(json!({"message": 42}));
        let missing = ToolInvocation::new("c2", "echo", Map::new());

        for invocation in [&good, &bad, &missing] {
            let first = registry.validate(invocation);
            for _ in 0..3 {
                assert_eq!(registry.validate(invocation), first);
            }
        }
        assert!(registry.validate(&good).is_ok());
        assert!(matches!(
            registry.validate(&bad),
            Err(ToolError::SchemaInvalid { .. })
        ));
        assert!(registry.validate(&missing).is_err());
    }

    #[test]
    fn test_duplicate_and_invalid_schema_rejected() {
        assert!(matches!(
            ToolRegistry::from_tools(vec![echo(), echo()]),
            Err(RegistryError::Duplicate(_))
        ));
        let broken: Arc<dyn Tool> = Arc::new(Echo {
            schema: json!({"type": "not-a-type"}),
        });
        assert!(matches!(
            ToolRegistry::from_tools(vec![broken]),
            Err(RegistryError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_tool_definitions() {
        let registry = ToolRegistry::from_tools(vec![echo()]).unwrap();
        let defs = registry.tool_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "echo");
        assert_eq!(defs[0].function.parameters["required"][0], "message");
    }
}
