//! Tools the language model may call during a session

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

/// Reply to a [`ToolCall`], carrying either `{"result": ..}` or `{"error": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub response: Value,
}

type ToolFn = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

struct Tool {
    description: String,
    parameters: Value,
    run: ToolFn,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the tools shipped with the server
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "tell_a_joke",
            "Tells a joke to the user, optionally about a specific topic.",
            json!({
                "type": "OBJECT",
                "properties": {
                    "topic": {
                        "type": "STRING",
                        "description": "The topic of the joke (e.g., programming, science, dad)."
                    }
                }
            }),
            tell_a_joke,
        );
        registry
    }

    pub fn register<F>(&mut self, name: &str, description: &str, parameters: Value, run: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.tools.insert(
            name.to_string(),
            Tool {
                description: description.to_string(),
                parameters,
                run: Box::new(run),
            },
        );
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Function declarations in the shape the model expects
    pub fn declarations(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect()
    }

    /// Execute a call; unknown tools and tool failures become error replies
    pub fn call(&self, call: &ToolCall) -> ToolResult {
        let response = match self.tools.get(&call.name) {
            Some(tool) => {
                info!(tool = %call.name, args = %call.args, "executing tool");
                match (tool.run)(&call.args) {
                    Ok(result) => json!({ "result": result }),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool failed");
                        json!({ "error": e })
                    }
                }
            }
            None => {
                warn!(tool = %call.name, "tool not found in registry");
                json!({ "error": format!("unknown tool '{}'", call.name) })
            }
        };

        ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            response,
        }
    }
}

fn tell_a_joke(args: &Value) -> Result<Value, String> {
    let topic = args
        .get("topic")
        .and_then(Value::as_str)
        .unwrap_or("general")
        .to_lowercase();

    let jokes: &[&str] = match topic.as_str() {
        "programming" => &[
            "Why did the JavaScript developer go broke? Because he kept using 'var' instead of 'let'.",
            "I told my computer I needed a break, and it started updating.",
            "Debugging: where you stare at your code like it betrayed you. Because it did.",
        ],
        "dad" => &[
            "I told my son I'd make him a belt out of watches. He said, 'That's a waist of time.'",
            "Tried to catch some fog this morning. I mist.",
            "I only know 25 letters of the alphabet. I don't know y.",
        ],
        "science" => &[
            "My physics teacher broke up with me. Said I had too much potential energy.",
            "Einstein developed a theory about space. And it's about time.",
            "Why did the biologist break up with the physicist? No chemistry.",
        ],
        _ => &[
            "Why did the ghost go to therapy? It had too many haunting thoughts.",
            "Tried to organize a hide-and-seek contest, but good players are hard to find.",
            "What do you call an optimistic vampire? A sucker for good vibes.",
        ],
    };

    let joke = jokes
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| "no jokes available".to_string())?;
    Ok(json!({ "joke": joke }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call-1".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn test_builtin_joke_tool() {
        let registry = ToolRegistry::with_builtin();
        let result = registry.call(&call("tell_a_joke", json!({ "topic": "Science" })));

        assert_eq!(result.id, "call-1");
        assert_eq!(result.name, "tell_a_joke");
        let joke = result.response["result"]["joke"].as_str().unwrap();
        assert!(!joke.is_empty());
    }

    #[test]
    fn test_joke_without_topic_falls_back_to_general() {
        let registry = ToolRegistry::with_builtin();
        let result = registry.call(&call("tell_a_joke", Value::Null));
        assert!(result.response["result"]["joke"].is_string());
    }

    #[test]
    fn test_unknown_tool_replies_with_error() {
        let registry = ToolRegistry::with_builtin();
        let result = registry.call(&call("launch_ranger", json!({})));
        assert!(result.response["error"]
            .as_str()
            .unwrap()
            .contains("launch_ranger"));
    }

    #[test]
    fn test_failing_tool_replies_with_error() {
        let mut registry = ToolRegistry::new();
        registry.register("broken", "always fails", json!({}), |_| Err("boom".into()));
        let result = registry.call(&call("broken", json!({})));
        assert_eq!(result.response, json!({ "error": "boom" }));
    }

    #[test]
    fn test_declarations_list_every_tool() {
        let registry = ToolRegistry::with_builtin();
        let declarations = registry.declarations();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0]["name"], "tell_a_joke");
        assert_eq!(declarations[0]["parameters"]["type"], "OBJECT");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["tell_a_joke"]);
    }
}
