//! Typed tool/function schemas sent alongside each model request

use super::tokens::estimate_tokens;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Type of a single tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    /// String restricted to the listed values
    Enum(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub description: String,
    pub kind: ParameterKind,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: ParameterKind,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            required,
        }
    }
}

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// OpenAI-style function definition
    pub fn to_function_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.parameters {
            let prop = match &p.kind {
                ParameterKind::String => json!({"type": "string", "description": p.description}),
                ParameterKind::Integer => json!({"type": "integer", "description": p.description}),
                ParameterKind::Number => json!({"type": "number", "description": p.description}),
                ParameterKind::Boolean => json!({"type": "boolean", "description": p.description}),
                ParameterKind::Enum(values) => {
                    json!({"type": "string", "enum": values, "description": p.description})
                }
            };
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    /// Token estimate of the rendered definition
    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens(&self.to_function_json().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_game() -> ToolSchema {
        ToolSchema::new("launch_game", "Start an educational game for the child")
            .with_parameter(ToolParameter::new(
                "game_id",
                "Which game to start",
                ParameterKind::Enum(vec!["math_quest".into(), "word_garden".into()]),
                true,
            ))
            .with_parameter(ToolParameter::new(
                "difficulty",
                "Level from 1 to 5",
                ParameterKind::Integer,
                false,
            ))
    }

    #[test]
    fn test_function_json_shape() {
        let json = launch_game().to_function_json();
        assert_eq!(json["function"]["name"], "launch_game");
        let params = &json["function"]["parameters"];
        assert_eq!(params["properties"]["game_id"]["enum"][1], "word_garden");
        assert_eq!(params["properties"]["difficulty"]["type"], "integer");
        assert_eq!(params["required"], json!(["game_id"]));
    }

    #[test]
    fn test_estimate_grows_with_parameters() {
        let bare = ToolSchema::new("launch_game", "Start an educational game for the child");
        assert!(bare.estimate_tokens() > 0);
        assert!(launch_game().estimate_tokens() > bare.estimate_tokens());
    }
}
