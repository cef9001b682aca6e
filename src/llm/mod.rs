// src/llm/mod.rs
// ChatModel trait and the streaming contract shared by providers

pub mod gemini;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Value, json};

pub use gemini::GeminiModel;

/// One part of a model turn. Thought text is model reasoning; function
/// calls arrive in-band and interrupt the stream.
#[derive(Debug, Clone)]
pub enum Part {
    Text { text: String, thought: bool },
    FunctionCall { name: String, args: Value },
    FunctionResponse { name: String, response: Value },
}

/// A role-tagged message in provider wire format ("user", "model", "function").
#[derive(Debug, Clone)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            parts: vec![Part::Text {
                text: text.into(),
                thought: false,
            }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".into(),
            parts: vec![Part::Text {
                text: text.into(),
                thought: false,
            }],
        }
    }

    pub fn model_function_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            role: "model".into(),
            parts: vec![Part::FunctionCall {
                name: name.into(),
                args,
            }],
        }
    }

    pub fn function_response(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            role: "function".into(),
            parts: vec![Part::FunctionResponse {
                name: name.into(),
                response: json!({ "result": result.into() }),
            }],
        }
    }
}

/// Token usage carried on the final chunk of a stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageMetadata {
    pub prompt_tokens: i64,
    pub candidates_tokens: i64,
}

/// One streamed chunk: zero or more parts plus optional usage metadata.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub parts: Vec<Part>,
    pub usage: Option<UsageMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider returned its 429-equivalent. Retried with backoff by the
    /// stream loop; surfaced to the user only after retries are exhausted.
    #[error("The AI service is temporarily busy. Please try again in a moment.")]
    RateLimited,
    #[error("LLM API error: {0}")]
    Api(String),
    #[error("LLM request failed: {0}")]
    Network(String),
}

/// Everything a provider needs for one streaming call.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub system_prompt: String,
    pub contents: Vec<Content>,
    /// Tool catalog in provider wire format; `None` disables tools for the
    /// final forced-text call.
    pub tools: Option<Value>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Open a streaming generation call.
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkStream, LlmError>;

    /// One-shot non-streaming completion (explain-sql / generate-sql).
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

/// The tool catalog offered to the model on every chat turn.
pub fn tool_declarations() -> Value {
    json!([{
        "functionDeclarations": [
            {
                "name": "execute_sql",
                "description": "Execute a SQL query against the loaded datasets. Use Polars SQL dialect.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "query": { "type": "STRING", "description": "The SQL query to execute" }
                    },
                    "required": ["query"]
                }
            },
            {
                "name": "load_dataset",
                "description": "Load a parquet dataset from a URL into the conversation.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "url": { "type": "STRING", "description": "The URL of the parquet file to load" }
                    },
                    "required": ["url"]
                }
            },
            {
                "name": "create_chart",
                "description": "Create an interactive chart visualization from the most recent query results. Call this after executing a SQL query when the results would benefit from visual representation.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "chart_type": {
                            "type": "STRING",
                            "enum": ["bar", "horizontal_bar", "line", "scatter", "histogram", "pie", "box", "heatmap", "choropleth"],
                            "description": "The type of chart to create"
                        },
                        "title": { "type": "STRING", "description": "Chart title" },
                        "x_column": { "type": "STRING", "description": "Column name for x-axis (or categories for bar/pie charts, or row dimension for heatmaps)" },
                        "y_columns": {
                            "type": "ARRAY",
                            "items": { "type": "STRING" },
                            "description": "Column name(s) for y-axis values. Multiple columns create grouped/multi-series charts."
                        },
                        "color_column": { "type": "STRING", "description": "Optional column for color grouping (creates separate traces per unique value)" },
                        "orientation": { "type": "STRING", "enum": ["vertical", "horizontal"], "description": "Bar/box chart orientation. Default: vertical." },
                        "aggregation": { "type": "STRING", "enum": ["none", "sum", "avg", "count", "min", "max"], "description": "Aggregation to apply if data needs grouping. Default: none." },
                        "bar_mode": { "type": "STRING", "enum": ["group", "stack", "relative"], "description": "Bar chart grouping mode. Default: group." },
                        "color_scale": { "type": "STRING", "enum": ["default", "diverging", "sequential", "categorical"], "description": "Color scale type. 'diverging' centers at zero. Default: default." },
                        "x_label": { "type": "STRING", "description": "Custom x-axis label" },
                        "y_label": { "type": "STRING", "description": "Custom y-axis label" },
                        "show_values": { "type": "BOOLEAN", "description": "Show value labels on bars/points. Default: false." },
                        "z_column": { "type": "STRING", "description": "Column name for z-axis values (used in heatmap to specify the numeric value for the color intensity)" },
                        "location_column": { "type": "STRING", "description": "Column name containing geographic locations (state names, abbreviations, or FIPS codes) for choropleth maps" },
                        "location_type": { "type": "STRING", "enum": ["state_name", "state_abbr", "country_name", "country_iso3"], "description": "Type of geographic identifier in location_column. Default: auto-detect." }
                    },
                    "required": ["chart_type", "title"]
                }
            },
            {
                "name": "suggest_followups",
                "description": "After answering a user's question, suggest 2-3 natural follow-up questions they might want to ask next. Only call this after you've fully answered the user's question.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "suggestions": {
                            "type": "ARRAY",
                            "items": { "type": "STRING" },
                            "description": "List of 2-3 short follow-up questions (max 80 chars each)"
                        }
                    },
                    "required": ["suggestions"]
                }
            }
        ]
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_declarations_shape() {
        let tools = tool_declarations();
        let decls = tools[0]["functionDeclarations"].as_array().unwrap();
        let names: Vec<&str> = decls.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(
            names,
            vec!["execute_sql", "load_dataset", "create_chart", "suggest_followups"]
        );
    }

    #[test]
    fn test_content_constructors() {
        let c = Content::user("hi");
        assert_eq!(c.role, "user");
        let c = Content::model_function_call("execute_sql", json!({"query": "SELECT 1"}));
        assert_eq!(c.role, "model");
        assert!(matches!(c.parts[0], Part::FunctionCall { .. }));
        let c = Content::function_response("execute_sql", "ok");
        assert_eq!(c.role, "function");
    }
}
