// src/llm/gemini.rs
// Gemini provider using the Google AI API (SSE streaming)

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChatModel, ChunkStream, Content, LlmError, Part, StreamChunk, TurnRequest, UsageMetadata};

#[derive(Clone)]
pub struct GeminiModel {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiModel {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    fn contents_to_json(contents: &[Content]) -> Value {
        let items: Vec<Value> = contents
            .iter()
            .map(|content| {
                let parts: Vec<Value> = content
                    .parts
                    .iter()
                    .map(|part| match part {
                        Part::Text { text, .. } => json!({ "text": text }),
                        Part::FunctionCall { name, args } => json!({
                            "functionCall": { "name": name, "args": args }
                        }),
                        Part::FunctionResponse { name, response } => json!({
                            "functionResponse": { "name": name, "response": response }
                        }),
                    })
                    .collect();
                json!({ "role": content.role, "parts": parts })
            })
            .collect();
        Value::Array(items)
    }

    fn request_body(request: &TurnRequest) -> Value {
        let mut body = json!({
            "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
            "contents": Self::contents_to_json(&request.contents),
            "generationConfig": {
                "thinkingConfig": { "includeThoughts": true }
            }
        });
        if let Some(tools) = &request.tools {
            body["tools"] = tools.clone();
            body["toolConfig"] = json!({
                "functionCallingConfig": { "mode": "AUTO" }
            });
        }
        body
    }

    /// Parse one SSE data payload into a stream chunk.
    fn parse_chunk(data: &str) -> Option<StreamChunk> {
        let value: Value = serde_json::from_str(data).ok()?;
        let mut chunk = StreamChunk::default();

        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        let thought = part
                            .get("thought")
                            .and_then(|t| t.as_bool())
                            .unwrap_or(false);
                        chunk.parts.push(Part::Text {
                            text: text.to_string(),
                            thought,
                        });
                    }
                }
                if let Some(fc) = part.get("functionCall") {
                    let name = fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let args = fc
                        .get("args")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default()));
                    chunk.parts.push(Part::FunctionCall { name, args });
                }
            }
        }

        if let Some(usage) = value.get("usageMetadata") {
            chunk.usage = Some(UsageMetadata {
                prompt_tokens: usage
                    .get("promptTokenCount")
                    .and_then(|t| t.as_i64())
                    .unwrap_or(0),
                candidates_tokens: usage
                    .get("candidatesTokenCount")
                    .and_then(|t| t.as_i64())
                    .unwrap_or(0),
            });
        }

        if chunk.parts.is_empty() && chunk.usage.is_none() {
            None
        } else {
            Some(chunk)
        }
    }
}

#[async_trait]
impl ChatModel for GeminiModel {
    async fn stream_turn(&self, request: TurnRequest) -> Result<ChunkStream, LlmError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?key={}&alt=sse",
            self.base_url, request.model, self.api_key
        );
        debug!(
            "Gemini streaming request: model={}, {} contents, tools={}",
            request.model,
            request.contents.len(),
            request.tools.is_some()
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&Self::request_body(&request))
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api(format!(
                "Gemini API returned {status}: {error_text}"
            )));
        }

        let mut byte_stream = response.bytes_stream();
        let chunk_stream = stream! {
            let mut buffer = String::new();
            while let Some(next) = byte_stream.next().await {
                match next {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        // SSE events are newline-delimited; keep any partial
                        // trailing line in the buffer for the next read.
                        while let Some(newline) = buffer.find('\n') {
                            let line = buffer[..newline].trim().to_string();
                            buffer.drain(..=newline);
                            if line.is_empty() || line.starts_with(':') {
                                continue;
                            }
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Some(chunk) = GeminiModel::parse_chunk(data) {
                                    yield Ok(chunk);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Gemini stream error: {}", e);
                        yield Err(LlmError::Network(e.to_string()));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(chunk_stream))
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );

        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api(format!(
                "Gemini API returned {status}: {error_text}"
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;
        let text = value
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chunk_text() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"hello"}]}}]}"#;
        let chunk = GeminiModel::parse_chunk(data).unwrap();
        assert!(matches!(
            &chunk.parts[0],
            Part::Text { text, thought: false } if text == "hello"
        ));
    }

    #[test]
    fn test_parse_chunk_thought() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true}]}}]}"#;
        let chunk = GeminiModel::parse_chunk(data).unwrap();
        assert!(matches!(
            &chunk.parts[0],
            Part::Text { thought: true, .. }
        ));
    }

    #[test]
    fn test_parse_chunk_function_call() {
        let data = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"execute_sql","args":{"query":"SELECT 1"}}}]}}]}"#;
        let chunk = GeminiModel::parse_chunk(data).unwrap();
        match &chunk.parts[0] {
            Part::FunctionCall { name, args } => {
                assert_eq!(name, "execute_sql");
                assert_eq!(args["query"], "SELECT 1");
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn test_parse_chunk_usage_metadata() {
        let data = r#"{"usageMetadata":{"promptTokenCount":120,"candidatesTokenCount":45}}"#;
        let chunk = GeminiModel::parse_chunk(data).unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.candidates_tokens, 45);
    }

    #[test]
    fn test_parse_chunk_empty_is_none() {
        assert!(GeminiModel::parse_chunk("{}").is_none());
        assert!(GeminiModel::parse_chunk("not json").is_none());
    }

    #[test]
    fn test_request_body_includes_tools_when_present() {
        let request = TurnRequest {
            model: "gemini-2.5-flash".into(),
            system_prompt: "You are a data analyst.".into(),
            contents: vec![Content::user("hi")],
            tools: Some(super::super::tool_declarations()),
        };
        let body = GeminiModel::request_body(&request);
        assert!(body.get("tools").is_some());
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "AUTO");

        let without = TurnRequest {
            tools: None,
            ..request
        };
        let body = GeminiModel::request_body(&without);
        assert!(body.get("tools").is_none());
    }
}
