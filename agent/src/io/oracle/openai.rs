//! OpenAI-compatible `/chat/completions` oracle.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{Oracle, OracleReply, Usage};
use crate::core::shape::{OutputShape, ParsedValue};
use crate::core::transcript::{Message, ToolCall};
use crate::error::OracleError;

pub struct OpenAiOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiOracle {
    pub fn new(
        base_url: &str,
        api_key: String,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("create HTTP client for oracle")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.into(),
            temperature: None,
        })
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn request_body(
        &self,
        messages: &[Message],
        shape: &OutputShape,
    ) -> Result<Value, OracleError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        match shape {
            OutputShape::Text => {}
            OutputShape::Tools(tools) => {
                let tools: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect();
                body["tools"] = Value::Array(tools);
            }
            OutputShape::Structured(schema) => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": schema.name,
                        "strict": true,
                        "schema": schema.to_value()?,
                    }
                });
            }
        }
        Ok(body)
    }
}

fn wire_message(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::User { content } => json!({"role": "user", "content": content}),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            value
        }
        Message::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

fn parse_response(response: ChatResponse, shape: &OutputShape) -> Result<OracleReply, OracleError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| OracleError::Transport("response has no choices".to_string()))?;
    let message = choice.message;
    if let Some(refusal) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(OracleError::Refused(refusal));
    }
    let text = message.content.unwrap_or_default();

    let value = match shape {
        OutputShape::Text => ParsedValue::Text(text),
        OutputShape::Tools(_) => {
            let calls = message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    // Malformed argument JSON is passed through so the tool can report it.
                    arguments: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::String(call.function.arguments)),
                })
                .collect();
            ParsedValue::ToolCalls { text, calls }
        }
        OutputShape::Structured(schema) => {
            let value = serde_json::from_str(&text).map_err(|err| OracleError::Schema {
                shape: schema.name.to_string(),
                message: format!("reply is not JSON: {err}"),
            })?;
            ParsedValue::Structured(value)
        }
    };
    Ok(OracleReply {
        value,
        usage: response.usage,
    })
}

#[async_trait]
impl Oracle for OpenAiOracle {
    #[instrument(
        skip_all,
        fields(model = %self.model, shape = shape.label(), messages = messages.len())
    )]
    async fn invoke(
        &self,
        messages: &[Message],
        shape: &OutputShape,
    ) -> Result<OracleReply, OracleError> {
        let body = self.request_body(messages, shape)?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| OracleError::Transport(format!("decode response: {err}")))?;
        let reply = parse_response(parsed, shape)?;
        debug!(kind = reply.value.kind(), usage = ?reply.usage, "oracle replied");
        Ok(reply)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::shape::{StructuredSchema, ToolSpec};

    fn oracle() -> OpenAiOracle {
        OpenAiOracle::new(
            "http://localhost:1/v1/",
            "key".to_string(),
            "gpt-4o",
            Duration::from_secs(5),
        )
        .expect("client")
    }

    fn response(message: Value) -> ChatResponse {
        serde_json::from_value(json!({
            "choices": [{"message": message, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .expect("response")
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(oracle().endpoint, "http://localhost:1/v1/chat/completions");
    }

    #[test]
    fn tool_shape_sends_function_tools() {
        let shape = OutputShape::Tools(vec![ToolSpec {
            name: "execute_command".to_string(),
            description: "run".to_string(),
            parameters: json!({"type": "object"}),
        }]);
        let body = oracle()
            .request_body(&[Message::user("go")], &shape)
            .expect("body");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "execute_command");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn structured_shape_sends_strict_schema() {
        let shape = OutputShape::Structured(StructuredSchema::KNOWLEDGE_MERGE);
        let body = oracle().request_body(&[], &shape).expect("body");
        assert_eq!(body["response_format"]["json_schema"]["name"], "knowledge_merge");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn assistant_tool_calls_use_string_arguments() {
        let message = Message::assistant(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "execute_command".to_string(),
                arguments: json!({"command": "id"}),
            }],
        );
        let wire = wire_message(&message);
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            "{\"command\":\"id\"}"
        );
    }

    #[test]
    fn parses_tool_calls_and_usage() {
        let reply = parse_response(
            response(json!({
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "execute_command", "arguments": "{\"command\":\"ls\"}"}
                }]
            })),
            &OutputShape::Tools(Vec::new()),
        )
        .expect("reply");
        let ParsedValue::ToolCalls { text, calls } = reply.value else {
            panic!("expected tool calls");
        };
        assert!(text.is_empty());
        assert_eq!(calls[0].arguments["command"], "ls");
        assert_eq!(
            reply.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn refusal_is_an_error() {
        let err = parse_response(
            response(json!({"role": "assistant", "content": null, "refusal": "no"})),
            &OutputShape::Text,
        )
        .expect_err("refusal");
        assert!(matches!(err, OracleError::Refused(_)));
    }

    #[test]
    fn structured_reply_must_be_json() {
        let err = parse_response(
            response(json!({"role": "assistant", "content": "not json"})),
            &OutputShape::Structured(StructuredSchema::PLAN_UPDATE),
        )
        .expect_err("schema");
        assert!(matches!(err, OracleError::Schema { .. }));
    }
}
