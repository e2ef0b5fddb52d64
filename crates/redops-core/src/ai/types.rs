//! Wire types for the chat-completion endpoint.
//!
//! The contract is the OpenAI-compatible function-calling shape: messages of
//! roles system/user/assistant/tool plus a `tools` array; responses carry
//! either plain content or `tool_calls`. Tool-call `arguments` may arrive as
//! a JSON object or a JSON-encoded string; both normalise to a map.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Tool response tied back to the model's tool-call ID.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: tool_call_id.into(),
        }
    }

    /// Assistant turn that carries tool calls (and optional thinking text).
    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: calls,
            tool_call_id: String::new(),
        }
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: String::new(),
        }
    }
}

/// Tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: ToolArguments,
}

/// Argument map that tolerates the endpoint's two encodings.
///
/// Serialises as a JSON-encoded string (what OpenAI-compatible endpoints
/// expect back in the conversation); deserialises from either an object or a
/// string. An unparseable string becomes `{"raw": <string>}` and any other
/// scalar becomes `{"value": <scalar>}` so the call still reaches the tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArguments(pub HashMap<String, Value>);

impl Serialize for ToolArguments {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for ToolArguments {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let map = match raw {
            Value::Object(map) => map.into_iter().collect(),
            Value::String(s) => match serde_json::from_str::<HashMap<String, Value>>(&s) {
                Ok(map) => map,
                Err(_) => HashMap::from([("raw".to_string(), Value::String(s))]),
            },
            Value::Null => HashMap::new(),
            other => HashMap::from([("value".to_string(), other)]),
        };
        Ok(Self(map))
    }
}

/// Tool definition in the endpoint's function-calling shape.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub spec_type: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            spec_type: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub tools: &'a [ToolSpec],
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_accept_object_form() {
        let raw = r#"{"id":"c1","type":"function","function":{"name":"port_scan","arguments":{"target":"10.0.0.1"}}}"#;
        let call: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(call.function.name, "port_scan");
        assert_eq!(call.function.arguments.0["target"], json!("10.0.0.1"));
    }

    #[test]
    fn arguments_accept_string_form() {
        let raw = r#"{"id":"c2","type":"function","function":{"name":"port_scan","arguments":"{\"target\":\"10.0.0.1\",\"ports\":\"1-1000\"}"}}"#;
        let call: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(call.function.arguments.0["ports"], json!("1-1000"));
    }

    #[test]
    fn unparseable_string_becomes_raw() {
        let raw = r#"{"id":"c3","type":"function","function":{"name":"t","arguments":"not json"}}"#;
        let call: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(call.function.arguments.0["raw"], json!("not json"));
    }

    #[test]
    fn null_arguments_become_empty_map() {
        let raw = r#"{"id":"c4","type":"function","function":{"name":"t","arguments":null}}"#;
        let call: ToolCall = serde_json::from_str(raw).unwrap();
        assert!(call.function.arguments.0.is_empty());
    }

    #[test]
    fn arguments_serialize_as_json_string() {
        let call = ToolCall {
            id: "c5".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "t".to_string(),
                arguments: ToolArguments(HashMap::from([(
                    "target".to_string(),
                    json!("10.0.0.1"),
                )])),
            },
        };

        let value = serde_json::to_value(&call).unwrap();
        let args = value["function"]["arguments"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(args).unwrap();
        assert_eq!(parsed["target"], json!("10.0.0.1"));
    }

    #[test]
    fn tool_message_carries_call_id() {
        let msg = ChatMessage::tool("call-1", "scan output");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call-1");
        assert!(value.get("tool_calls").is_none());
    }

    #[test]
    fn empty_tools_are_omitted_from_request() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            tools: &[],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tools").is_none());
    }
}
