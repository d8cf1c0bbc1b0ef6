//! JSON-RPC 2.0 types for the tool server wire contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests / responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Extract the result value, surfacing a server-side error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
    /// Server-attached metadata; tag lists live under `_catalog.tags`.
    #[serde(default)]
    pub meta: Option<Value>,
    /// Behavioral hints: `requires_approval`, `destructive`.
    #[serde(default)]
    pub annotations: Option<Value>,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    fn annotation_flag(&self, key: &str) -> bool {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether invoking this tool needs explicit user consent.
    pub fn requires_approval(&self) -> bool {
        self.annotation_flag("requires_approval")
    }

    pub fn destructive(&self) -> bool {
        self.annotation_flag("destructive")
    }

    /// Display title, falling back to the tool name.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// Tag list extracted from the server metadata.
    pub fn tags(&self) -> Vec<String> {
        self.meta
            .as_ref()
            .and_then(|m| m.get("_catalog"))
            .and_then(|c| c.get("tags"))
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The result payload from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDescriptor>,
}

/// The raw result payload from `tools/call`. Content blocks are kept as
/// raw values so non-text blocks pass through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request_without_params_omits_field() {
        let req = RpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn deserialize_error_response() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: RpcResponse = serde_json::from_str(raw).unwrap();
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.code, -32601);
        assert_eq!(format!("{err}"), "JSON-RPC error -32601: Method not found");
    }

    #[test]
    fn deserialize_success_response() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#;
        let resp: RpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, 7);
        let val = resp.into_result().unwrap();
        assert!(val.get("tools").is_some());
    }

    #[test]
    fn descriptor_defaults_and_annotations() {
        let raw = r#"{
            "tools": [
                { "name": "get_pods" },
                {
                    "name": "delete_pod",
                    "title": "Delete a pod",
                    "inputSchema": {"type":"object","properties":{"name":{"type":"string"}}},
                    "annotations": {"requires_approval": true, "destructive": true},
                    "meta": {"_catalog": {"tags": ["k8s", "write"]}}
                }
            ]
        }"#;
        let result: ToolsListResult = serde_json::from_str(raw).unwrap();

        let get_pods = &result.tools[0];
        assert!(!get_pods.requires_approval());
        assert_eq!(get_pods.display_title(), "get_pods");
        assert_eq!(get_pods.input_schema["type"], "object");
        assert!(get_pods.tags().is_empty());

        let delete_pod = &result.tools[1];
        assert!(delete_pod.requires_approval());
        assert!(delete_pod.destructive());
        assert_eq!(delete_pod.display_title(), "Delete a pod");
        assert_eq!(delete_pod.tags(), vec!["k8s", "write"]);
    }

    #[test]
    fn call_result_defaults() {
        let raw = r#"{ "content": [{"type":"text","text":"ok"}] }"#;
        let result: CallToolResult = serde_json::from_str(raw).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 1);
    }

    #[test]
    fn call_result_error_flag() {
        let raw = r#"{ "content": [{"type":"text","text":"not found"}], "isError": true }"#;
        let result: CallToolResult = serde_json::from_str(raw).unwrap();
        assert!(result.is_error);
    }
}
