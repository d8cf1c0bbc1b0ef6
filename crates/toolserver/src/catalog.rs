//! Tool discovery and invocation.
//!
//! The [`ToolCatalog`] trait is the seam the orchestrator depends on; the
//! [`ToolServerClient`] is the production implementation backed by the HTTP
//! transport. The catalog is cached with a bounded TTL. Invocation applies
//! a strictly-local argument inference table and normalizes the result
//! shape before handing it back.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

use od_domain::config::ToolServerConfig;
use od_domain::{Error, Result};

use crate::protocol::{CallToolResult, ToolDescriptor, ToolsListResult};
use crate::transport::HttpTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait + outcome type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A normalized tool invocation result.
///
/// `is_error = true` means the tool itself reported failure; transport
/// failures surface as `Err` from `call_tool` instead.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Content blocks. Text blocks are `{"type":"text","text":...}`;
    /// anything else passes through verbatim.
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// Joined text of all text blocks, for feeding back to the LLM.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    block.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Discovery and invocation against the tool server.
#[async_trait::async_trait]
pub trait ToolCatalog: Send + Sync {
    /// The current tool catalog. Implementations may serve a cached copy.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a named tool. `action` is an optional hint used only for
    /// local argument inference; the caller's arguments are never mutated.
    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        action: Option<&str>,
    ) -> Result<ToolCallOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument inference
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Infer an obvious missing `resource_type` for `get_resources` from the
/// accompanying action hint. Returns a new value; the input is untouched.
pub fn infer_arguments(tool_name: &str, arguments: &Value, action: Option<&str>) -> Value {
    let mut inferred = arguments.clone();

    if tool_name == "get_resources" {
        if let (Some(action), Some(obj)) = (action, inferred.as_object_mut()) {
            if !obj.contains_key("resource_type") {
                let resource_type = match action {
                    "get_pods" => Some("pod"),
                    "get_deployments" => Some("deployment"),
                    "get_services" => Some("service"),
                    "get_namespaces" => Some("namespace"),
                    "get_nodes" => Some("node"),
                    _ => None,
                };
                if let Some(rt) = resource_type {
                    obj.insert("resource_type".into(), Value::String(rt.into()));
                }
            }
        }
    }

    inferred
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn value_is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Collapse `{output, error}`-shaped text blocks into plain text blocks
/// carrying `output`, ORing the error flag into the top-level `is_error`.
pub fn normalize_outcome(result: CallToolResult) -> ToolCallOutcome {
    let mut is_error = result.is_error;
    let mut content = Vec::with_capacity(result.content.len());

    for block in result.content {
        if block.get("type").and_then(|t| t.as_str()) != Some("text") {
            content.push(block);
            continue;
        }

        let text = block.get("text").cloned().unwrap_or(Value::Null);

        // The text field may be a structured {output, error} object, or a
        // JSON string encoding one.
        let structured: Option<Value> = match &text {
            Value::Object(_) => Some(text.clone()),
            Value::String(s) => serde_json::from_str::<Value>(s)
                .ok()
                .filter(|v| v.is_object()),
            _ => None,
        };

        match structured {
            Some(obj)
                if obj.get("output").is_some() && obj.get("error").is_some() =>
            {
                if value_is_truthy(obj.get("error").unwrap_or(&Value::Null)) {
                    is_error = true;
                }
                let output = match obj.get("output") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                content.push(serde_json::json!({"type": "text", "text": output}));
            }
            _ => content.push(block),
        }
    }

    ToolCallOutcome { content, is_error }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP-backed client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CachedCatalog {
    tools: Vec<ToolDescriptor>,
    fetched_at: Instant,
}

pub struct ToolServerClient {
    transport: HttpTransport,
    cache: RwLock<Option<CachedCatalog>>,
    catalog_ttl: Duration,
}

impl ToolServerClient {
    pub fn new(cfg: &ToolServerConfig) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(cfg)?,
            cache: RwLock::new(None),
            catalog_ttl: Duration::from_secs(cfg.catalog_ttl_seconds),
        })
    }

    fn cached_tools(&self) -> Option<Vec<ToolDescriptor>> {
        let cache = self.cache.read();
        cache.as_ref().and_then(|c| {
            if c.fetched_at.elapsed() < self.catalog_ttl {
                Some(c.tools.clone())
            } else {
                None
            }
        })
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let resp = self.transport.send_request("tools/list", None).await?;
        let value = resp
            .into_result()
            .map_err(|e| Error::ToolServer(e.to_string()))?;
        let parsed: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| Error::ToolServer(format!("malformed tools/list result: {e}")))?;

        tracing::info!(tool_count = parsed.tools.len(), "tool catalog refreshed");

        *self.cache.write() = Some(CachedCatalog {
            tools: parsed.tools.clone(),
            fetched_at: Instant::now(),
        });
        Ok(parsed.tools)
    }
}

#[async_trait::async_trait]
impl ToolCatalog for ToolServerClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if let Some(tools) = self.cached_tools() {
            return Ok(tools);
        }
        self.fetch_tools().await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        action: Option<&str>,
    ) -> Result<ToolCallOutcome> {
        let inferred = infer_arguments(name, arguments, action);
        let params = serde_json::json!({
            "name": name,
            "arguments": inferred,
        });

        let resp = self.transport.send_request("tools/call", Some(params)).await?;
        let value = resp
            .into_result()
            .map_err(|e| Error::ToolServer(format!("tools/call failed: {e}")))?;
        let raw: CallToolResult = serde_json::from_value(value)
            .map_err(|e| Error::ToolServer(format!("malformed tools/call result: {e}")))?;

        Ok(normalize_outcome(raw))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    // ── infer_arguments ───────────────────────────────────────────

    #[test]
    fn infers_resource_type_from_action() {
        let args = serde_json::json!({"namespace": "default"});
        let inferred = infer_arguments("get_resources", &args, Some("get_pods"));
        assert_eq!(inferred["resource_type"], "pod");
        // Caller's map is untouched.
        assert!(args.get("resource_type").is_none());
    }

    #[test]
    fn explicit_resource_type_wins() {
        let args = serde_json::json!({"resource_type": "deployment"});
        let inferred = infer_arguments("get_resources", &args, Some("get_pods"));
        assert_eq!(inferred["resource_type"], "deployment");
    }

    #[test]
    fn no_inference_for_other_tools() {
        let args = serde_json::json!({"name": "api-server"});
        let inferred = infer_arguments("delete_pod", &args, Some("get_pods"));
        assert!(inferred.get("resource_type").is_none());
    }

    #[test]
    fn unknown_action_leaves_args_alone() {
        let args = serde_json::json!({});
        let inferred = infer_arguments("get_resources", &args, Some("restart_everything"));
        assert!(inferred.get("resource_type").is_none());
    }

    // ── normalize_outcome ─────────────────────────────────────────

    fn text_block(text: &str) -> Value {
        serde_json::json!({"type": "text", "text": text})
    }

    #[test]
    fn plain_text_blocks_pass_through() {
        let outcome = normalize_outcome(CallToolResult {
            content: vec![text_block("pod-a\npod-b")],
            is_error: false,
        });
        assert!(!outcome.is_error);
        assert_eq!(outcome.text(), "pod-a\npod-b");
    }

    #[test]
    fn output_error_object_is_collapsed() {
        let outcome = normalize_outcome(CallToolResult {
            content: vec![serde_json::json!({
                "type": "text",
                "text": {"output": "deployment scaled", "error": ""},
            })],
            is_error: false,
        });
        assert!(!outcome.is_error);
        assert_eq!(outcome.text(), "deployment scaled");
    }

    #[test]
    fn output_error_json_string_is_collapsed() {
        let outcome = normalize_outcome(CallToolResult {
            content: vec![text_block(
                r#"{"output": "", "error": "pods \"api\" not found"}"#,
            )],
            is_error: false,
        });
        assert!(outcome.is_error);
        assert_eq!(outcome.text(), "");
    }

    #[test]
    fn error_flag_is_ored_not_overwritten() {
        let outcome = normalize_outcome(CallToolResult {
            content: vec![serde_json::json!({
                "type": "text",
                "text": {"output": "partial", "error": ""},
            })],
            is_error: true,
        });
        assert!(outcome.is_error);
    }

    #[test]
    fn non_text_blocks_pass_through_verbatim() {
        let image = serde_json::json!({"type": "image", "data": "…", "mimeType": "image/png"});
        let outcome = normalize_outcome(CallToolResult {
            content: vec![image.clone(), text_block("caption")],
            is_error: false,
        });
        assert_eq!(outcome.content[0], image);
        assert_eq!(outcome.text(), "caption");
    }

    #[test]
    fn ordinary_json_text_is_not_collapsed() {
        // JSON that parses but lacks output/error keys stays as-is.
        let outcome = normalize_outcome(CallToolResult {
            content: vec![text_block(r#"{"items": [1, 2, 3]}"#)],
            is_error: false,
        });
        assert_eq!(outcome.text(), r#"{"items": [1, 2, 3]}"#);
    }

    #[test]
    fn nonstring_output_is_stringified() {
        let outcome = normalize_outcome(CallToolResult {
            content: vec![serde_json::json!({
                "type": "text",
                "text": {"output": {"replicas": 3}, "error": ""},
            })],
            is_error: false,
        });
        assert_eq!(outcome.text(), r#"{"replicas":3}"#);
    }
}
