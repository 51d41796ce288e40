//! Tool registry and the dispatch loop that answers inbound `toolUse`
//! frames.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use parley_protocol::{
    build_content_end, build_content_start, build_tool_result, new_content_name, ContentKind,
    MediaConfig, OutboundFrame, ToolSpec,
};
use parley_types::{Role, ToolLogSubtype};
use serde_json::{json, Map, Value};

use crate::error::ToolError;

/// Name of the built-in clock tool.
pub const DATE_TOOL: &str = "getDateTool";

/// A tool the model may call.
///
/// Handlers may perform I/O. Errors become a `{"error": ...}` result; they
/// never reach the model as a missing result.
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, input: Value) -> Result<Value, ToolError>;
}

pub fn date_tool_spec() -> ToolSpec {
    ToolSpec::new(
        DATE_TOOL,
        "Return current date/time for sanity checks. Use this tool when the user asks about the current date or time.",
        json!({"type": "object", "properties": {}, "required": []}),
    )
}

pub fn date_tool_result() -> Value {
    let now = Utc::now();
    json!({
        "date": now.format("%Y-%m-%d").to_string(),
        "time": now.format("%H:%M:%S").to_string(),
        "timezone": "UTC",
        "timestamp": now.to_rfc3339(),
    })
}

/// Accepts an object or a JSON-encoded object. Anything else is `{}`.
pub fn normalize_input(input: Value) -> Value {
    match input {
        Value::Object(_) => input,
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => {
                tracing::debug!(input = %text, "tool input is not a JSON object");
                Value::Object(Map::new())
            }
        },
        _ => Value::Object(Map::new()),
    }
}

/// Closed set of tools, fixed at construction.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Every tool name, the built-in clock tool first.
    pub fn names(&self) -> Vec<String> {
        std::iter::once(DATE_TOOL.to_string())
            .chain(self.order.iter().cloned())
            .collect()
    }

    /// Tool catalog for `promptStart`.
    pub fn catalog(&self) -> Vec<ToolSpec> {
        std::iter::once(date_tool_spec())
            .chain(self.order.iter().filter_map(|n| self.handlers.get(n)).map(|h| h.spec()))
            .collect()
    }

    /// Runs a tool and always produces a result object.
    pub async fn execute(&self, tool_name: &str, input: Value) -> Value {
        if tool_name == DATE_TOOL {
            return date_tool_result();
        }
        let Some(handler) = self.handlers.get(tool_name).cloned() else {
            tracing::warn!(tool_name, "model called an unknown tool");
            return json!({
                "error": format!("Unknown tool: {tool_name}"),
                "available_tools": self.names(),
            });
        };

        // Run on its own task so a panicking handler still yields a result.
        match tokio::spawn(async move { handler.call(input).await }).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(tool_name, error = %e, "tool handler failed");
                json!({ "error": e.to_string() })
            }
            Err(e) => {
                tracing::error!(tool_name, error = %e, "tool handler panicked");
                json!({ "error": format!("tool {tool_name} failed unexpectedly") })
            }
        }
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
    order: Vec<String>,
}

impl ToolRegistryBuilder {
    /// Adds a handler. A later handler with the same name replaces the
    /// earlier one; the clock tool name is reserved.
    pub fn register(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        let name = handler.spec().name;
        if name == DATE_TOOL {
            tracing::warn!(tool_name = %name, "ignoring handler for reserved tool name");
            return self;
        }
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            handlers: self.handlers,
            order: self.order,
        }
    }
}

/// Informational tool activity forwarded to the client fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolActivity {
    pub subtype: ToolLogSubtype,
    pub tool_name: String,
    pub tool_use_id: String,
    pub payload: Value,
}

/// Runs tool uses for one engine; each correlation id is claimed once.
pub(crate) struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    seen: Mutex<HashSet<String>>,
}

impl ToolDispatcher {
    pub(crate) fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// `false` if this correlation id was already dispatched.
    pub(crate) fn claim(&self, tool_use_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_use_id.to_string())
    }

    pub(crate) async fn run(
        &self,
        tool_name: &str,
        tool_use_id: &str,
        input: Value,
        mut report: impl FnMut(ToolActivity),
    ) -> Value {
        let input = normalize_input(input);
        tracing::info!(tool_name, tool_use_id, "tool invocation");
        report(ToolActivity {
            subtype: ToolLogSubtype::Invocation,
            tool_name: tool_name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            payload: input.clone(),
        });

        let result = self.registry.execute(tool_name, input).await;

        tracing::info!(tool_name, tool_use_id, "tool result ready");
        report(ToolActivity {
            subtype: ToolLogSubtype::Result,
            tool_name: tool_name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            payload: result.clone(),
        });
        result
    }
}

/// `contentStart(TOOL) → toolResult → contentEnd` for one tool use.
pub fn tool_result_frames(prompt_name: &str, tool_use_id: &str, result: &Value) -> Vec<OutboundFrame> {
    let content_name = new_content_name();
    vec![
        build_content_start(
            prompt_name,
            &content_name,
            ContentKind::Tool,
            Role::Tool,
            false,
            MediaConfig::tool_result(tool_use_id),
        ),
        build_tool_result(prompt_name, &content_name, result),
        build_content_end(prompt_name, &content_name),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("echoTool", "Echo input", json!({"type": "object"}))
        }

        async fn call(&self, input: Value) -> Result<Value, ToolError> {
            Ok(json!({ "echo": input }))
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("failTool", "Always fails", json!({"type": "object"}))
        }

        async fn call(&self, _input: Value) -> Result<Value, ToolError> {
            Err(ToolError::Failed("backend down".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl ToolHandler for Panicking {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("panicTool", "Panics", json!({"type": "object"}))
        }

        async fn call(&self, _input: Value) -> Result<Value, ToolError> {
            panic!("handler bug")
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(Arc::new(Echo))
            .register(Arc::new(Failing))
            .register(Arc::new(Panicking))
            .build()
    }

    #[test]
    fn input_normalization() {
        assert_eq!(normalize_input(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(normalize_input(json!("{\"name\":\"Karina Soto\"}")), json!({"name": "Karina Soto"}));
        assert_eq!(normalize_input(json!("{broken")), json!({}));
        assert_eq!(normalize_input(json!("[1,2]")), json!({}));
        assert_eq!(normalize_input(Value::Null), json!({}));
    }

    #[test]
    fn catalog_lists_clock_tool_first() {
        let names: Vec<_> = registry().catalog().into_iter().map(|s| s.name).collect();
        assert_eq!(names, [DATE_TOOL, "echoTool", "failTool", "panicTool"]);
    }

    #[tokio::test]
    async fn clock_tool_is_built_in() {
        let result = ToolRegistry::default().execute(DATE_TOOL, json!({})).await;
        assert_eq!(result["timezone"], "UTC");
        assert!(result["date"].as_str().is_some());
        assert!(result["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn failures_become_error_results() {
        let registry = registry();
        let failed = registry.execute("failTool", json!({})).await;
        assert_eq!(failed["error"], "backend down");

        let panicked = registry.execute("panicTool", json!({})).await;
        assert!(panicked["error"].as_str().is_some());

        let unknown = registry.execute("nopeTool", json!({})).await;
        assert_eq!(unknown["error"], "Unknown tool: nopeTool");
        assert_eq!(unknown["available_tools"][0], DATE_TOOL);
    }

    #[tokio::test]
    async fn dispatcher_reports_activity_and_claims_once() {
        let dispatcher = ToolDispatcher::new(Arc::new(registry()));
        assert!(dispatcher.claim("t-1"));
        assert!(!dispatcher.claim("t-1"));

        let mut activity = Vec::new();
        let result = dispatcher
            .run("echoTool", "t-1", json!("{\"x\":1}"), |a| activity.push(a))
            .await;
        assert_eq!(result, json!({"echo": {"x": 1}}));
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].subtype, ToolLogSubtype::Invocation);
        assert_eq!(activity[0].payload, json!({"x": 1}));
        assert_eq!(activity[1].subtype, ToolLogSubtype::Result);
        assert_eq!(activity[1].payload, result);
    }

    #[test]
    fn result_frames_form_one_tool_block() {
        let frames = tool_result_frames("p", "t-1", &json!({"found": false}));
        let names: Vec<_> = frames.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["contentStart", "toolResult", "contentEnd"]);
        match &frames[0] {
            OutboundFrame::ContentStart(start) => {
                assert_eq!(start.kind, ContentKind::Tool);
                assert_eq!(start.role, Role::Tool);
                assert!(!start.interactive);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
