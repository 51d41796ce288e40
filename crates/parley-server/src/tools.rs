//! CRM tool handlers offered to the speech model.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parley_db::CallRecord;
use parley_engine::{ToolError, ToolHandler, ToolRegistry};
use parley_protocol::ToolSpec;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::records::RecordStore;
use crate::webhook::{Delivery, WebhookClient};

pub const LOOKUP_HCP_TOOL: &str = "lookupHcpTool";
pub const INSERT_CALL_TOOL: &str = "insertCallTool";
pub const EMIT_EVENT_TOOL: &str = "emitN8nEventTool";
pub const FOLLOW_UP_TOOL: &str = "createFollowUpTaskTool";

/// Builds the registry with every CRM tool.
pub fn crm_tools(records: Arc<dyn RecordStore>, webhook: WebhookClient) -> ToolRegistry {
    ToolRegistry::builder()
        .register(Arc::new(LookupHcpTool {
            records: Arc::clone(&records),
        }))
        .register(Arc::new(InsertCallTool { records }))
        .register(Arc::new(EmitEventTool {
            webhook: webhook.clone(),
        }))
        .register(Arc::new(CreateFollowUpTaskTool { webhook }))
        .build()
}

pub struct LookupHcpTool {
    records: Arc<dyn RecordStore>,
}

#[async_trait]
impl ToolHandler for LookupHcpTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            LOOKUP_HCP_TOOL,
            "Look up a healthcare professional (HCP) by name and return their id and organization.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "HCP name to search for"}
                },
                "required": ["name"]
            }),
        )
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let name = input["name"].as_str().unwrap_or_default().trim();
        if name.chars().count() < 2 {
            tracing::warn!(name, "hcp lookup name too short");
            return Ok(json!({
                "found": false,
                "hcp_id": null,
                "hco_id": null,
                "hco_name": null,
                "error": "Name must be at least 2 characters",
            }));
        }

        let found = self
            .records
            .lookup_hcp(name)
            .await
            .map_err(|e| ToolError::Failed(format!("HCP lookup failed: {e}")))?;
        Ok(match found {
            Some(hcp) => {
                tracing::info!(name, hcp_id = %hcp.hcp_id, "hcp found");
                json!({
                    "found": true,
                    "name": hcp.name,
                    "hcp_id": hcp.hcp_id,
                    "hco_id": hcp.hco_id,
                    "hco_name": hcp.hco_name,
                })
            }
            None => {
                tracing::info!(name, "hcp not found");
                json!({"found": false, "hcp_id": null, "hco_id": null, "hco_name": null})
            }
        })
    }
}

pub struct InsertCallTool {
    records: Arc<dyn RecordStore>,
}

#[async_trait]
impl ToolHandler for InsertCallTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            INSERT_CALL_TOOL,
            "Persist the final call record once the user has confirmed it.",
            json!({
                "type": "object",
                "properties": {
                    "record": {"type": "object", "description": "Complete call record JSON"}
                },
                "required": ["record"]
            }),
        )
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let record = match input.get("record") {
            Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()),
            _ => return Ok(json!({"ok": false, "error": "No record provided"})),
        };
        let record: CallRecord = match serde_json::from_value(record) {
            Ok(record) => record,
            Err(e) => return Ok(json!({"ok": false, "error": format!("invalid call record: {e}")})),
        };

        match self.records.insert_call(record).await {
            Ok(call_pk) => Ok(json!({"ok": true, "call_pk": call_pk})),
            Err(e) => {
                tracing::error!(error = %e, "failed to insert call");
                Ok(json!({"ok": false, "error": e.to_string()}))
            }
        }
    }
}

pub struct EmitEventTool {
    webhook: WebhookClient,
}

async fn emit(webhook: &WebhookClient, event_type: &str, payload: Value) -> Value {
    match webhook.emit(event_type, payload).await {
        Ok(Delivery::Sent { status }) => json!({"ok": true, "status_code": status}),
        Ok(Delivery::Skipped) => json!({"ok": true, "message": "webhook not configured (skipped)"}),
        Err(e) => json!({"ok": false, "error": e.to_string()}),
    }
}

#[async_trait]
impl ToolHandler for EmitEventTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            EMIT_EVENT_TOOL,
            "Send a saved call and session metadata to the automation webhook.",
            json!({
                "type": "object",
                "properties": {
                    "eventType": {"type": "string", "description": "Event type, e.g. 'call.saved'"},
                    "payload": {"type": "object", "description": "Event payload data"}
                },
                "required": ["eventType", "payload"]
            }),
        )
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let event_type = input["eventType"].as_str().unwrap_or_default();
        if event_type.is_empty() {
            return Ok(json!({"ok": false, "error": "No eventType provided"}));
        }
        let payload = input.get("payload").cloned().unwrap_or_else(|| json!({}));
        Ok(emit(&self.webhook, event_type, payload).await)
    }
}

pub struct CreateFollowUpTaskTool {
    webhook: WebhookClient,
}

#[async_trait]
impl ToolHandler for CreateFollowUpTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            FOLLOW_UP_TOOL,
            "Create a follow-up task when the call record includes call_follow_up_task.task_type.",
            json!({
                "type": "object",
                "properties": {
                    "task": {
                        "type": "object",
                        "description": "Task details (task_type, description, due_date, assigned_to)"
                    }
                },
                "required": ["task"]
            }),
        )
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        let task = input.get("task").cloned().unwrap_or(Value::Null);
        let has_type = task["task_type"].as_str().is_some_and(|t| !t.is_empty());
        if !has_type {
            return Ok(json!({"ok": false, "error": "No task or task_type provided"}));
        }

        let delivered = emit(
            &self.webhook,
            "task.created",
            json!({"task": task, "created_at": Utc::now().to_rfc3339()}),
        )
        .await;
        if delivered["ok"] != true {
            return Ok(json!({
                "ok": false,
                "error": format!("Failed to emit task event: {}", delivered["error"]),
            }));
        }

        let hex = Uuid::new_v4().simple().to_string().to_uppercase();
        let external_task_id = format!("TASK_{}", &hex[..8]);
        tracing::info!(external_task_id = %external_task_id, "follow-up task created");
        Ok(json!({"ok": true, "external_task_id": external_task_id}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::records::RecordStoreError;
    use parley_db::HcpRecord;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRecords {
        calls: Mutex<Vec<CallRecord>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecords {
        async fn insert_call(&self, record: CallRecord) -> Result<String, RecordStoreError> {
            self.calls.lock().expect("lock").push(record);
            Ok("CALL_000000000001".to_string())
        }

        async fn lookup_hcp(&self, name: &str) -> Result<Option<HcpRecord>, RecordStoreError> {
            Ok((name == "Dr. Harper").then(|| HcpRecord {
                hcp_id: "HCP_7".to_string(),
                name: "Dr. Harper".to_string(),
                hco_id: None,
                hco_name: None,
            }))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    fn webhook() -> WebhookClient {
        WebhookClient::new(&WebhookConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn lookup_rejects_short_names() {
        let tool = LookupHcpTool {
            records: Arc::new(FakeRecords::default()),
        };
        let result = tool.call(json!({"name": " K "})).await.expect("result");
        assert_eq!(result["found"], false);
        assert!(result["error"].is_string());

        let result = tool.call(json!({"name": "Dr. Harper"})).await.expect("result");
        assert_eq!(result["found"], true);
        assert_eq!(result["hcp_id"], "HCP_7");

        let result = tool.call(json!({"name": "Karina Soto"})).await.expect("result");
        assert_eq!(result, json!({"found": false, "hcp_id": null, "hco_id": null, "hco_name": null}));
    }

    #[tokio::test]
    async fn insert_call_applies_record_defaults() {
        let records = Arc::new(FakeRecords::default());
        let tool = InsertCallTool {
            records: records.clone(),
        };
        assert_eq!(tool.call(json!({})).await.expect("result")["ok"], false);

        let result = tool
            .call(json!({"record": {"account": "Dr. Harper", "product": "Cardiozen"}}))
            .await
            .expect("result");
        assert_eq!(result, json!({"ok": true, "call_pk": "CALL_000000000001"}));
        let stored = records.calls.lock().expect("lock");
        assert_eq!(stored[0].call_channel, "In-person");
        assert_eq!(stored[0].product, "Cardiozen");
    }

    #[tokio::test]
    async fn unconfigured_webhook_is_skipped_not_failed() {
        let tool = EmitEventTool { webhook: webhook() };
        let result = tool
            .call(json!({"eventType": "call.saved", "payload": {"call_pk": "CALL_1"}}))
            .await
            .expect("result");
        assert_eq!(result["ok"], true);
        assert_eq!(tool.call(json!({})).await.expect("result")["ok"], false);
    }

    #[tokio::test]
    async fn follow_up_needs_a_task_type() {
        let tool = CreateFollowUpTaskTool { webhook: webhook() };
        let missing = tool.call(json!({"task": {"description": "x"}})).await.expect("result");
        assert_eq!(missing["ok"], false);

        let created = tool
            .call(json!({"task": {"task_type": "Email", "due_date": "2025-11-13"}}))
            .await
            .expect("result");
        assert_eq!(created["ok"], true);
        let id = created["external_task_id"].as_str().expect("id");
        assert!(id.starts_with("TASK_"));
        assert_eq!(id.len(), 13);
    }

    #[test]
    fn registry_advertises_every_tool() {
        let registry = crm_tools(Arc::new(FakeRecords::default()), webhook());
        assert_eq!(
            registry.names(),
            ["getDateTool", LOOKUP_HCP_TOOL, INSERT_CALL_TOOL, EMIT_EVENT_TOOL, FOLLOW_UP_TOOL]
        );
    }
}
