#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_engine::testing::{RemoteEnd, ScriptedTransport};
use parley_engine::{
    ComplianceFilter, Engine, EngineDeps, EngineEvent, EngineSettings, EventSubscription,
    MemorySessionStore, StartOptions, ToolError, ToolHandler, ToolRegistry,
};
use parley_protocol::{InboundFrame, ToolSpec};
use serde_json::{json, Value};

pub struct LookupHcp;

#[async_trait]
impl ToolHandler for LookupHcp {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "lookupHcpTool",
            "Look up a healthcare professional by name",
            json!({"type": "object", "properties": {"name": {"type": "string"}}, "required": ["name"]}),
        )
    }

    async fn call(&self, input: Value) -> Result<Value, ToolError> {
        assert_eq!(input["name"], "Karina Soto");
        Ok(json!({"found": false}))
    }
}

pub struct Exploding;

#[async_trait]
impl ToolHandler for Exploding {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("explodingTool", "Always fails", json!({"type": "object"}))
    }

    async fn call(&self, _input: Value) -> Result<Value, ToolError> {
        panic!("handler bug")
    }
}

/// Answers after a pause, long enough for a test to close the engine
/// while the call is running.
pub struct SlowTool;

#[async_trait]
impl ToolHandler for SlowTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("slowTool", "Answers after a pause", json!({"type": "object"}))
    }

    async fn call(&self, _input: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(json!({"ok": true}))
    }
}

pub struct Harness {
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemorySessionStore>,
    pub deps: EngineDeps,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_compliance(None)
    }

    pub fn with_compliance(compliance: Option<Arc<dyn ComplianceFilter>>) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemorySessionStore::new());
        let tools = ToolRegistry::builder()
            .register(Arc::new(LookupHcp))
            .register(Arc::new(Exploding))
            .register(Arc::new(SlowTool))
            .build();
        let deps = EngineDeps {
            transport: transport.clone(),
            tools: Arc::new(tools),
            store: store.clone(),
            compliance,
            settings: EngineSettings {
                system_prompt: "You are a CRM assistant.".to_string(),
                close_timeout: Duration::from_secs(2),
                ..EngineSettings::default()
            },
        };
        Self {
            transport,
            store,
            deps,
        }
    }

    /// Starts an engine and consumes its five-frame handshake.
    pub async fn start(&self, options: StartOptions) -> (Arc<Engine>, RemoteEnd) {
        let engine = Engine::start("s-test".to_string(), options, &self.deps)
            .await
            .expect("engine starts");
        let mut remote = self.transport.next_remote().await.expect("remote end");
        for expected in ["sessionStart", "promptStart", "contentStart", "textInput", "contentEnd"] {
            let (name, _) = recv(&mut remote).await;
            assert_eq!(name, expected);
        }
        (engine, remote)
    }
}

pub async fn recv(remote: &mut RemoteEnd) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(5), remote.recv_frame())
        .await
        .expect("frame in time")
        .expect("writer still open")
}

pub async fn next_event(sub: &mut EventSubscription) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("event in time")
        .expect("engine alive")
}

/// Skips events until a transcript fragment arrives.
pub async fn next_text(sub: &mut EventSubscription) -> String {
    loop {
        if let EngineEvent::Frame(InboundFrame::TextOutput { content, .. }) = next_event(sub).await {
            return content;
        }
    }
}

pub fn content_start(remote: &RemoteEnd, role: &str) {
    remote.send_event("contentStart", json!({"role": role, "type": "TEXT"}));
}

pub fn text_output(remote: &RemoteEnd, role: &str, text: &str) {
    remote.send_event("textOutput", json!({"role": role, "content": text}));
}
