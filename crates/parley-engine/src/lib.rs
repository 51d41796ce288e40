//! Conversation engine for bidirectional speech-model sessions.
//!
//! An [`Engine`] keeps one streaming conversation alive: it queues protocol
//! frames for the remote model, decodes what comes back, answers tool
//! calls, accumulates turn history and publishes events to a single
//! fan-out subscriber. The [`SessionRegistry`] owns every live engine and
//! reaps idle ones.
//!
//! The remote channel sits behind [`DuplexTransport`]; [`WsTransport`] is the
//! WebSocket implementation and [`testing::ScriptedTransport`] an
//! in-process one for tests.

pub mod compliance;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod history;
pub mod queue;
pub mod registry;
pub mod store;
pub mod testing;
pub mod tools;
pub mod transport;
pub mod ws;

pub use compliance::{ComplianceAction, ComplianceFilter, ComplianceVerdict, NoncomplianceEvent};
pub use engine::{
    Engine, EngineDeps, EngineEvent, EngineSettings, EventSubscription, SessionInfo,
    StartOptions, DEFAULT_SYSTEM_PROMPT,
};
pub use error::{EngineError, QueueError, RegistryError, StoreError, ToolError, TransportError};
pub use fanout::{external_events, FanOut, Relay, TranscriptDeduper};
pub use history::{Checkpointer, TurnBuffer};
pub use queue::{OutboundFrames, OutboundQueue};
pub use registry::{RegistrySettings, SessionRegistry};
pub use store::{MemorySessionStore, SessionStore};
pub use tools::{
    date_tool_result, date_tool_spec, normalize_input, tool_result_frames, ToolActivity,
    ToolHandler, ToolRegistry, ToolRegistryBuilder, DATE_TOOL,
};
pub use transport::{DuplexTransport, InboundStream};
pub use ws::{WsTransport, WsTransportConfig};
