use parley_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("outbound queue is closed")]
    Closed,

    #[error("content block {0} is already open")]
    DuplicateContent(String),

    #[error("content block {0} is not open")]
    UnknownContent(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to model endpoint: {0}")]
    Connect(String),

    #[error("timed out connecting to model endpoint")]
    ConnectTimeout,

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("failed to receive frame: {0}")]
    Receive(String),

    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine is closed")]
    Closed,

    #[error("event stream already has a subscriber")]
    AlreadySubscribed,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("history unavailable: {0}")]
    History(StoreError),
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    #[error("history record not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("invalid tool input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("session limit reached ({max} active sessions)")]
    AtCapacity { max: usize },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Engine(#[from] EngineError),
}
