//! One conversation with the remote speech model.
//!
//! An [`Engine`] owns the outbound queue, the inbound decode loop, the turn
//! buffer and the event channel its single fan-out subscriber reads.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parley_protocol::{
    build_audio_input, build_content_end, build_content_start, build_prompt_end,
    build_prompt_start, build_session_end, build_session_start, build_text_input,
    new_content_name, parse_inbound_frame, AudioInputConfig, AudioOutputConfig, ContentKind,
    GenerationStage, InboundFrame, InferenceConfig, MediaConfig, OutboundFrame,
};
use parley_types::{is_interrupted, AudioFormat, Lifecycle, Role};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::compliance::{ComplianceFilter, NoncomplianceEvent};
use crate::error::{EngineError, TransportError};
use crate::history::{Checkpointer, TurnBuffer};
use crate::queue::OutboundQueue;
use crate::store::SessionStore;
use crate::tools::{tool_result_frames, ToolActivity, ToolDispatcher, ToolRegistry};
use crate::transport::{DuplexTransport, InboundStream};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly assistant. The user and you will engage in a spoken dialog exchanging the transcripts of a natural real-time conversation. Keep your responses short, generally two or three sentences for chatty scenarios.";

/// Engine-wide defaults; per-session overrides come from [`StartOptions`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub inference: InferenceConfig,
    pub audio_input: AudioInputConfig,
    pub audio_output: AudioOutputConfig,
    pub system_prompt: String,
    pub connect_timeout: Duration,
    /// How long `close` waits for the remote side to finish.
    pub close_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            audio_input: AudioInputConfig::default(),
            audio_output: AudioOutputConfig::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub system_prompt: Option<String>,
    pub user_id: Option<String>,
    /// Store session id whose history should be loaded into this engine.
    pub recover_from: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub voice_id: Option<String>,
}

/// Collaborators shared by every engine a registry creates.
#[derive(Clone)]
pub struct EngineDeps {
    pub transport: Arc<dyn DuplexTransport>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub compliance: Option<Arc<dyn ComplianceFilter>>,
    pub settings: EngineSettings,
}

/// What the engine reports to its fan-out subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// An inbound frame after role resolution and compliance filtering.
    Frame(InboundFrame),
    ToolLog(ToolActivity),
    /// Recoverable condition; the stream stays open.
    Status(String),
    /// `prepare_for_next_turn` closed turn number `n`.
    TurnCompleted(u64),
    /// The remote channel failed. Sent at most once.
    Terminal(String),
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub audio_bytes_sent: u64,
    pub audio_bytes_received: u64,
    pub inbound_messages: u64,
    pub turn_ordinal: u64,
    pub history_len: usize,
    pub active_stream: bool,
    pub barge_in: bool,
    pub noncompliance_count: usize,
    pub audio_block_open: bool,
    pub history_session_id: Option<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    role: Option<Role>,
    stage: Option<GenerationStage>,
    suppress_audio: bool,
    audio_block: Option<String>,
}

#[derive(Default)]
struct Stats {
    audio_bytes_sent: AtomicU64,
    audio_bytes_received: AtomicU64,
    inbound_messages: AtomicU64,
}

type EventSlot = Arc<Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Engine {
    session_id: String,
    prompt_name: String,
    created_at: DateTime<Utc>,
    inference: InferenceConfig,
    audio_input: AudioInputConfig,
    audio_output: AudioOutputConfig,
    system_prompt: String,
    close_timeout: Duration,

    queue: Arc<OutboundQueue>,
    tools: Arc<ToolRegistry>,
    dispatcher: ToolDispatcher,
    compliance: Option<Arc<dyn ComplianceFilter>>,
    checkpoint: Checkpointer,

    lifecycle: Mutex<Lifecycle>,
    stream: Mutex<StreamState>,
    turns: Mutex<TurnBuffer>,
    history_session_id: Mutex<Option<String>>,
    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    stats: Stats,
    barge_in: AtomicBool,
    noncompliance: Mutex<Vec<NoncomplianceEvent>>,
    terminal_sent: AtomicBool,
    closing: AtomicBool,
    tools_in_flight: AtomicUsize,
    tools_idle: Notify,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_slot: EventSlot,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session_id", &self.session_id)
            .field("prompt_name", &self.prompt_name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Engine {
    fn new(session_id: String, options: &StartOptions, deps: &EngineDeps) -> Arc<Self> {
        let settings = &deps.settings;
        let mut inference = settings.inference;
        if let Some(t) = options.temperature {
            inference.temperature = t;
        }
        if let Some(m) = options.max_tokens {
            inference.max_tokens = m;
        }
        if let Some(p) = options.top_p {
            inference.top_p = p;
        }
        let mut audio_output = settings.audio_output.clone();
        if let Some(voice) = &options.voice_id {
            audio_output.voice_id = voice.clone();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = Utc::now();

        Arc::new(Self {
            session_id,
            prompt_name: new_content_name(),
            created_at: now,
            inference,
            audio_input: settings.audio_input,
            audio_output,
            system_prompt: options
                .system_prompt
                .clone()
                .unwrap_or_else(|| settings.system_prompt.clone()),
            close_timeout: settings.close_timeout,
            queue: OutboundQueue::new(),
            tools: Arc::clone(&deps.tools),
            dispatcher: ToolDispatcher::new(Arc::clone(&deps.tools)),
            compliance: deps.compliance.clone(),
            checkpoint: Checkpointer::new(Arc::clone(&deps.store), options.user_id.clone()),
            lifecycle: Mutex::new(Lifecycle::Created),
            stream: Mutex::new(StreamState::default()),
            turns: Mutex::new(TurnBuffer::new()),
            history_session_id: Mutex::new(None),
            last_activity: Mutex::new((Instant::now(), now)),
            stats: Stats::default(),
            barge_in: AtomicBool::new(false),
            noncompliance: Mutex::new(Vec::new()),
            terminal_sent: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            tools_in_flight: AtomicUsize::new(0),
            tools_idle: Notify::new(),
            events_tx,
            events_slot: Arc::new(Mutex::new(Some(events_rx))),
            inbound_task: Mutex::new(None),
        })
    }

    /// Builds an engine, queues the handshake, loads history when asked to,
    /// and opens the remote channel.
    pub async fn start(
        session_id: String,
        options: StartOptions,
        deps: &EngineDeps,
    ) -> Result<Arc<Self>, EngineError> {
        let engine = Self::new(session_id, &options, deps);
        engine.queue.enqueue_all(engine.handshake_frames())?;

        let recovered = match &options.recover_from {
            Some(store_session) => match engine.load_history(store_session).await {
                Ok(count) => {
                    tracing::info!(
                        session_id = %engine.session_id,
                        history_session_id = %store_session,
                        entries = count,
                        "history recovered"
                    );
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %engine.session_id,
                        history_session_id = %store_session,
                        error = %e,
                        "history recovery failed; starting fresh"
                    );
                    false
                }
            },
            None => false,
        };
        if recovered {
            let replay = lock(&engine.turns).replay_frames(&engine.prompt_name);
            engine.queue.enqueue_all(replay)?;
        } else {
            let store_session = engine.checkpoint.begin(&engine.session_id).await;
            *lock(&engine.history_session_id) = store_session;
        }

        let opened = tokio::time::timeout(
            deps.settings.connect_timeout,
            deps.transport.open(&engine.session_id, engine.queue.frames()),
        )
        .await
        .unwrap_or(Err(TransportError::ConnectTimeout));
        let inbound = match opened {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::error!(session_id = %engine.session_id, error = %e, "failed to open model stream");
                engine.set_lifecycle(Lifecycle::Errored);
                engine.queue.close();
                return Err(e.into());
            }
        };

        engine.set_lifecycle(Lifecycle::Streaming);
        let task = tokio::spawn(Arc::clone(&engine).run_inbound(inbound));
        *lock(&engine.inbound_task) = Some(task);
        tracing::info!(session_id = %engine.session_id, "engine streaming");
        Ok(engine)
    }

    fn handshake_frames(&self) -> Vec<OutboundFrame> {
        let content_name = new_content_name();
        vec![
            build_session_start(&self.inference),
            build_prompt_start(&self.prompt_name, &self.audio_output, &self.tools.catalog()),
            build_content_start(
                &self.prompt_name,
                &content_name,
                ContentKind::Text,
                Role::System,
                true,
                MediaConfig::text(),
            ),
            build_text_input(&self.prompt_name, &content_name, &self.system_prompt),
            build_content_end(&self.prompt_name, &content_name),
        ]
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn prompt_name(&self) -> &str {
        &self.prompt_name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        *lock(&self.lifecycle) = next;
    }

    /// Output audio format attached to relayed audio.
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.audio_output.sample_rate_hertz,
            channels: self.audio_output.channel_count,
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closing.load(Ordering::SeqCst)
            || self.lifecycle().is_terminal()
            || self.queue.is_closed()
        {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = (Instant::now(), Utc::now());
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_activity).0.elapsed()
    }

    fn publish(&self, event: EngineEvent) {
        // The receiver lives in the slot or with the subscriber for as long
        // as the engine does.
        let _ = self.events_tx.send(event);
    }

    // ── audio ────────────────────────────────────────────────────────────

    fn ensure_audio_block(&self, stream: &mut StreamState) -> Result<String, EngineError> {
        if let Some(name) = &stream.audio_block {
            return Ok(name.clone());
        }
        let name = new_content_name();
        self.queue.enqueue(build_content_start(
            &self.prompt_name,
            &name,
            ContentKind::Audio,
            Role::User,
            true,
            MediaConfig::audio(&self.audio_input),
        ))?;
        tracing::debug!(session_id = %self.session_id, content_name = %name, "audio block opened");
        stream.audio_block = Some(name.clone());
        Ok(name)
    }

    /// Opens a user audio block unless one is already open.
    pub fn start_audio_content(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut stream = lock(&self.stream);
        self.ensure_audio_block(&mut stream)?;
        Ok(())
    }

    /// Queues raw PCM bytes, opening an audio block if needed.
    pub fn add_audio_chunk(&self, pcm: &[u8]) -> Result<(), EngineError> {
        self.ensure_open()?;
        let payload = BASE64.encode(pcm);
        {
            let mut stream = lock(&self.stream);
            let name = self.ensure_audio_block(&mut stream)?;
            self.queue
                .enqueue(build_audio_input(&self.prompt_name, &name, &payload))?;
        }
        self.stats
            .audio_bytes_sent
            .fetch_add(pcm.len() as u64, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Closes the open audio block, if any.
    pub fn end_audio_content(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.close_audio_block(&mut lock(&self.stream))?;
        self.touch();
        Ok(())
    }

    fn close_audio_block(&self, stream: &mut StreamState) -> Result<(), EngineError> {
        if let Some(name) = stream.audio_block.take() {
            self.queue
                .enqueue(build_content_end(&self.prompt_name, &name))?;
            tracing::debug!(session_id = %self.session_id, content_name = %name, "audio block closed");
        }
        Ok(())
    }

    // ── turns ────────────────────────────────────────────────────────────

    /// Closes the current turn and, when there is any history, replays all
    /// of it ahead of the next user block.
    pub async fn prepare_for_next_turn(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        let (closed, ordinal) = {
            // Holding the stream lock keeps a concurrent audio chunk from
            // opening its block between the close and the replay.
            let mut stream = lock(&self.stream);
            self.close_audio_block(&mut stream)?;
            let mut turns = lock(&self.turns);
            let closed = turns.complete_turn();
            if turns.has_context() {
                self.queue
                    .enqueue_all(turns.replay_frames(&self.prompt_name))?;
            }
            tracing::debug!(
                session_id = %self.session_id,
                ordinal = turns.ordinal(),
                history = turns.entries().len(),
                "turn completed"
            );
            (closed, turns.ordinal())
        };
        self.publish(EngineEvent::TurnCompleted(ordinal));
        self.checkpoint.persist(&self.session_id, &closed).await;
        self.touch();
        Ok(())
    }

    /// Replaces in-memory history with the latest checkpoint stored under
    /// `store_session_id`. Returns the number of entries loaded.
    pub async fn load_history(&self, store_session_id: &str) -> Result<usize, EngineError> {
        let entries = self
            .checkpoint
            .restore(store_session_id)
            .await
            .map_err(EngineError::History)?;
        let count = entries.len();
        lock(&self.turns).restore(entries);
        *lock(&self.history_session_id) = Some(store_session_id.to_string());
        Ok(count)
    }

    // ── events ───────────────────────────────────────────────────────────

    /// Claims the event stream. Fails while another subscription is live,
    /// and with [`EngineError::Closed`] once the engine has errored or begun
    /// closing. Subscribing opens a user audio block so audio can flow
    /// right away.
    pub fn subscribe(&self) -> Result<EventSubscription, EngineError> {
        self.ensure_open()?;
        let rx = lock(&self.events_slot)
            .take()
            .ok_or(EngineError::AlreadySubscribed)?;
        let subscription = EventSubscription {
            rx: Some(rx),
            slot: Arc::clone(&self.events_slot),
            session_id: self.session_id.clone(),
        };
        if let Err(e) = self.start_audio_content() {
            tracing::debug!(session_id = %self.session_id, error = %e, "no audio block on subscribe");
        }
        tracing::info!(session_id = %self.session_id, "event stream attached");
        Ok(subscription)
    }

    pub fn has_active_stream(&self) -> bool {
        lock(&self.events_slot).is_none()
    }

    pub fn info(&self) -> SessionInfo {
        let turns = lock(&self.turns);
        let (ordinal, history_len) = (turns.ordinal(), turns.entries().len());
        drop(turns);
        SessionInfo {
            session_id: self.session_id.clone(),
            lifecycle: self.lifecycle(),
            created_at: self.created_at,
            last_activity: lock(&self.last_activity).1,
            audio_bytes_sent: self.stats.audio_bytes_sent.load(Ordering::Relaxed),
            audio_bytes_received: self.stats.audio_bytes_received.load(Ordering::Relaxed),
            inbound_messages: self.stats.inbound_messages.load(Ordering::Relaxed),
            turn_ordinal: ordinal,
            history_len,
            active_stream: self.has_active_stream(),
            barge_in: self.barge_in.load(Ordering::Relaxed),
            noncompliance_count: lock(&self.noncompliance).len(),
            audio_block_open: lock(&self.stream).audio_block.is_some(),
            history_session_id: lock(&self.history_session_id).clone(),
        }
    }

    pub fn history_session_id(&self) -> Option<String> {
        lock(&self.history_session_id).clone()
    }

    /// Assistant fragments the compliance filter blocked, oldest first.
    pub fn noncompliance_events(&self) -> Vec<NoncomplianceEvent> {
        lock(&self.noncompliance).clone()
    }

    // ── inbound ──────────────────────────────────────────────────────────

    async fn run_inbound(self: Arc<Self>, mut inbound: InboundStream) {
        while let Some(item) = inbound.next().await {
            match item {
                Ok(text) => {
                    self.stats.inbound_messages.fetch_add(1, Ordering::Relaxed);
                    self.touch();
                    match parse_inbound_frame(&text) {
                        Ok(frame) => self.handle_frame(frame).await,
                        Err(e) => {
                            tracing::debug!(session_id = %self.session_id, error = %e, "skipping undecodable message")
                        }
                    }
                }
                Err(e) => {
                    self.fail(format!("model stream error: {e}"));
                    return;
                }
            }
            if self.lifecycle() == Lifecycle::Errored {
                return;
            }
        }
        if !self.closing.load(Ordering::SeqCst) {
            self.fail("model stream ended unexpectedly".to_string());
        }
        tracing::debug!(session_id = %self.session_id, "inbound loop finished");
    }

    /// Marks the channel failed and reports it once.
    fn fail(&self, message: String) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(session_id = %self.session_id, error = %message, "model stream failed");
        {
            let mut lifecycle = lock(&self.lifecycle);
            if *lifecycle != Lifecycle::Closed {
                *lifecycle = Lifecycle::Errored;
            }
        }
        self.queue.close();
        self.publish(EngineEvent::Terminal(message));
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::ContentStart {
                role,
                content_id,
                kind,
                generation_stage,
            } => {
                {
                    let mut stream = lock(&self.stream);
                    stream.role = role.or(stream.role);
                    stream.stage = generation_stage;
                    if role == Some(Role::User) {
                        stream.suppress_audio = false;
                    }
                }
                self.publish(EngineEvent::Frame(InboundFrame::ContentStart {
                    role,
                    content_id,
                    kind,
                    generation_stage,
                }));
            }
            InboundFrame::TextOutput { role, content } => self.handle_text(role, content),
            InboundFrame::AudioOutput { content } => {
                if lock(&self.stream).suppress_audio {
                    tracing::trace!(session_id = %self.session_id, "assistant audio muted");
                    return;
                }
                self.stats
                    .audio_bytes_received
                    .fetch_add((content.len() as u64 / 4) * 3, Ordering::Relaxed);
                self.publish(EngineEvent::Frame(InboundFrame::AudioOutput { content }));
            }
            InboundFrame::ToolUse {
                tool_name,
                tool_use_id,
                input,
            } => self.handle_tool_use(tool_name, tool_use_id, input).await,
            InboundFrame::Error(err) if err.is_expected() => {
                tracing::info!(session_id = %self.session_id, message = %err.message, "expected model error");
                self.publish(EngineEvent::Status(err.message));
            }
            InboundFrame::Error(err) => self.fail(err.message),
            InboundFrame::RawData(raw) => {
                tracing::debug!(session_id = %self.session_id, len = raw.len(), "raw data from model");
                self.publish(EngineEvent::Frame(InboundFrame::RawData(raw)));
            }
            other => {
                tracing::trace!(session_id = %self.session_id, frame = other.name(), "inbound frame");
                self.publish(EngineEvent::Frame(other));
            }
        }
    }

    fn handle_text(&self, role: Option<Role>, content: String) {
        let (role, stage) = {
            let stream = lock(&self.stream);
            (role.or(stream.role).unwrap_or(Role::Assistant), stream.stage)
        };

        if is_interrupted(&content) {
            self.barge_in.store(true, Ordering::Relaxed);
            tracing::info!(session_id = %self.session_id, "barge-in detected");
            self.publish(EngineEvent::Frame(InboundFrame::TextOutput {
                role: Some(role),
                content,
            }));
            return;
        }

        let mut text = content;
        if role == Role::Assistant {
            if let Some(filter) = &self.compliance {
                let verdict = filter.check(&text, role);
                if verdict.block {
                    let event = NoncomplianceEvent::new(&text, &verdict);
                    tracing::warn!(
                        session_id = %self.session_id,
                        rules = ?event.matched_rules,
                        original_text_hash = %event.original_text_hash,
                        "assistant text blocked by compliance filter"
                    );
                    lock(&self.noncompliance).push(event);
                    lock(&self.stream).suppress_audio = true;
                    match verdict.replacement_text {
                        Some(replacement) => text = replacement,
                        None => return,
                    }
                }
            }
        }

        if stage != Some(GenerationStage::Speculative) || role != Role::Assistant {
            lock(&self.turns).push_fragment(role, &text);
        }
        self.publish(EngineEvent::Frame(InboundFrame::TextOutput {
            role: Some(role),
            content: text,
        }));
    }

    async fn handle_tool_use(&self, tool_name: String, tool_use_id: String, input: serde_json::Value) {
        if !self.dispatcher.claim(&tool_use_id) {
            tracing::debug!(session_id = %self.session_id, tool_use_id = %tool_use_id, "duplicate tool use ignored");
            return;
        }
        self.tools_in_flight.fetch_add(1, Ordering::SeqCst);
        self.answer_tool_use(tool_name, tool_use_id, input).await;
        if self.tools_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tools_idle.notify_waiters();
        }
    }

    async fn answer_tool_use(&self, tool_name: String, tool_use_id: String, input: serde_json::Value) {
        self.publish(EngineEvent::Frame(InboundFrame::ToolUse {
            tool_name: tool_name.clone(),
            tool_use_id: tool_use_id.clone(),
            input: input.clone(),
        }));

        let result = self
            .dispatcher
            .run(&tool_name, &tool_use_id, input, |activity| {
                self.publish(EngineEvent::ToolLog(activity))
            })
            .await;

        let frames = tool_result_frames(&self.prompt_name, &tool_use_id, &result);
        if let Err(e) = self.queue.enqueue_all(frames) {
            tracing::warn!(
                session_id = %self.session_id,
                tool_use_id = %tool_use_id,
                error = %e,
                "tool result dropped"
            );
        }
    }

    // ── teardown ─────────────────────────────────────────────────────────

    async fn wait_for_tools(&self) {
        loop {
            let idle = self.tools_idle.notified();
            if self.tools_in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Ends the conversation. Tool calls already running get to queue
    /// their results, then every queued frame is flushed before the channel
    /// is torn down. Safe to call more than once.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut lifecycle = lock(&self.lifecycle);
            if !lifecycle.is_terminal() {
                *lifecycle = Lifecycle::Draining;
            }
        }

        if tokio::time::timeout(self.close_timeout, self.wait_for_tools())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.session_id, "tool call still running at close");
        }

        let mut frames = Vec::new();
        if let Some(name) = lock(&self.stream).audio_block.take() {
            frames.push(build_content_end(&self.prompt_name, &name));
        }
        frames.push(build_prompt_end(&self.prompt_name));
        frames.push(build_session_end());
        if let Err(e) = self.queue.enqueue_all(frames) {
            tracing::debug!(session_id = %self.session_id, error = %e, "closing frames not sent");
        }
        self.queue.close();

        let task = lock(&self.inbound_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                tracing::warn!(session_id = %self.session_id, "model stream did not finish in time");
                task.abort();
            }
        }

        self.set_lifecycle(Lifecycle::Closed);
        self.publish(EngineEvent::Closed);
        tracing::info!(session_id = %self.session_id, "engine closed");
    }
}

/// Exclusive handle on an engine's event stream. Dropping it frees the
/// stream for the next subscriber.
pub struct EventSubscription {
    rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    slot: EventSlot,
    session_id: String,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.as_mut()?.recv().await
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            *lock(&self.slot) = Some(rx);
            tracing::info!(session_id = %self.session_id, "event stream detached");
        }
    }
}
