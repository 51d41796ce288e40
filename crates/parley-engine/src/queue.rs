//! The single outbound frame queue feeding the remote duplex channel.
//!
//! Producers (audio chunks, tool results, history replay, the handshake)
//! push synchronously; exactly one [`OutboundFrames`] consumer pulls. The
//! queue also enforces content-block pairing: a block name cannot be
//! opened while already open, is written only while open, and is closed
//! exactly once.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use parley_protocol::{OutboundFrame, Pairing};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

/// Safety-net wake-up for a pending `next()`; the primary wake-up is the
/// notify/cancel pair.
const FALLBACK_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct QueueState {
    frames: VecDeque<OutboundFrame>,
    open_blocks: HashSet<String>,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl OutboundQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned queue still holds consistent frames; keep draining.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends one frame. Fails once [`close`](Self::close) has been called.
    pub fn enqueue(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.enqueue_all(vec![frame])
    }

    /// Appends frames as one contiguous run; either all are queued or none.
    pub fn enqueue_all(&self, frames: Vec<OutboundFrame>) -> Result<(), QueueError> {
        if frames.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            validate_pairing(&state, &frames)?;
            for frame in frames {
                match frame.pairing() {
                    Pairing::Opens(name) => {
                        state.open_blocks.insert(name.to_string());
                    }
                    Pairing::Closes(name) => {
                        state.open_blocks.remove(name);
                    }
                    Pairing::Uses(_) | Pairing::Unscoped => {}
                }
                tracing::trace!(frame = frame.name(), "frame queued");
                state.frames.push_back(frame);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Stops accepting frames. Frames already queued are still delivered.
    pub fn close(&self) {
        let already = {
            let mut state = self.lock();
            std::mem::replace(&mut state.closed, true)
        };
        if !already {
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content blocks opened but not yet closed.
    pub fn open_blocks(&self) -> Vec<String> {
        self.lock().open_blocks.iter().cloned().collect()
    }

    /// The pull side. Only one should exist per queue.
    pub fn frames(self: &Arc<Self>) -> OutboundFrames {
        OutboundFrames {
            queue: Arc::clone(self),
        }
    }

    fn pop(&self) -> Popped {
        let mut state = self.lock();
        match state.frames.pop_front() {
            Some(frame) => Popped::Frame(frame),
            None if state.closed => Popped::Finished,
            None => Popped::Empty,
        }
    }
}

fn validate_pairing(state: &QueueState, frames: &[OutboundFrame]) -> Result<(), QueueError> {
    let mut opened: HashSet<&str> = HashSet::new();
    let mut closed: HashSet<&str> = HashSet::new();
    for frame in frames {
        match frame.pairing() {
            Pairing::Opens(name) => {
                if state.open_blocks.contains(name) || !opened.insert(name) {
                    return Err(QueueError::DuplicateContent(name.to_string()));
                }
            }
            Pairing::Uses(name) | Pairing::Closes(name) => {
                let open = (state.open_blocks.contains(name) || opened.contains(name))
                    && !closed.contains(name);
                if !open {
                    return Err(QueueError::UnknownContent(name.to_string()));
                }
                if matches!(frame.pairing(), Pairing::Closes(_)) {
                    closed.insert(name);
                }
            }
            Pairing::Unscoped => {}
        }
    }
    Ok(())
}

enum Popped {
    Frame(OutboundFrame),
    Empty,
    Finished,
}

/// Pull-based view of an [`OutboundQueue`] that drives the transport writer.
pub struct OutboundFrames {
    queue: Arc<OutboundQueue>,
}

impl OutboundFrames {
    /// Waits for the next frame. Returns `None` once the queue is closed and
    /// every frame queued before the close has been handed out.
    pub async fn next(&mut self) -> Option<OutboundFrame> {
        loop {
            match self.queue.pop() {
                Popped::Frame(frame) => return Some(frame),
                Popped::Finished => return None,
                Popped::Empty => {}
            }
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = self.queue.cancel.cancelled() => {}
                _ = tokio::time::sleep(FALLBACK_POLL) => {}
            }
        }
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{
        build_content_end, build_content_start, build_prompt_end, build_session_end,
        build_text_input, ContentKind, MediaConfig,
    };
    use parley_types::Role;

    fn text_block(name: &str, text: &str) -> Vec<OutboundFrame> {
        vec![
            build_content_start("p", name, ContentKind::Text, Role::User, true, MediaConfig::text()),
            build_text_input("p", name, text),
            build_content_end("p", name),
        ]
    }

    #[tokio::test]
    async fn frames_come_out_in_enqueue_order() {
        let queue = OutboundQueue::new();
        let mut frames = queue.frames();
        queue.enqueue_all(text_block("a", "one")).expect("queued");
        queue.enqueue(build_prompt_end("p")).expect("queued");

        let names: Vec<_> = [
            frames.next().await,
            frames.next().await,
            frames.next().await,
            frames.next().await,
        ]
        .into_iter()
        .map(|f| f.expect("frame").name())
        .collect();
        assert_eq!(names, ["contentStart", "textInput", "contentEnd", "promptEnd"]);
    }

    #[tokio::test]
    async fn pending_next_wakes_on_enqueue() {
        let queue = OutboundQueue::new();
        let mut frames = queue.frames();
        let waiter = tokio::spawn(async move { frames.next().await });
        tokio::task::yield_now().await;
        queue.enqueue(build_session_end()).expect("queued");
        let frame = waiter.await.expect("join").expect("frame");
        assert_eq!(frame.name(), "sessionEnd");
    }

    #[tokio::test]
    async fn close_drains_then_finishes_and_rejects_new_frames() {
        let queue = OutboundQueue::new();
        let mut frames = queue.frames();
        queue.enqueue(build_prompt_end("p")).expect("queued");
        queue.close();
        queue.close();

        assert_eq!(queue.enqueue(build_session_end()), Err(QueueError::Closed));
        assert_eq!(frames.next().await.map(|f| f.name()), Some("promptEnd"));
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn close_unblocks_pending_next() {
        let queue = OutboundQueue::new();
        let mut frames = queue.frames();
        let waiter = tokio::spawn(async move { frames.next().await });
        tokio::task::yield_now().await;
        queue.close();
        assert!(waiter.await.expect("join").is_none());
    }

    #[test]
    fn open_content_names_cannot_be_reused() {
        let queue = OutboundQueue::new();
        queue
            .enqueue(build_content_start("p", "a", ContentKind::Text, Role::User, true, MediaConfig::text()))
            .expect("open");
        assert_eq!(
            queue.enqueue_all(text_block("a", "again")),
            Err(QueueError::DuplicateContent("a".to_string()))
        );
        assert_eq!(queue.len(), 1, "rejected run leaves the queue untouched");
        assert_eq!(
            queue.enqueue_all(text_block("b", "one").into_iter().chain(text_block("b", "two")).collect()),
            Err(QueueError::DuplicateContent("b".to_string()))
        );
    }

    #[test]
    fn closed_blocks_are_forgotten() {
        let queue = OutboundQueue::new();
        for n in 0..50 {
            queue.enqueue_all(text_block(&format!("turn-{n}"), "hi")).expect("block");
        }
        assert!(queue.open_blocks().is_empty());
        queue
            .enqueue_all(text_block("turn-0", "again"))
            .expect("a closed name holds no state");
    }

    #[test]
    fn writes_require_an_open_block() {
        let queue = OutboundQueue::new();
        assert_eq!(
            queue.enqueue(build_text_input("p", "ghost", "x")),
            Err(QueueError::UnknownContent("ghost".to_string()))
        );
        queue
            .enqueue(build_content_start("p", "b", ContentKind::Text, Role::User, true, MediaConfig::text()))
            .expect("open");
        assert_eq!(queue.open_blocks(), vec!["b".to_string()]);
        queue.enqueue(build_content_end("p", "b")).expect("close");
        assert!(queue.open_blocks().is_empty());
        assert_eq!(
            queue.enqueue(build_content_end("p", "b")),
            Err(QueueError::UnknownContent("b".to_string()))
        );
    }
}
