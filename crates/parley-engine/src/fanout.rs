//! Turns engine events into client-facing [`ExternalEvent`]s.

use std::collections::{HashSet, VecDeque};

use futures_util::Stream;
use parley_protocol::InboundFrame;
use parley_types::{is_interrupted, AudioFormat, ExternalEvent, Role, ToolLogSubtype};
use sha2::{Digest, Sha256};

use crate::engine::{EngineEvent, EventSubscription};

/// Content fingerprint of one transcript fragment.
pub fn transcript_fingerprint(role: Role, text: &str, counter: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_wire().as_bytes());
    hasher.update([0x1f]);
    hasher.update(counter.to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Drops transcript fragments already relayed within the same speaker run.
///
/// The counter advances each time the conversational role changes and at
/// every completed turn, so the same words spoken again in a later run or
/// turn are relayed again.
#[derive(Debug, Default)]
pub struct TranscriptDeduper {
    counter: u64,
    last_role: Option<Role>,
    seen: HashSet<String>,
}

impl TranscriptDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_role(&mut self, role: Role) {
        if !role.is_conversational() {
            return;
        }
        match self.last_role {
            Some(last) if last == role => {}
            Some(_) => {
                self.last_role = Some(role);
                self.advance();
            }
            None => self.last_role = Some(role),
        }
    }

    /// Starts a new counter; fragments seen under older ones no longer match.
    pub fn advance(&mut self) {
        self.counter += 1;
        self.seen.clear();
    }

    /// `true` the first time this fragment is seen under the current counter.
    pub fn admit(&mut self, role: Role, text: &str) -> bool {
        self.observe_role(role);
        self.seen
            .insert(transcript_fingerprint(role, text, self.counter))
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

/// Events produced for one engine event.
#[derive(Debug, Default, PartialEq)]
pub struct Relay {
    pub events: Vec<ExternalEvent>,
    /// The client stream ends after these events.
    pub terminal: bool,
}

impl Relay {
    fn one(event: ExternalEvent) -> Self {
        Self {
            events: vec![event],
            terminal: false,
        }
    }
}

/// Per-subscriber relay state.
#[derive(Debug)]
pub struct FanOut {
    format: AudioFormat,
    dedup: TranscriptDeduper,
}

impl FanOut {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            dedup: TranscriptDeduper::new(),
        }
    }

    pub fn relay(&mut self, event: EngineEvent) -> Relay {
        match event {
            EngineEvent::Frame(frame) => self.relay_frame(frame),
            EngineEvent::ToolLog(activity) => {
                let (input, result) = match activity.subtype {
                    ToolLogSubtype::Invocation => (Some(activity.payload), None),
                    ToolLogSubtype::Result => (None, Some(activity.payload)),
                };
                Relay::one(ExternalEvent::ToolLog {
                    subtype: activity.subtype,
                    tool_name: activity.tool_name,
                    tool_use_id: activity.tool_use_id,
                    input,
                    result,
                    timestamp: chrono::Utc::now(),
                })
            }
            EngineEvent::Status(message) => Relay::one(ExternalEvent::status(message)),
            EngineEvent::TurnCompleted(ordinal) => {
                tracing::trace!(ordinal, "turn boundary");
                self.dedup.advance();
                Relay::default()
            }
            EngineEvent::Terminal(message) => Relay {
                events: vec![ExternalEvent::error(message)],
                terminal: true,
            },
            EngineEvent::Closed => Relay {
                events: Vec::new(),
                terminal: true,
            },
        }
    }

    fn relay_frame(&mut self, frame: InboundFrame) -> Relay {
        match frame {
            InboundFrame::ContentStart { role, .. } => {
                if let Some(role) = role {
                    self.dedup.observe_role(role);
                }
                Relay::one(ExternalEvent::ContentStart {
                    role: role.map(Role::speaker).unwrap_or("unknown").to_string(),
                    timestamp: chrono::Utc::now(),
                })
            }
            InboundFrame::TextOutput { role, content } => {
                if is_interrupted(&content) {
                    return Relay::default();
                }
                let role = role.unwrap_or(Role::Assistant);
                if !self.dedup.admit(role, &content) {
                    tracing::trace!(role = role.as_wire(), "duplicate transcript fragment");
                    return Relay::default();
                }
                Relay::one(ExternalEvent::transcript(role.speaker(), content))
            }
            InboundFrame::AudioOutput { content } => {
                Relay::one(ExternalEvent::audio(content, self.format))
            }
            InboundFrame::ContentEnd { .. } => Relay::one(ExternalEvent::ContentEnd {
                timestamp: chrono::Utc::now(),
            }),
            InboundFrame::ToolUse { .. }
            | InboundFrame::Error(_)
            | InboundFrame::Other { .. }
            | InboundFrame::RawData(_) => Relay::default(),
        }
    }
}

/// Client event stream for one subscription. Ends after a terminal error
/// or engine close; dropping it releases the subscription.
pub fn external_events(
    subscription: EventSubscription,
    format: AudioFormat,
) -> impl Stream<Item = ExternalEvent> + Send + 'static {
    let state = (subscription, FanOut::new(format), VecDeque::new(), false);
    futures_util::stream::unfold(
        state,
        |(mut subscription, mut fanout, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (subscription, fanout, pending, done)));
                }
                if done {
                    return None;
                }
                let relay = fanout.relay(subscription.recv().await?);
                pending.extend(relay.events);
                done = relay.terminal;
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolActivity;
    use serde_json::json;

    fn text(role: Role, content: &str) -> EngineEvent {
        EngineEvent::Frame(InboundFrame::TextOutput {
            role: Some(role),
            content: content.to_string(),
        })
    }

    fn start(role: Role) -> EngineEvent {
        EngineEvent::Frame(InboundFrame::ContentStart {
            role: Some(role),
            content_id: None,
            kind: Some("TEXT".to_string()),
            generation_stage: None,
        })
    }

    fn transcripts(fanout: &mut FanOut, events: Vec<EngineEvent>) -> Vec<String> {
        events
            .into_iter()
            .flat_map(|e| fanout.relay(e).events)
            .filter_map(|e| match e {
                ExternalEvent::Transcript { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_within_a_run_is_relayed_once() {
        let mut fanout = FanOut::new(AudioFormat::default());
        let out = transcripts(
            &mut fanout,
            vec![
                start(Role::Assistant),
                text(Role::Assistant, "Hello there."),
                start(Role::Assistant),
                text(Role::Assistant, "Hello there."),
            ],
        );
        assert_eq!(out, ["Hello there."]);
    }

    #[test]
    fn same_words_in_a_later_run_are_relayed_again() {
        let mut fanout = FanOut::new(AudioFormat::default());
        let out = transcripts(
            &mut fanout,
            vec![
                start(Role::User),
                text(Role::User, "yes"),
                start(Role::Assistant),
                text(Role::Assistant, "Okay."),
                start(Role::User),
                text(Role::User, "yes"),
            ],
        );
        assert_eq!(out, ["yes", "Okay.", "yes"]);
    }

    #[test]
    fn same_words_after_a_turn_boundary_are_relayed_again() {
        let mut fanout = FanOut::new(AudioFormat::default());
        let out = transcripts(
            &mut fanout,
            vec![
                start(Role::User),
                text(Role::User, "yes"),
                EngineEvent::TurnCompleted(1),
                start(Role::User),
                text(Role::User, "yes"),
                text(Role::User, "yes"),
                start(Role::Assistant),
                text(Role::Assistant, "ok"),
            ],
        );
        assert_eq!(out, ["yes", "yes", "ok"]);
    }

    #[test]
    fn fingerprint_depends_on_every_part() {
        let base = transcript_fingerprint(Role::User, "hi", 0);
        assert_eq!(base.len(), 64);
        assert_ne!(base, transcript_fingerprint(Role::Assistant, "hi", 0));
        assert_ne!(base, transcript_fingerprint(Role::User, "hi", 1));
        assert_ne!(base, transcript_fingerprint(Role::User, "hi!", 0));
    }

    #[test]
    fn interrupted_marker_is_not_a_transcript() {
        let mut fanout = FanOut::new(AudioFormat::default());
        let relay = fanout.relay(text(Role::Assistant, "{ \"interrupted\" : true }"));
        assert!(relay.events.is_empty());
        assert!(!relay.terminal);
    }

    #[test]
    fn audio_carries_output_format() {
        let mut fanout = FanOut::new(AudioFormat {
            sample_rate: 16_000,
            channels: 1,
        });
        let relay = fanout.relay(EngineEvent::Frame(InboundFrame::AudioOutput {
            content: "AAEC".to_string(),
        }));
        match &relay.events[..] {
            [ExternalEvent::AudioResponse {
                audio_data,
                sample_rate,
                ..
            }] => {
                assert_eq!(audio_data, "AAEC");
                assert_eq!(*sample_rate, 16_000);
            }
            other => panic!("unexpected relay {other:?}"),
        }
    }

    #[test]
    fn tool_activity_maps_to_tool_log() {
        let mut fanout = FanOut::new(AudioFormat::default());
        let relay = fanout.relay(EngineEvent::ToolLog(ToolActivity {
            subtype: ToolLogSubtype::Result,
            tool_name: "lookupHcpTool".to_string(),
            tool_use_id: "t-1".to_string(),
            payload: json!({"found": false}),
        }));
        match &relay.events[..] {
            [ExternalEvent::ToolLog { input, result, .. }] => {
                assert!(input.is_none());
                assert_eq!(result.as_ref(), Some(&json!({"found": false})));
            }
            other => panic!("unexpected relay {other:?}"),
        }
    }

    #[test]
    fn status_continues_but_terminal_ends() {
        let mut fanout = FanOut::new(AudioFormat::default());
        assert!(!fanout.relay(EngineEvent::Status("slow".to_string())).terminal);

        let relay = fanout.relay(EngineEvent::Terminal("boom".to_string()));
        assert!(relay.terminal);
        assert!(matches!(&relay.events[..], [ExternalEvent::Error { message, .. }] if message == "boom"));

        let closed = fanout.relay(EngineEvent::Closed);
        assert!(closed.terminal);
        assert!(closed.events.is_empty());
    }
}
