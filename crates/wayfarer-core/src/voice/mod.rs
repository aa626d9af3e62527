//! Voice turn-taking.
//!
//! `Idle → WakeListening → Capturing → Transcribing → AwaitingReply → Speaking → Idle`,
//! with barge-in from `Speaking` through `Interrupted` back to `Capturing`.
//! The controller is a single task that owns all state; collaborator work
//! runs in spawned tasks whose results carry the epoch they started in, so
//! anything finishing after a barge-in or reset is dropped.

pub mod http;
pub mod vad;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use wayfarer_bus::BusPublisher;
use wayfarer_schema::{
    AuthLevel, BusMessage, Channel, InboundMessage, OutboundMessage, TurnErrorKind, VoiceState,
};

use crate::config::VoiceConfig;

pub use http::{HttpSynthesizer, HttpTranscriber};
pub use vad::{AudioFrame, EndpointDetector, VadSignal};

const MAX_UTTERANCE: Duration = Duration::from_secs(30);
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// Capture starts only after the wake word.
    #[default]
    WakeWord,
    /// Capture starts on `Activate` and ends on `Stop` or silence.
    PushToTalk,
    /// Any speech starts a capture.
    Continuous,
}

/// Input to the controller. Text control frames deserialize into every
/// variant except `Audio`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    Activate,
    WakeWordDetected,
    #[serde(skip)]
    Audio(AudioFrame),
    VoiceActivity,
    EndOfUtterance,
    Stop,
    Reset,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceOutput {
    State {
        state: VoiceState,
    },
    Transcript {
        text: String,
    },
    Reply {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<TurnErrorKind>,
    },
    ErrorCue {
        message: String,
    },
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: Vec<i16>, sample_rate: u32) -> Result<String>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Plays synthesized audio. Must stop promptly once `cancel` fires.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()>;
}

/// Hands a transcribed utterance to the assistant.
#[async_trait]
pub trait UtteranceHandler: Send + Sync {
    async fn handle_utterance(&self, inbound: InboundMessage) -> OutboundMessage;
}

#[derive(Clone)]
pub struct VoiceCollaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub handler: Arc<dyn UtteranceHandler>,
}

#[derive(Debug, Clone)]
pub struct VoiceSettings {
    pub mode: VoiceMode,
    pub wake_word: String,
    pub sample_rate: u32,
    pub silence_threshold: u16,
    pub silence: Duration,
    pub transcription_timeout: Duration,
    pub synthesis_timeout: Duration,
}

impl VoiceSettings {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            mode: config.mode,
            wake_word: config.wake_word.clone(),
            sample_rate: config.sample_rate,
            silence_threshold: config.silence_threshold,
            silence: Duration::from_millis(config.silence_ms),
            transcription_timeout: Duration::from_secs(config.transcription_timeout_secs.max(1)),
            synthesis_timeout: Duration::from_secs(config.synthesis_timeout_secs.max(1)),
        }
    }
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

/// Remove a leading wake word ("hey wayfarer, what's ...") from a transcript.
pub fn strip_wake_word<'a>(text: &'a str, wake_word: &str) -> &'a str {
    let wake = wake_word.trim().to_ascii_lowercase();
    if wake.is_empty() {
        return text.trim();
    }
    let lower = text.to_ascii_lowercase();
    match lower.find(&wake) {
        Some(pos) if lower[..pos].trim().is_empty() => text[pos + wake.len()..]
            .trim_start_matches([',', ':', '.', '!', '?', ' '])
            .trim(),
        _ => text.trim(),
    }
}

/// Cheap, cloneable access to a running controller.
#[derive(Clone)]
pub struct VoiceHandle {
    events: mpsc::Sender<VoiceEvent>,
    state: watch::Receiver<VoiceState>,
}

impl VoiceHandle {
    pub async fn send(&self, event: VoiceEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("voice controller stopped"))
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<VoiceState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// True when both handles drive the same controller.
    pub fn same_controller(&self, other: &VoiceHandle) -> bool {
        self.events.same_channel(&other.events)
    }
}

enum Completion {
    Transcribed { epoch: u64, result: Result<String> },
    Replied { epoch: u64, outbound: OutboundMessage },
    Synthesized { epoch: u64, result: Result<Vec<u8>> },
    PlaybackDone { epoch: u64, result: Result<()> },
}

pub struct VoiceTurnController {
    user_id: String,
    auth_level: AuthLevel,
    settings: VoiceSettings,
    collaborators: VoiceCollaborators,
    publisher: Option<BusPublisher>,
    state: VoiceState,
    epoch: u64,
    buffer: Vec<i16>,
    vad: EndpointDetector,
    playback: Option<CancellationToken>,
    state_tx: watch::Sender<VoiceState>,
    output_tx: mpsc::UnboundedSender<VoiceOutput>,
    completion_tx: mpsc::UnboundedSender<Completion>,
}

impl VoiceTurnController {
    /// Start a controller task for one user. The returned receiver carries
    /// every state change, transcript, reply and error cue.
    pub fn spawn(
        user_id: impl Into<String>,
        auth_level: AuthLevel,
        settings: VoiceSettings,
        collaborators: VoiceCollaborators,
        publisher: Option<BusPublisher>,
    ) -> (VoiceHandle, mpsc::UnboundedReceiver<VoiceOutput>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VoiceState::Idle);

        let controller = Self {
            user_id: user_id.into(),
            auth_level,
            vad: EndpointDetector::new(
                settings.silence_threshold,
                settings.silence,
                settings.sample_rate,
            ),
            settings,
            collaborators,
            publisher,
            state: VoiceState::Idle,
            epoch: 0,
            buffer: Vec::new(),
            playback: None,
            state_tx,
            output_tx,
            completion_tx,
        };
        tokio::spawn(controller.run(events_rx, completion_rx));

        (
            VoiceHandle {
                events: events_tx,
                state: state_rx,
            },
            output_rx,
        )
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<VoiceEvent>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        tracing::debug!(user_id = %self.user_id, mode = ?self.settings.mode, "voice controller started");
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                Some(done) = completions.recv() => self.on_completion(done).await,
            }
        }
        self.cancel_playback();
        tracing::debug!(user_id = %self.user_id, "voice controller stopped");
    }

    async fn set_state(&mut self, next: VoiceState) {
        if self.state == next {
            return;
        }
        let from = self.state;
        self.state = next;
        self.state_tx.send_replace(next);
        tracing::debug!(user_id = %self.user_id, ?from, to = ?next, "voice state");
        let _ = self.output_tx.send(VoiceOutput::State { state: next });
        if let Some(publisher) = &self.publisher {
            let msg = BusMessage::VoiceStateChanged {
                user_id: self.user_id.clone(),
                from,
                to: next,
            };
            if let Err(e) = publisher.publish(msg).await {
                tracing::debug!("bus publish failed: {e}");
            }
        }
    }

    fn cue(&self, message: &str) {
        let _ = self.output_tx.send(VoiceOutput::ErrorCue {
            message: message.to_string(),
        });
    }

    fn cancel_playback(&mut self) {
        if let Some(token) = self.playback.take() {
            token.cancel();
        }
    }

    async fn on_event(&mut self, event: VoiceEvent) {
        use VoiceState::*;

        match (self.state, event) {
            (_, VoiceEvent::Reset) => {
                self.cancel_playback();
                self.buffer.clear();
                self.vad.reset();
                self.epoch += 1;
                self.set_state(Idle).await;
            }
            (Idle, VoiceEvent::Activate) if self.settings.mode == VoiceMode::WakeWord => {
                self.set_state(WakeListening).await;
            }
            // Already armed; only the wake word opens the microphone.
            (WakeListening, VoiceEvent::Activate) => {}
            (Idle | WakeListening, VoiceEvent::Activate | VoiceEvent::WakeWordDetected) => {
                if self.state == Idle && self.settings.mode == VoiceMode::WakeWord {
                    self.set_state(WakeListening).await;
                }
                self.start_capture().await;
            }
            (Speaking, VoiceEvent::Activate | VoiceEvent::WakeWordDetected | VoiceEvent::VoiceActivity) => {
                self.barge_in(None).await;
            }
            (Speaking, VoiceEvent::Audio(frame)) => {
                if self.vad.is_speech(&frame) {
                    self.barge_in(Some(frame)).await;
                }
            }
            (Idle, VoiceEvent::VoiceActivity) if self.settings.mode == VoiceMode::Continuous => {
                self.start_capture().await;
            }
            (Idle, VoiceEvent::Audio(frame)) if self.settings.mode == VoiceMode::Continuous => {
                if self.vad.is_speech(&frame) {
                    self.start_capture().await;
                    self.capture_frame(frame).await;
                }
            }
            (Capturing, VoiceEvent::Audio(frame)) => self.capture_frame(frame).await,
            (Capturing, VoiceEvent::EndOfUtterance | VoiceEvent::Stop) => {
                self.finish_capture().await;
            }
            (Speaking, VoiceEvent::Stop) => {
                self.cancel_playback();
                self.epoch += 1;
                self.set_state(Idle).await;
            }
            (WakeListening, VoiceEvent::Stop) => self.set_state(Idle).await,
            (state, event) => {
                if !matches!(event, VoiceEvent::Audio(_)) {
                    tracing::trace!(?state, ?event, "voice event ignored");
                }
            }
        }
    }

    async fn start_capture(&mut self) {
        self.buffer.clear();
        self.vad.reset();
        self.epoch += 1;
        self.set_state(VoiceState::Capturing).await;
    }

    async fn capture_frame(&mut self, frame: AudioFrame) {
        let signal = self.vad.observe(&frame);
        self.buffer.extend_from_slice(&frame.samples);
        let captured = Duration::from_secs_f64(
            self.buffer.len() as f64 / self.settings.sample_rate.max(1) as f64,
        );
        if signal == VadSignal::EndOfUtterance || captured >= MAX_UTTERANCE {
            self.finish_capture().await;
        }
    }

    /// Barge-in: stop playback right here, before anything else is awaited.
    async fn barge_in(&mut self, frame: Option<AudioFrame>) {
        self.cancel_playback();
        tracing::info!(user_id = %self.user_id, "barge-in, playback cancelled");
        self.set_state(VoiceState::Interrupted).await;
        self.start_capture().await;
        if let Some(frame) = frame {
            self.capture_frame(frame).await;
        }
    }

    async fn finish_capture(&mut self) {
        if self.buffer.is_empty() {
            self.set_state(VoiceState::Idle).await;
            return;
        }
        let samples = std::mem::take(&mut self.buffer);
        self.vad.reset();
        self.set_state(VoiceState::Transcribing).await;

        let epoch = self.epoch;
        let transcriber = self.collaborators.transcriber.clone();
        let rate = self.settings.sample_rate;
        let timeout = self.settings.transcription_timeout;
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, transcriber.transcribe(samples, rate))
                .await
                .unwrap_or_else(|_| Err(anyhow!("transcription timed out")));
            let _ = tx.send(Completion::Transcribed { epoch, result });
        });
    }

    fn is_current(&self, epoch: u64, expected: VoiceState) -> bool {
        let current = epoch == self.epoch && self.state == expected;
        if !current {
            tracing::debug!(
                user_id = %self.user_id,
                epoch,
                current_epoch = self.epoch,
                state = ?self.state,
                "discarding stale voice result"
            );
        }
        current
    }

    async fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Transcribed { epoch, result } => {
                if !self.is_current(epoch, VoiceState::Transcribing) {
                    return;
                }
                let text = match result {
                    Ok(raw) => {
                        let text = if self.settings.mode == VoiceMode::WakeWord {
                            strip_wake_word(&raw, &self.settings.wake_word)
                        } else {
                            raw.trim()
                        };
                        text.to_string()
                    }
                    Err(e) => {
                        tracing::warn!(user_id = %self.user_id, error = %e, "transcription failed");
                        String::new()
                    }
                };
                if text.is_empty() {
                    self.cue("Sorry, I didn't catch that.");
                    self.set_state(VoiceState::Idle).await;
                    return;
                }

                let _ = self.output_tx.send(VoiceOutput::Transcript { text: text.clone() });
                self.set_state(VoiceState::AwaitingReply).await;

                let inbound = InboundMessage::new(self.user_id.clone(), Channel::Voice, text)
                    .with_auth_level(self.auth_level);
                let handler = self.collaborators.handler.clone();
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let outbound = handler.handle_utterance(inbound).await;
                    let _ = tx.send(Completion::Replied { epoch, outbound });
                });
            }
            Completion::Replied { epoch, outbound } => {
                if !self.is_current(epoch, VoiceState::AwaitingReply) {
                    return;
                }
                let _ = self.output_tx.send(VoiceOutput::Reply {
                    text: outbound.text.clone(),
                    error: outbound.error_kind(),
                });

                let synthesizer = self.collaborators.synthesizer.clone();
                let timeout = self.settings.synthesis_timeout;
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let result = tokio::time::timeout(timeout, synthesizer.synthesize(&outbound.text))
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("synthesis timed out")));
                    let _ = tx.send(Completion::Synthesized { epoch, result });
                });
            }
            Completion::Synthesized { epoch, result } => {
                if !self.is_current(epoch, VoiceState::AwaitingReply) {
                    return;
                }
                let audio = match result {
                    Ok(audio) => audio,
                    Err(e) => {
                        tracing::warn!(user_id = %self.user_id, error = %e, "synthesis failed");
                        self.cue("Sorry, I couldn't say that out loud.");
                        self.set_state(VoiceState::Idle).await;
                        return;
                    }
                };

                // At most one playback per session.
                self.cancel_playback();
                let token = CancellationToken::new();
                self.playback = Some(token.clone());
                self.set_state(VoiceState::Speaking).await;

                let sink = self.collaborators.sink.clone();
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let result = sink.play(audio, token).await;
                    let _ = tx.send(Completion::PlaybackDone { epoch, result });
                });
            }
            Completion::PlaybackDone { epoch, result } => {
                if let Err(e) = &result {
                    tracing::warn!(user_id = %self.user_id, error = %e, "playback failed");
                }
                if !self.is_current(epoch, VoiceState::Speaking) {
                    return;
                }
                self.playback = None;
                self.set_state(VoiceState::Idle).await;
            }
        }
    }
}
