use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use wayfarer_bus::EventBus;
use wayfarer_core::{
    AgentOrchestrator, AudioSink, HttpSynthesizer, HttpTranscriber, SessionsConfig, Synthesizer,
    Transcriber, VoiceCollaborators, VoiceHandle, VoiceOutput, VoiceSettings,
    VoiceTurnController, WayfarerConfig,
};
use wayfarer_memory::{ConversationStore, SqliteConversationStore};
use wayfarer_provider::{create_provider, LlmProvider};
use wayfarer_schema::{AuthLevel, InboundMessage, OutboundMessage};

const BUS_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("message text is empty")]
    EmptyMessage,
    #[error("user id is empty")]
    MissingUser,
    #[error("voice is not configured")]
    VoiceUnavailable,
    #[error("a voice session is already open for {0}")]
    VoiceBusy(String),
}

/// Speech endpoints shared by every voice session.
#[derive(Clone)]
pub struct VoiceBackend {
    pub settings: VoiceSettings,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl VoiceBackend {
    /// `None` unless both speech endpoints are configured.
    pub fn from_config(config: &WayfarerConfig) -> Option<Self> {
        let voice = &config.voice;
        let (Some(stt), Some(tts)) = (&voice.transcriber_url, &voice.synthesizer_url) else {
            return None;
        };
        let settings = VoiceSettings::from_config(voice);
        Some(Self {
            transcriber: Arc::new(HttpTranscriber::new(
                stt.clone(),
                voice.api_key.clone(),
                settings.transcription_timeout,
            )),
            synthesizer: Arc::new(HttpSynthesizer::new(
                tts.clone(),
                voice.api_key.clone(),
                settings.synthesis_timeout,
            )),
            settings,
        })
    }
}

type VoiceHandles = Arc<Mutex<HashMap<String, VoiceHandle>>>;

fn lock_handles(
    handles: &Mutex<HashMap<String, VoiceHandle>>,
) -> MutexGuard<'_, HashMap<String, VoiceHandle>> {
    handles
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A freshly opened voice controller and its output stream.
pub struct VoiceSession {
    pub handle: VoiceHandle,
    pub outputs: tokio::sync::mpsc::UnboundedReceiver<VoiceOutput>,
    pub lease: VoiceLease,
}

/// Holds the user's voice slot. Dropping it frees the slot, so a session
/// abandoned before its socket is served does not lock the user out.
pub struct VoiceLease {
    handles: VoiceHandles,
    user_id: String,
    handle: VoiceHandle,
}

impl Drop for VoiceLease {
    fn drop(&mut self) {
        let mut handles = lock_handles(&self.handles);
        if handles
            .get(&self.user_id)
            .is_some_and(|h| h.same_controller(&self.handle))
        {
            handles.remove(&self.user_id);
            tracing::info!(user_id = %self.user_id, "voice session released");
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_evicted: usize,
    pub buckets_purged: usize,
    pub voice_closed: usize,
}

/// Channel-facing entry point shared by every adapter.
pub struct Gateway {
    orchestrator: Arc<AgentOrchestrator>,
    bus: Arc<EventBus>,
    voice: Option<VoiceBackend>,
    voice_handles: VoiceHandles,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Gateway {
    pub fn new(
        orchestrator: Arc<AgentOrchestrator>,
        bus: Arc<EventBus>,
        voice: Option<VoiceBackend>,
        sessions: &SessionsConfig,
    ) -> Self {
        Self {
            orchestrator,
            bus,
            voice,
            voice_handles: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout: Duration::from_secs(sessions.idle_timeout_secs.max(1)),
            sweep_interval: Duration::from_secs(sessions.sweep_interval_secs.max(1)),
        }
    }

    /// Build provider, store, bus and core from a loaded config.
    pub fn from_config(config: &WayfarerConfig, root: &Path) -> Result<Self> {
        let provider = create_provider(&config.provider)?;
        let store: Arc<dyn ConversationStore> =
            Arc::new(SqliteConversationStore::open(config.storage_path(root))?);
        Self::with_parts(config, provider, store)
    }

    /// Same as [`Gateway::from_config`] with caller-supplied provider and store.
    pub fn with_parts(
        config: &WayfarerConfig,
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn ConversationStore>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new(BUS_CAPACITY));
        let orchestrator =
            AgentOrchestrator::from_config(config, provider, store, bus.publisher())?;
        let voice = VoiceBackend::from_config(config);
        if voice.is_none() {
            tracing::info!("voice endpoints not configured; voice channel disabled");
        }
        Ok(Self::new(
            Arc::new(orchestrator),
            bus,
            voice,
            &config.sessions,
        ))
    }

    pub fn orchestrator(&self) -> &Arc<AgentOrchestrator> {
        &self.orchestrator
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice.is_some()
    }

    pub fn voice_sample_rate(&self) -> Option<u32> {
        self.voice.as_ref().map(|v| v.settings.sample_rate)
    }

    /// Request/response turn. Malformed input is rejected before it reaches
    /// the core; everything else comes back as a reply.
    pub async fn handle_chat(
        &self,
        inbound: InboundMessage,
    ) -> Result<OutboundMessage, GatewayError> {
        if inbound.user_id.trim().is_empty() {
            return Err(GatewayError::MissingUser);
        }
        if inbound.text.trim().is_empty() && inbound.attachments.is_empty() {
            return Err(GatewayError::EmptyMessage);
        }
        Ok(self.orchestrator.handle_turn(inbound).await)
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<String, VoiceHandle>> {
        lock_handles(&self.voice_handles)
    }

    /// Start the voice controller for `user_id`. One controller per user;
    /// a second open while the first is live is refused.
    pub fn open_voice(
        &self,
        user_id: &str,
        auth_level: AuthLevel,
        sink: Arc<dyn AudioSink>,
    ) -> Result<VoiceSession, GatewayError> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::MissingUser);
        }
        let backend = self.voice.as_ref().ok_or(GatewayError::VoiceUnavailable)?;

        let mut handles = self.handles();
        if handles.get(user_id).is_some_and(|h| !h.is_closed()) {
            return Err(GatewayError::VoiceBusy(user_id.to_string()));
        }

        let (handle, outputs) = VoiceTurnController::spawn(
            user_id,
            auth_level,
            backend.settings.clone(),
            VoiceCollaborators {
                transcriber: backend.transcriber.clone(),
                synthesizer: backend.synthesizer.clone(),
                sink,
                handler: self.orchestrator.clone(),
            },
            Some(self.bus.publisher()),
        );
        handles.insert(user_id.to_string(), handle.clone());
        tracing::info!(user_id, "voice session opened");
        let lease = VoiceLease {
            handles: self.voice_handles.clone(),
            user_id: user_id.to_string(),
            handle: handle.clone(),
        };
        Ok(VoiceSession {
            handle,
            outputs,
            lease,
        })
    }

    pub fn voice_handle(&self, user_id: &str) -> Option<VoiceHandle> {
        self.handles().get(user_id).cloned()
    }

    /// Forget the user's controller. It stops once the caller drops its
    /// own handle.
    pub fn close_voice(&self, user_id: &str) -> bool {
        let removed = self.handles().remove(user_id).is_some();
        if removed {
            tracing::info!(user_id, "voice session closed");
        }
        removed
    }

    pub fn active_voice_sessions(&self) -> usize {
        self.handles().len()
    }

    /// One reaper pass: idle sessions, rolled-over rate buckets, dead voice
    /// controllers.
    pub fn sweep(&self) -> SweepReport {
        let sessions_evicted = self.orchestrator.sessions().evict_idle(self.idle_timeout);
        let buckets_purged = self.orchestrator.rate_limiter().purge_expired();
        let voice_closed = {
            let mut handles = self.handles();
            let before = handles.len();
            handles.retain(|_, h| !h.is_closed());
            before - handles.len()
        };
        SweepReport {
            sessions_evicted,
            buckets_purged,
            voice_closed,
        }
    }
}

/// Run [`Gateway::sweep`] every `sessions.sweep_interval_secs` until `shutdown`
/// fires.
pub fn spawn_session_reaper(
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gateway.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let report = gateway.sweep();
            if report != SweepReport::default() {
                tracing::info!(
                    sessions_evicted = report.sessions_evicted,
                    buckets_purged = report.buckets_purged,
                    voice_closed = report.voice_closed,
                    "session sweep"
                );
            } else {
                tracing::debug!("session sweep: nothing to do");
            }
        }
        tracing::debug!("session reaper stopped");
    })
}
