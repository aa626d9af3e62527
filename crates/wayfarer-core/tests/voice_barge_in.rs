use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wayfarer_core::{
    AudioFrame, AudioSink, Synthesizer, Transcriber, UtteranceHandler, VoiceCollaborators,
    VoiceEvent, VoiceHandle, VoiceMode, VoiceOutput, VoiceSettings, VoiceTurnController,
};
use wayfarer_schema::{AuthLevel, InboundMessage, OutboundMessage, VoiceState};

struct FakeTranscriber {
    text: Result<String, String>,
    delay: Duration,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, samples: Vec<i16>, _sample_rate: u32) -> Result<String> {
        assert!(!samples.is_empty());
        tokio::time::sleep(self.delay).await;
        self.text.clone().map_err(|e| anyhow!(e))
    }
}

struct FakeSynthesizer;

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }
}

/// Plays until cancelled, tracking overlap.
#[derive(Default)]
struct SlowSink {
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
    cancelled: AtomicUsize,
}

#[async_trait]
impl AudioSink for SlowSink {
    async fn play(&self, _audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replies instantly and remembers what it heard.
#[derive(Default)]
struct RecordingHandler {
    heard: Mutex<Vec<String>>,
}

#[async_trait]
impl UtteranceHandler for RecordingHandler {
    async fn handle_utterance(&self, inbound: InboundMessage) -> OutboundMessage {
        self.heard.lock().unwrap().push(inbound.text.clone());
        OutboundMessage::reply(&inbound, format!("You said: {}", inbound.text))
    }
}

struct Rig {
    handle: VoiceHandle,
    outputs: mpsc::UnboundedReceiver<VoiceOutput>,
    sink: Arc<SlowSink>,
    handler: Arc<RecordingHandler>,
}

fn settings(mode: VoiceMode) -> VoiceSettings {
    VoiceSettings {
        mode,
        wake_word: "hey wayfarer".into(),
        sample_rate: 16_000,
        silence_threshold: 500,
        silence: Duration::from_millis(300),
        transcription_timeout: Duration::from_secs(2),
        synthesis_timeout: Duration::from_secs(2),
    }
}

fn rig(mode: VoiceMode, transcriber: FakeTranscriber) -> Rig {
    let sink = Arc::new(SlowSink::default());
    let handler = Arc::new(RecordingHandler::default());
    let (handle, outputs) = VoiceTurnController::spawn(
        "ana",
        AuthLevel::Authenticated,
        settings(mode),
        VoiceCollaborators {
            transcriber: Arc::new(transcriber),
            synthesizer: Arc::new(FakeSynthesizer),
            sink: sink.clone(),
            handler: handler.clone(),
        },
        None,
    );
    Rig {
        handle,
        outputs,
        sink,
        handler,
    }
}

fn quick(text: &str) -> FakeTranscriber {
    FakeTranscriber {
        text: Ok(text.into()),
        delay: Duration::ZERO,
    }
}

fn loud() -> AudioFrame {
    AudioFrame::new(vec![4_000; 320])
}

async fn wait_for(handle: &VoiceHandle, state: VoiceState) {
    let mut rx = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {state:?}, stuck in {:?}", handle.state()))
        .unwrap();
}

fn drain(outputs: &mut mpsc::UnboundedReceiver<VoiceOutput>) -> Vec<VoiceOutput> {
    let mut out = Vec::new();
    while let Ok(o) = outputs.try_recv() {
        out.push(o);
    }
    out
}

fn states(outputs: &[VoiceOutput]) -> Vec<VoiceState> {
    outputs
        .iter()
        .filter_map(|o| match o {
            VoiceOutput::State { state } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Push-to-talk utterance that ends in playback.
async fn speak_until_playback(rig: &Rig) {
    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    rig.handle.send(VoiceEvent::Stop).await.unwrap();
    wait_for(&rig.handle, VoiceState::Speaking).await;
}

#[tokio::test]
async fn full_turn_walks_every_state() {
    let mut rig = rig(VoiceMode::PushToTalk, quick("book a taxi"));
    speak_until_playback(&rig).await;

    let outputs = drain(&mut rig.outputs);
    assert_eq!(
        states(&outputs),
        vec![
            VoiceState::Capturing,
            VoiceState::Transcribing,
            VoiceState::AwaitingReply,
            VoiceState::Speaking
        ]
    );
    assert!(outputs.contains(&VoiceOutput::Transcript {
        text: "book a taxi".into()
    }));
    assert!(outputs.contains(&VoiceOutput::Reply {
        text: "You said: book a taxi".into(),
        error: None
    }));
    assert_eq!(rig.sink.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn speech_during_playback_cancels_it_and_starts_capturing() {
    let mut rig = rig(VoiceMode::PushToTalk, quick("what time is it"));
    speak_until_playback(&rig).await;
    drain(&mut rig.outputs);

    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    wait_for(&rig.handle, VoiceState::Capturing).await;

    assert_eq!(
        states(&drain(&mut rig.outputs)),
        vec![VoiceState::Interrupted, VoiceState::Capturing]
    );
    tokio::time::timeout(Duration::from_secs(1), async {
        while rig.sink.cancelled.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback was not cancelled");
    assert_eq!(rig.sink.active.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn quiet_audio_during_playback_is_not_a_barge_in() {
    let mut rig = rig(VoiceMode::PushToTalk, quick("hello"));
    speak_until_playback(&rig).await;
    drain(&mut rig.outputs);

    rig.handle
        .send(VoiceEvent::Audio(AudioFrame::new(vec![20; 320])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rig.handle.state(), VoiceState::Speaking);
    assert_eq!(rig.sink.cancelled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_barge_ins_never_overlap_playback() {
    let rig = rig(VoiceMode::PushToTalk, quick("next stop"));

    for _ in 0..3 {
        speak_until_playback(&rig).await;
        rig.handle.send(VoiceEvent::VoiceActivity).await.unwrap();
        wait_for(&rig.handle, VoiceState::Capturing).await;
        rig.handle.send(VoiceEvent::Reset).await.unwrap();
        wait_for(&rig.handle, VoiceState::Idle).await;
    }

    assert_eq!(rig.sink.started.load(Ordering::SeqCst), 3);
    assert_eq!(rig.sink.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(rig.handler.heard.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn reset_discards_late_transcription() {
    let mut rig = rig(
        VoiceMode::PushToTalk,
        FakeTranscriber {
            text: Ok("too late".into()),
            delay: Duration::from_millis(100),
        },
    );
    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    rig.handle.send(VoiceEvent::Stop).await.unwrap();
    wait_for(&rig.handle, VoiceState::Transcribing).await;

    rig.handle.send(VoiceEvent::Reset).await.unwrap();
    wait_for(&rig.handle, VoiceState::Idle).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outputs = drain(&mut rig.outputs);
    assert!(!outputs
        .iter()
        .any(|o| matches!(o, VoiceOutput::Transcript { .. })));
    assert_eq!(rig.handle.state(), VoiceState::Idle);
    assert!(rig.handler.heard.lock().unwrap().is_empty());
}

#[tokio::test]
async fn wake_word_flow_strips_the_wake_phrase() {
    let rig = rig(
        VoiceMode::WakeWord,
        quick("Hey Wayfarer, where's the nearest pharmacy?"),
    );

    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    wait_for(&rig.handle, VoiceState::WakeListening).await;
    rig.handle.send(VoiceEvent::WakeWordDetected).await.unwrap();
    wait_for(&rig.handle, VoiceState::Capturing).await;
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    rig.handle.send(VoiceEvent::EndOfUtterance).await.unwrap();
    wait_for(&rig.handle, VoiceState::Speaking).await;

    assert_eq!(
        rig.handler.heard.lock().unwrap().as_slice(),
        ["where's the nearest pharmacy?"]
    );
}

#[tokio::test]
async fn wake_word_mode_ignores_a_second_activate() {
    let mut rig = rig(VoiceMode::WakeWord, quick("hey wayfarer, taxi to the hotel"));

    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    wait_for(&rig.handle, VoiceState::WakeListening).await;
    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    rig.handle.send(VoiceEvent::EndOfUtterance).await.unwrap();
    rig.handle.send(VoiceEvent::WakeWordDetected).await.unwrap();
    wait_for(&rig.handle, VoiceState::Capturing).await;

    // Nothing between arming and the wake word opened the microphone.
    let outputs = drain(&mut rig.outputs);
    assert_eq!(
        states(&outputs),
        vec![VoiceState::WakeListening, VoiceState::Capturing]
    );
    assert!(rig.handler.heard.lock().unwrap().is_empty());
}

#[tokio::test]
async fn trailing_silence_ends_capture() {
    let rig = rig(VoiceMode::PushToTalk, quick("two tickets please"));

    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    // 20 ms of silence per frame; 300 ms ends the utterance.
    for _ in 0..20 {
        rig.handle
            .send(VoiceEvent::Audio(AudioFrame::new(vec![0; 320])))
            .await
            .unwrap();
    }
    wait_for(&rig.handle, VoiceState::Speaking).await;
}

#[tokio::test]
async fn failed_transcription_gives_a_cue_and_returns_to_idle() {
    let mut rig = rig(
        VoiceMode::PushToTalk,
        FakeTranscriber {
            text: Err("upstream 500".into()),
            delay: Duration::ZERO,
        },
    );
    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    rig.handle.send(VoiceEvent::Audio(loud())).await.unwrap();
    rig.handle.send(VoiceEvent::Stop).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    wait_for(&rig.handle, VoiceState::Idle).await;

    let outputs = drain(&mut rig.outputs);
    assert!(states(&outputs).contains(&VoiceState::Transcribing));
    assert!(outputs
        .iter()
        .any(|o| matches!(o, VoiceOutput::ErrorCue { .. })));
    assert!(rig.handler.heard.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stop_without_audio_returns_to_idle() {
    let rig = rig(VoiceMode::PushToTalk, quick("unused"));
    rig.handle.send(VoiceEvent::Activate).await.unwrap();
    wait_for(&rig.handle, VoiceState::Capturing).await;
    rig.handle.send(VoiceEvent::Stop).await.unwrap();
    wait_for(&rig.handle, VoiceState::Idle).await;
    assert!(rig.handler.heard.lock().unwrap().is_empty());
}
