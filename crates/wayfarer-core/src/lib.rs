pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod rate_limit;
pub mod security;
pub mod session;
pub mod tool;
pub mod travel_tools;
pub mod voice;

pub use audit::*;
pub use config::*;
pub use dispatcher::*;
pub use orchestrator::*;
pub use rate_limit::*;
pub use security::*;
pub use session::*;
pub use tool::*;
pub use travel_tools::*;
pub use voice::{
    strip_wake_word, AudioFrame, AudioSink, HttpSynthesizer, HttpTranscriber, Synthesizer,
    Transcriber, UtteranceHandler, VoiceCollaborators, VoiceEvent, VoiceHandle, VoiceMode,
    VoiceOutput, VoiceSettings, VoiceTurnController,
};
