//! Beat-synchronised sample overlay.
//!
//! A fixed-interval poller compares the position reported by an external
//! player with a precomputed beat list and fires a local one-shot sample when
//! the two line up. Each new track analysis retunes the sample to the track's
//! key, sets the engine tempo and holds triggers back until the intro fade-in
//! has passed.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod effects;
pub mod error;
pub mod playback;
pub mod session;
pub mod trigger;

pub use analysis::{
    AnalysisProvider, Beat, BeatAnalysis, FileAnalysisProvider, Key, TrackId, TrackSummary,
};
pub use audio::{PitchShift, RenderJob, RenderedEffect, SampleVoice, Sampler, Transport};
pub use config::{AppConfig, PlaybackConfig, SyncConfig};
pub use effects::{configure, EffectsBinder, EffectsConfig};
pub use error::{PlaybackErrorKind, Result, SyncError};
pub use playback::{PlaybackEvent, PlaybackMirror, PlaybackState, SimulatedPlayer};
pub use session::{FetchOutcome, FetchTicket, Poller, SessionSnapshot, SessionStatus, SyncSession};
pub use trigger::{BeatTrigger, TickOutcome};
