use std::fmt;

/// Result alias that carries the custom [`SyncError`] type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error categories reported by the external playback provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackErrorKind {
    Authentication,
    Account,
    Initialization,
    Playback,
}

impl fmt::Display for PlaybackErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Authentication => "authentication",
            Self::Account => "account",
            Self::Initialization => "initialization",
            Self::Playback => "playback",
        };
        f.write_str(label)
    }
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The analysis provider could not deliver an analysis for the track.
    #[error("failed to fetch analysis for track `{track}`: {reason}")]
    AnalysisFetch { track: String, reason: String },
    /// The playback provider reported a session level failure.
    #[error("playback provider {kind} error: {message}")]
    PlaybackProvider {
        kind: PlaybackErrorKind,
        message: String,
    },
    /// The analysis document is missing required fields or is out of order.
    #[error("malformed analysis: {0}")]
    MalformedAnalysis(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A shared lock was poisoned by a panicking holder.
    #[error("{0} has been poisoned")]
    Poisoned(&'static str),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
    #[error("{0}")]
    Wav(#[from] hound::Error),
}

impl SyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Returns true for provider errors that invalidate the stored credentials.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::PlaybackProvider {
                kind: PlaybackErrorKind::Authentication,
                ..
            }
        )
    }
}

impl From<&str> for SyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for SyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
