use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

const KEY_NAMES: [&str; 12] = [
    "C",
    "C♯ / D♭",
    "D",
    "D♯ / E♭",
    "E",
    "F",
    "F♯ / G♭",
    "G",
    "G♯ / A♭",
    "A",
    "A♯ / B♭",
    "B",
];

/// Identifier of a track in the external catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Musical key as reported by the analysis provider. `-1` marks an unknown key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(i32);

impl Key {
    pub const UNKNOWN: Key = Key(-1);

    pub fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the pitch class (0 = C) when the key is known.
    pub fn pitch_class(self) -> Option<i32> {
        (0..=11).contains(&self.0).then_some(self.0)
    }

    pub fn name(self) -> &'static str {
        self.pitch_class()
            .map(|class| KEY_NAMES[class as usize])
            .unwrap_or("Unknown")
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// A single rhythmic pulse, in seconds from the start of the track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    pub start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Beat {
    pub fn at(start: f64) -> Self {
        Self {
            start,
            duration: None,
            confidence: None,
        }
    }
}

/// Track level attributes of an analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    #[serde(default)]
    pub tempo: Option<f64>,
    #[serde(default)]
    pub key: Key,
    #[serde(default)]
    pub end_of_fade_in: Option<f64>,
    /// Track length in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
}

impl TrackSummary {
    /// Tempo rounded to the nearest whole beat per minute.
    pub fn display_bpm(&self) -> Option<u32> {
        self.tempo
            .filter(|tempo| tempo.is_finite() && *tempo > 0.0)
            .map(|tempo| tempo.round() as u32)
    }
}

/// Immutable per-track analysis: beat timestamps plus key, tempo and fade-in.
///
/// A new track replaces the whole value; it is never edited in place. Beats
/// are sorted ascending by `start` and finite however the value is built,
/// deserialisation included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAnalysis")]
pub struct BeatAnalysis {
    beats: Vec<Beat>,
    track: TrackSummary,
}

/// Wire shape of an analysis document before validation.
#[derive(Deserialize)]
struct RawAnalysis {
    beats: Vec<Beat>,
    track: TrackSummary,
}

impl TryFrom<RawAnalysis> for BeatAnalysis {
    type Error = SyncError;

    fn try_from(raw: RawAnalysis) -> Result<Self> {
        Self::new(raw.beats, raw.track)
    }
}

impl BeatAnalysis {
    pub fn new(beats: Vec<Beat>, track: TrackSummary) -> Result<Self> {
        let analysis = Self { beats, track };
        analysis.validate()?;
        Ok(analysis)
    }

    /// Parses the provider's audio-analysis document. Unknown sections such as
    /// bars or segments are ignored.
    pub fn from_json(raw: &str) -> Result<Self> {
        let raw: RawAnalysis = serde_json::from_str(raw)
            .map_err(|err| SyncError::MalformedAnalysis(err.to_string()))?;
        Self::try_from(raw)
    }

    pub fn beats(&self) -> &[Beat] {
        &self.beats
    }

    pub fn track(&self) -> &TrackSummary {
        &self.track
    }

    /// Track length, falling back to one second past the last beat when the
    /// provider did not report a duration.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.track
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .or_else(|| self.beats.last().map(|beat| beat.start + 1.0))
    }

    fn validate(&self) -> Result<()> {
        if let Some(index) = self.beats.iter().position(|beat| !beat.start.is_finite()) {
            return Err(SyncError::MalformedAnalysis(format!(
                "beat {index} has a non-finite start"
            )));
        }
        if let Some(index) = self
            .beats
            .windows(2)
            .position(|pair| pair[1].start < pair[0].start)
        {
            return Err(SyncError::MalformedAnalysis(format!(
                "beats are not sorted ascending at index {}",
                index + 1
            )));
        }
        Ok(())
    }
}

/// Source of beat analyses, typically a remote web API.
pub trait AnalysisProvider: Send + Sync {
    fn fetch(&self, track: &TrackId) -> Result<BeatAnalysis>;
}

/// Reads analyses stored as `<dir>/<track-id>.json`.
#[derive(Debug, Clone)]
pub struct FileAnalysisProvider {
    dir: PathBuf,
}

impl FileAnalysisProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Builds a provider for a single analysis file, using its stem as the id.
    pub fn for_file(path: &Path) -> Result<(Self, TrackId)> {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| SyncError::msg(format!("`{}` has no file name", path.display())))?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok((Self::new(dir), TrackId::new(stem)))
    }

    fn path_for(&self, track: &TrackId) -> PathBuf {
        self.dir.join(format!("{track}.json"))
    }
}

impl AnalysisProvider for FileAnalysisProvider {
    fn fetch(&self, track: &TrackId) -> Result<BeatAnalysis> {
        let path = self.path_for(track);
        let raw = std::fs::read_to_string(&path).map_err(|err| SyncError::AnalysisFetch {
            track: track.to_string(),
            reason: format!("{}: {err}", path.display()),
        })?;
        BeatAnalysis::from_json(&raw)
    }
}
