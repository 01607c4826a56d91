use crate::{Beat, BeatAnalysis, PlaybackState, SampleVoice, SyncConfig};

/// Result of a single poll of the trigger engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// No playback state or no analysis is available yet.
    Idle,
    Paused,
    CoolingDown { until: f64 },
    NoBeat,
    Fired {
        beat_index: usize,
        progress_seconds: f64,
    },
}

impl TickOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }
}

/// Correlates the external playback position with the beat list and starts
/// the sample when the two line up.
///
/// At most one trigger fires per tick, and none fires before the cooldown
/// floor (`do_not_play_until`, in track seconds).
#[derive(Debug, Clone)]
pub struct BeatTrigger {
    tolerance: f64,
    cooldown: f64,
    do_not_play_until: f64,
    fired: u64,
}

impl BeatTrigger {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            tolerance: config.tolerance_seconds,
            cooldown: config.cooldown_seconds,
            do_not_play_until: 0.0,
            fired: 0,
        }
    }

    pub fn do_not_play_until(&self) -> f64 {
        self.do_not_play_until
    }

    /// Total number of triggers fired since construction.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Moves the cooldown floor, e.g. past a track's fade-in.
    pub fn seed_floor(&mut self, floor: f64) {
        self.do_not_play_until = floor;
    }

    pub fn reset(&mut self) {
        self.do_not_play_until = 0.0;
    }

    /// Index of the first beat within tolerance of `progress_seconds`.
    ///
    /// Beats are sorted, so the first candidate is located by binary search;
    /// the result is the same beat a front-to-back scan would pick.
    pub fn find_beat(&self, beats: &[Beat], progress_seconds: f64) -> Option<usize> {
        let index = beats.partition_point(|beat| beat.start - progress_seconds <= -self.tolerance);
        beats
            .get(index)
            .filter(|beat| (beat.start - progress_seconds).abs() < self.tolerance)
            .map(|_| index)
    }

    pub fn tick(
        &mut self,
        playback: Option<&PlaybackState>,
        analysis: Option<&BeatAnalysis>,
        voice: &mut dyn SampleVoice,
    ) -> TickOutcome {
        let (Some(playback), Some(analysis)) = (playback, analysis) else {
            return TickOutcome::Idle;
        };
        if !playback.is_playing {
            return TickOutcome::Paused;
        }

        let progress_seconds = playback.progress_seconds();
        if progress_seconds < self.do_not_play_until {
            return TickOutcome::CoolingDown {
                until: self.do_not_play_until,
            };
        }

        let Some(beat_index) = self.find_beat(analysis.beats(), progress_seconds) else {
            return TickOutcome::NoBeat;
        };

        voice.start();
        self.fired += 1;
        self.do_not_play_until = progress_seconds + self.cooldown;
        tracing::info!(
            beat_index,
            progress_seconds,
            beat_start = analysis.beats()[beat_index].start,
            "sample triggered"
        );

        TickOutcome::Fired {
            beat_index,
            progress_seconds,
        }
    }
}
