use std::sync::Arc;

use crate::{
    BeatAnalysis, BeatTrigger, PitchShift, RenderJob, RenderedEffect, Result, SampleVoice,
    SyncConfig, Transport,
};

/// Audio engine settings derived from a single analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectsConfig {
    /// Semitones between the track key and the sample's natural key.
    pub key_diff: i32,
    pub tempo_bpm: Option<f64>,
    /// Earliest track position at which a trigger may fire.
    pub cooldown_floor: Option<f64>,
}

impl EffectsConfig {
    pub fn pitch_shift(&self) -> PitchShift {
        PitchShift::new(self.key_diff as f32)
    }
}

/// Computes the engine settings for `analysis`. Pure; applying them is the job
/// of [`EffectsBinder`].
///
/// A key of C (0) leaves the sample untransposed, like an unknown key. Zero or
/// missing tempo and fade-in values are treated as absent.
pub fn configure(analysis: &BeatAnalysis, config: &SyncConfig) -> EffectsConfig {
    let track = analysis.track();

    let key_diff = match track.key.pitch_class() {
        Some(class) if class != 0 => class - config.reference_key,
        _ => 0,
    };
    let tempo_bpm = track.tempo.filter(|tempo| tempo.is_finite() && *tempo > 0.0);
    let cooldown_floor = track
        .end_of_fade_in
        .filter(|fade| fade.is_finite() && *fade > 0.0)
        .map(|fade| fade + config.fade_in_margin_seconds);

    EffectsConfig {
        key_diff,
        tempo_bpm,
        cooldown_floor,
    }
}

/// Applies [`configure`] to the voice, the transport and the trigger engine
/// once per analysis object.
///
/// Binding happens in two steps: [`EffectsBinder::prepare`] hands out the
/// pitch-shift render as a job that needs no access to the engine, and
/// [`EffectsBinder::bind`] swaps the finished render in.
#[derive(Debug)]
pub struct EffectsBinder {
    config: SyncConfig,
    bound: Option<Arc<BeatAnalysis>>,
}

impl EffectsBinder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            bound: None,
        }
    }

    fn is_bound(&self, analysis: &Arc<BeatAnalysis>) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|bound| Arc::ptr_eq(bound, analysis))
    }

    /// Computes the settings for `analysis` and the job rendering its pitch
    /// shift. Returns `None` when this exact analysis object is already bound.
    pub fn prepare(
        &self,
        analysis: &Arc<BeatAnalysis>,
        voice: &dyn SampleVoice,
    ) -> Option<(EffectsConfig, RenderJob)> {
        if self.is_bound(analysis) {
            return None;
        }
        let effects = configure(analysis, &self.config);
        let job = voice.prepare(effects.pitch_shift());
        Some((effects, job))
    }

    /// Reconfigures the engine with settings from [`EffectsBinder::prepare`].
    /// Returns `None` when this exact analysis object is already bound. A
    /// failed install leaves the transport and trigger untouched.
    pub fn bind(
        &mut self,
        analysis: &Arc<BeatAnalysis>,
        effects: EffectsConfig,
        rendered: RenderedEffect,
        voice: &mut dyn SampleVoice,
        transport: &mut Transport,
        trigger: &mut BeatTrigger,
    ) -> Result<Option<EffectsConfig>> {
        if self.is_bound(analysis) {
            return Ok(None);
        }

        voice.install(rendered)?;
        if let Some(bpm) = effects.tempo_bpm {
            transport.set_bpm(bpm);
        }
        if let Some(floor) = effects.cooldown_floor {
            trigger.seed_floor(floor);
        }

        tracing::debug!(
            key_diff = effects.key_diff,
            tempo_bpm = ?effects.tempo_bpm,
            cooldown_floor = ?effects.cooldown_floor,
            "effects bound"
        );
        self.bound = Some(Arc::clone(analysis));
        Ok(Some(effects))
    }
}
