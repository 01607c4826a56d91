use std::{
    f32::consts::{PI, TAU},
    path::Path,
    sync::Arc,
};

use realfft::{num_complex::Complex32, RealFftPlanner};

use crate::{Result, SyncError};

const FRAME_SIZE: usize = 2048;
const OVERSAMPLING: usize = 4;
/// Sum of squared Hann windows per sample at four-times overlap.
const WINDOW_GAIN: f32 = 0.375 * OVERSAMPLING as f32;
const DEFAULT_BPM: f64 = 120.0;
const CLICK_HZ: f32 = 392.0;
const CLICK_SECONDS: f32 = 0.15;

/// Deferred rendering of an effect. Owns everything it needs, so it can run
/// on another thread while the voice keeps playing.
pub type RenderJob = Box<dyn FnOnce() -> Result<RenderedEffect> + Send>;

/// An effect whose output was computed ahead of time.
#[derive(Debug, Clone)]
pub struct RenderedEffect {
    effect: PitchShift,
    wet: Option<Arc<[f32]>>,
}

impl RenderedEffect {
    /// An effect with nothing rendered in advance.
    pub fn bare(effect: PitchShift) -> Self {
        Self { effect, wet: None }
    }

    pub fn effect(&self) -> PitchShift {
        self.effect
    }
}

/// One-shot sample handle exposed by the audio engine.
pub trait SampleVoice: Send {
    /// Plays the sample from the top. Calling it while the previous start is
    /// still audible restarts the voice.
    fn start(&mut self);

    /// Routes the voice through `effect`, replacing any previous effect.
    fn connect(&mut self, effect: PitchShift) -> Result<()>;

    /// Returns the expensive half of [`SampleVoice::connect`] as a job that
    /// does not borrow the voice.
    fn prepare(&self, effect: PitchShift) -> RenderJob {
        Box::new(move || Ok(RenderedEffect::bare(effect)))
    }

    /// Swaps in an effect produced by [`SampleVoice::prepare`].
    fn install(&mut self, rendered: RenderedEffect) -> Result<()> {
        self.connect(rendered.effect())
    }
}

/// Duration preserving pitch shift by a number of semitones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchShift {
    semitones: f32,
}

impl PitchShift {
    pub fn new(semitones: f32) -> Self {
        Self { semitones }
    }

    pub fn semitones(&self) -> f32 {
        self.semitones
    }

    /// Frequency ratio applied by the effect.
    pub fn ratio(&self) -> f32 {
        2.0_f32.powf(self.semitones / 12.0)
    }

    /// Renders `input` through a phase vocoder. The output has the same length
    /// as the input.
    pub fn process(&self, input: &[f32]) -> Result<Vec<f32>> {
        if self.semitones == 0.0 || input.is_empty() {
            return Ok(input.to_vec());
        }

        let ratio = self.ratio();
        let hop = FRAME_SIZE / OVERSAMPLING;
        let bins = FRAME_SIZE / 2 + 1;
        let expected = TAU * hop as f32 / FRAME_SIZE as f32;
        let scale = 1.0 / (FRAME_SIZE as f32 * WINDOW_GAIN);

        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(FRAME_SIZE);
        let inverse = planner.plan_fft_inverse(FRAME_SIZE);
        let mut frame = forward.make_input_vec();
        let mut spectrum = forward.make_output_vec();
        let mut synthesis = inverse.make_output_vec();
        let mut forward_scratch = forward.make_scratch_vec();
        let mut inverse_scratch = inverse.make_scratch_vec();

        let window: Vec<f32> = (0..FRAME_SIZE).map(|i| hann_value(i, FRAME_SIZE)).collect();
        let mut last_phase = vec![0.0_f32; bins];
        let mut sum_phase = vec![0.0_f32; bins];
        let mut analysis_mag = vec![0.0_f32; bins];
        let mut analysis_freq = vec![0.0_f32; bins];
        let mut synth_mag = vec![0.0_f32; bins];
        let mut synth_freq = vec![0.0_f32; bins];

        // Pad both ends so every input sample is covered by a full set of frames.
        let padded_len = input.len() + 2 * FRAME_SIZE;
        let mut padded = vec![0.0_f32; padded_len];
        padded[FRAME_SIZE..FRAME_SIZE + input.len()].copy_from_slice(input);
        let mut output = vec![0.0_f32; padded_len];

        let mut start = 0;
        while start + FRAME_SIZE <= padded_len {
            for (i, slot) in frame.iter_mut().enumerate() {
                *slot = padded[start + i] * window[i];
            }
            forward.process_with_scratch(&mut frame, &mut spectrum, &mut forward_scratch)?;

            for (k, bin) in spectrum.iter().enumerate() {
                let (magnitude, phase) = bin.to_polar();
                let delta = wrap_phase(phase - last_phase[k] - k as f32 * expected);
                last_phase[k] = phase;
                analysis_mag[k] = magnitude;
                analysis_freq[k] = k as f32 + delta * OVERSAMPLING as f32 / TAU;
            }

            synth_mag.fill(0.0);
            synth_freq.fill(0.0);
            for k in 0..bins {
                let target = (k as f32 * ratio).round() as usize;
                if target < bins {
                    synth_mag[target] += analysis_mag[k];
                    synth_freq[target] = analysis_freq[k] * ratio;
                }
            }

            for (k, bin) in spectrum.iter_mut().enumerate() {
                let deviation = synth_freq[k] - k as f32;
                let advance = TAU * deviation / OVERSAMPLING as f32 + k as f32 * expected;
                sum_phase[k] = wrap_phase(sum_phase[k] + advance);
                *bin = Complex32::from_polar(synth_mag[k], sum_phase[k]);
            }
            // DC and Nyquist must be purely real for the inverse transform.
            spectrum[0].im = 0.0;
            spectrum[bins - 1].im = 0.0;

            inverse.process_with_scratch(&mut spectrum, &mut synthesis, &mut inverse_scratch)?;
            for (i, sample) in synthesis.iter().enumerate() {
                output[start + i] += sample * window[i] * scale;
            }

            start += hop;
        }

        output.drain(..FRAME_SIZE);
        output.truncate(input.len());
        Ok(output)
    }
}

/// Shared tempo of the audio engine, in beats per minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    bpm: f64,
}

impl Default for Transport {
    fn default() -> Self {
        Self { bpm: DEFAULT_BPM }
    }
}

impl Transport {
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm;
    }
}

/// In-memory one-shot voice with a single effect slot.
///
/// The wet buffer is replaced whenever a different effect is connected, and
/// the previous effect is dropped at that point, so repeated reconnection never
/// accumulates effect instances.
#[derive(Debug, Clone)]
pub struct Sampler {
    sample_rate: u32,
    dry: Arc<[f32]>,
    wet: Arc<[f32]>,
    effect: Option<PitchShift>,
    playhead: Option<usize>,
    starts: u64,
}

impl Sampler {
    pub fn new(dry: Vec<f32>, sample_rate: u32) -> Self {
        let dry: Arc<[f32]> = dry.into();
        Self {
            sample_rate,
            wet: Arc::clone(&dry),
            dry,
            effect: None,
            playhead: None,
            starts: 0,
        }
    }

    /// Short decaying G4 tone, used when no sample file is supplied.
    pub fn click(sample_rate: u32) -> Self {
        let len = (sample_rate as f32 * CLICK_SECONDS) as usize;
        let rate = sample_rate as f32;
        let dry = (0..len)
            .map(|i| {
                let t = i as f32 / rate;
                (TAU * CLICK_HZ * t).sin() * (-t * 30.0).exp() * 0.5
            })
            .collect();
        Self::new(dry, sample_rate)
    }

    /// Loads a WAV file and downmixes it to mono.
    pub fn load_wav(path: &Path) -> Result<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|x| x as f32 / max))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };

        if samples.is_empty() {
            return Err(SyncError::msg(format!("`{}` contains no audio", path.display())));
        }

        let dry = samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        Ok(Self::new(dry, spec.sample_rate))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn effect(&self) -> Option<&PitchShift> {
        self.effect.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.playhead.is_some()
    }

    /// Number of times the voice was started.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Mixes the voice into `out` and returns how many samples were written.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let Some(position) = self.playhead else {
            return 0;
        };
        let remaining = self.wet.get(position..).unwrap_or_default();
        let written = remaining.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(&remaining[..written]) {
            *slot += sample;
        }

        let next = position + written;
        self.playhead = (next < self.wet.len()).then_some(next);
        written
    }
}

impl SampleVoice for Sampler {
    fn start(&mut self) {
        self.starts += 1;
        self.playhead = Some(0);
    }

    fn connect(&mut self, effect: PitchShift) -> Result<()> {
        if self.effect.as_ref() == Some(&effect) {
            return Ok(());
        }
        self.wet = effect.process(&self.dry)?.into();
        self.effect = Some(effect);
        tracing::debug!(semitones = effect.semitones(), "pitch shift connected");
        Ok(())
    }

    fn prepare(&self, effect: PitchShift) -> RenderJob {
        if self.effect.as_ref() == Some(&effect) {
            return Box::new(move || Ok(RenderedEffect::bare(effect)));
        }
        let dry = Arc::clone(&self.dry);
        Box::new(move || {
            let wet = effect.process(&dry)?;
            Ok(RenderedEffect {
                effect,
                wet: Some(wet.into()),
            })
        })
    }

    fn install(&mut self, rendered: RenderedEffect) -> Result<()> {
        let RenderedEffect { effect, wet } = rendered;
        match wet {
            Some(wet) if self.effect.as_ref() != Some(&effect) => {
                self.wet = wet;
                self.effect = Some(effect);
                tracing::debug!(semitones = effect.semitones(), "pitch shift installed");
                Ok(())
            }
            _ => self.connect(effect),
        }
    }
}

fn wrap_phase(phase: f32) -> f32 {
    phase - TAU * ((phase + PI) / TAU).floor()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
