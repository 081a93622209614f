use std::{cmp::Ordering, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{AnalysisConfig, AudioBuffer, DropError, Result};

/// Floor applied to bin power before taking the logarithm.
const AMIN: f32 = 1e-10;

/// One sample of the onset envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePoint {
    pub time: f32,
    pub strength: f32,
}

/// Loudness-change strength sampled once per hop.
///
/// Times are strictly increasing (`i * hop_size / sample_rate`) and every
/// strength is non-negative.
#[derive(Debug, Clone, PartialEq)]
pub struct OnsetEnvelope {
    times: Vec<f32>,
    strengths: Vec<f32>,
    sample_rate: u32,
    hop_size: usize,
}

impl OnsetEnvelope {
    /// Builds an envelope from precomputed strengths, deriving the time axis
    /// from the sample rate and hop size.
    pub fn from_strengths(strengths: Vec<f32>, sample_rate: u32, hop_size: usize) -> Result<Self> {
        if sample_rate == 0 || hop_size == 0 {
            return Err(DropError::invalid(
                "envelope requires a positive sample rate and hop size",
            ));
        }
        if let Some(bad) = strengths.iter().find(|s| !s.is_finite() || **s < 0.0) {
            return Err(DropError::invalid(format!(
                "envelope strengths must be finite and non-negative, found {bad}"
            )));
        }

        let times = (0..strengths.len())
            .map(|i| frame_time(i, sample_rate, hop_size))
            .collect();
        Ok(Self {
            times,
            strengths,
            sample_rate,
            hop_size,
        })
    }

    pub fn times(&self) -> &[f32] {
        &self.times
    }

    pub fn strengths(&self) -> &[f32] {
        &self.strengths
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn len(&self) -> usize {
        self.strengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty()
    }

    /// Seconds between consecutive envelope samples.
    pub fn hop_seconds(&self) -> f32 {
        (self.hop_size as f64 / self.sample_rate as f64) as f32
    }

    pub fn point(&self, index: usize) -> Option<EnvelopePoint> {
        Some(EnvelopePoint {
            time: *self.times.get(index)?,
            strength: *self.strengths.get(index)?,
        })
    }

    pub fn points(&self) -> impl Iterator<Item = EnvelopePoint> + '_ {
        self.times
            .iter()
            .zip(&self.strengths)
            .map(|(&time, &strength)| EnvelopePoint { time, strength })
    }

    pub fn peak_strength(&self) -> f32 {
        self.strengths.iter().copied().fold(0.0, f32::max)
    }
}

/// Converts raw samples into an onset-strength envelope.
///
/// Frames of `frame_size` samples are centred on every multiple of
/// `hop_size` (zero padded at the edges), so a buffer of `n` samples yields
/// `1 + n / hop_size` frames. Each frame is Hann windowed and transformed; the
/// bin powers are converted to decibels relative to the loudest bin of the
/// whole track and floored at `-top_db`. The strength of frame `i` is the
/// median over bins of the rectified dB increase from frame `i - 1`, so the
/// scale reads as "decibels of typical per-bin rise". Frame 0 has strength 0.
pub struct OnsetEnvelopeExtractor {
    hop_size: usize,
    frame_size: usize,
    top_db: f32,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl OnsetEnvelopeExtractor {
    /// Creates an extractor with the default frame size and dynamic range.
    pub fn new(hop_size: usize) -> Result<Self> {
        Self::from_config(&AnalysisConfig {
            hop_size,
            ..AnalysisConfig::default()
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hop_size: config.hop_size,
            frame_size: config.frame_size,
            top_db: config.top_db,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        })
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of frames produced for a buffer of `len` samples.
    pub fn frame_count(&self, len: usize) -> usize {
        1 + len / self.hop_size
    }

    pub fn extract(&mut self, buffer: &AudioBuffer) -> Result<OnsetEnvelope> {
        if buffer.is_empty() {
            return Err(DropError::invalid("cannot analyse an empty audio buffer"));
        }
        if buffer.sample_rate() == 0 {
            return Err(DropError::invalid("sample rate must be positive"));
        }

        let frames = self.frame_count(buffer.len());
        let samples = buffer.samples();

        // First pass finds the reference power for the dB conversion.
        let mut reference = AMIN;
        for frame in 0..frames {
            for power in self.frame_power(samples, frame)? {
                reference = reference.max(*power);
            }
        }
        let ref_db = power_to_db(reference);
        let floor_db = -self.top_db;

        let bins = self.frame_size / 2 + 1;
        let mut previous = vec![0.0_f32; bins];
        let mut current = vec![0.0_f32; bins];
        let mut rises = vec![0.0_f32; bins];
        let mut strengths = Vec::with_capacity(frames);

        for frame in 0..frames {
            let powers = self.frame_power(samples, frame)?;
            for (db, power) in current.iter_mut().zip(powers) {
                *db = (power_to_db(*power) - ref_db).max(floor_db);
            }

            if frame == 0 {
                strengths.push(0.0);
            } else {
                for ((rise, now), before) in rises.iter_mut().zip(&current).zip(&previous) {
                    *rise = (now - before).max(0.0);
                }
                strengths.push(median(&mut rises));
            }
            std::mem::swap(&mut previous, &mut current);
        }

        tracing::debug!(
            frames,
            hop_size = self.hop_size,
            frame_size = self.frame_size,
            "extracted onset envelope"
        );
        OnsetEnvelope::from_strengths(strengths, buffer.sample_rate(), self.hop_size)
    }

    /// Power spectrum of the frame centred on `frame * hop_size`.
    fn frame_power(&mut self, samples: &[f32], frame: usize) -> Result<&[f32]> {
        let start = (frame * self.hop_size) as isize - (self.frame_size / 2) as isize;
        let fft = self.prepare_fft();

        for (k, slot) in fft.input.iter_mut().enumerate() {
            let index = start + k as isize;
            *slot = if index >= 0 && (index as usize) < samples.len() {
                samples[index as usize] * fft.window[k]
            } else {
                0.0
            };
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| DropError::invalid(format!("fft failed: {err}")))?;

        for (power, bin) in fft.power.iter_mut().zip(&fft.spectrum) {
            *power = bin.norm_sqr();
        }
        Ok(&fft.power)
    }

    fn prepare_fft(&mut self) -> &mut FftResources {
        let size = self.frame_size;
        if self.fft.as_ref().map(|fft| fft.size != size).unwrap_or(false) {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft
            .get_or_insert_with(|| FftResources::new(planner, size))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    window: Vec<f32>,
    power: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        let spectrum = plan.make_output_vec();
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            input: plan.make_input_vec(),
            window: (0..size).map(|i| hann_value(i, size)).collect(),
            power: vec![0.0; spectrum.len()],
            spectrum,
            plan,
        }
    }
}

impl fmt::Debug for OnsetEnvelopeExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnsetEnvelopeExtractor")
            .field("hop_size", &self.hop_size)
            .field("frame_size", &self.frame_size)
            .field("top_db", &self.top_db)
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

pub(crate) fn frame_time(index: usize, sample_rate: u32, hop_size: usize) -> f32 {
    ((index * hop_size) as f64 / sample_rate as f64) as f32
}

fn power_to_db(power: f32) -> f32 {
    10.0 * power.max(AMIN).log10()
}

/// Median of `values`, averaging the middle pair for even lengths. Reorders
/// the slice in place.
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    // Periodic Hann, as used for STFT analysis.
    0.5 - 0.5 * ((2.0 * PI * index as f32) / len as f32).cos()
}
