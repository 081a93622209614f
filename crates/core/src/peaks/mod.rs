use serde::{Deserialize, Serialize};

use crate::{
    config::{validate_min_distance, validate_threshold},
    AnalysisConfig, DropError, OnsetEnvelope, Result,
};

/// Detected drops: strictly increasing times together with the envelope
/// frame each one was taken from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DropSet {
    times: Vec<f32>,
    frames: Vec<usize>,
}

impl DropSet {
    pub fn times(&self) -> &[f32] {
        &self.times
    }

    /// Envelope indices of the drops, parallel to [`DropSet::times`].
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    fn push(&mut self, frame: usize, time: f32) {
        self.frames.push(frame);
        self.times.push(time);
    }
}

/// Picks drops out of an onset envelope.
///
/// A frame is a candidate when its strength is at least `threshold` and
/// strictly greater than both neighbours; plateaus and the two endpoints never
/// qualify. Candidates are then accepted greedily from left to right: one is
/// kept only if it lies at least `min_distance_seconds` (and at least
/// `round(min_distance_seconds * sample_rate / hop_size)` frames) after the
/// previously accepted drop. The earliest candidate therefore wins inside an
/// exclusion window even when a later one is stronger.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakExtractor {
    threshold: f32,
    min_distance_seconds: f32,
}

impl PeakExtractor {
    pub fn new(threshold: f32, min_distance_seconds: f32) -> Result<Self> {
        validate_threshold(threshold)?;
        validate_min_distance(min_distance_seconds)?;
        Ok(Self {
            threshold,
            min_distance_seconds,
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Self::new(config.threshold, config.min_distance_seconds)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn min_distance_seconds(&self) -> f32 {
        self.min_distance_seconds
    }

    /// Exclusion window expressed in envelope frames.
    pub fn min_distance_frames(&self, envelope: &OnsetEnvelope) -> usize {
        (self.min_distance_seconds as f64 * envelope.sample_rate() as f64
            / envelope.hop_size() as f64)
            .round() as usize
    }

    pub fn extract(&self, envelope: &OnsetEnvelope) -> Result<DropSet> {
        if envelope.is_empty() {
            return Err(DropError::invalid("cannot pick drops from an empty envelope"));
        }

        let mut drops = DropSet::default();
        let strengths = envelope.strengths();
        if strengths.len() < 3 {
            return Ok(drops);
        }

        let window = self.min_distance_frames(envelope);
        let times = envelope.times();
        let mut last: Option<usize> = None;

        for index in 1..strengths.len() - 1 {
            let value = strengths[index];
            let is_peak = value >= self.threshold
                && value > strengths[index - 1]
                && value > strengths[index + 1];
            if !is_peak {
                continue;
            }

            if let Some(previous) = last {
                // Compared on the stored times so reported drops keep the gap.
                let gap_seconds = times[index] - times[previous];
                if index - previous < window || gap_seconds < self.min_distance_seconds {
                    tracing::trace!(index, previous, "candidate inside exclusion window");
                    continue;
                }
            }

            let time = times[index];
            tracing::debug!(time, strength = value, "drop detected");
            drops.push(index, time);
            last = Some(index);
        }

        Ok(drops)
    }
}
