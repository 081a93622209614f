use std::{fs, ops::Range, path::Path};

use serde::{Deserialize, Serialize};

use crate::{AnalysisConfig, DropError, DropSet, EnvelopePoint, OnsetEnvelope, Result};

/// Read-only bundle of an onset envelope and the drops picked from it.
#[derive(Debug, Clone, PartialEq)]
pub struct DropTimeline {
    envelope: OnsetEnvelope,
    drops: DropSet,
}

impl DropTimeline {
    /// Bundles analysis results. Every drop must refer to a frame of the
    /// envelope carrying the same timestamp.
    pub fn new(envelope: OnsetEnvelope, drops: DropSet) -> Result<Self> {
        for (&frame, &time) in drops.frames().iter().zip(drops.times()) {
            match envelope.times().get(frame) {
                Some(&expected) if expected == time => {}
                _ => {
                    return Err(DropError::invalid(format!(
                        "drop at {time:.3}s does not match envelope frame {frame}"
                    )))
                }
            }
        }
        Ok(Self { envelope, drops })
    }

    /// Envelope time axis.
    pub fn times(&self) -> &[f32] {
        self.envelope.times()
    }

    pub fn envelope(&self) -> &OnsetEnvelope {
        &self.envelope
    }

    /// Drop timestamps in seconds, strictly increasing.
    pub fn drops(&self) -> &[f32] {
        self.drops.times()
    }

    pub fn drop_set(&self) -> &DropSet {
        &self.drops
    }

    pub fn sample_rate(&self) -> u32 {
        self.envelope.sample_rate()
    }

    /// Indices into [`DropTimeline::drops`] of the drops in `[start, end)`.
    pub fn drop_range(&self, start: f32, end: f32) -> Range<usize> {
        let drops = self.drops.times();
        let first = drops.partition_point(|t| *t < start);
        let last = drops.partition_point(|t| *t < end).max(first);
        first..last
    }

    /// Drops in the half-open window `[start, end)`, in time order.
    pub fn drops_in_window(&self, start: f32, end: f32) -> &[f32] {
        &self.drops.times()[self.drop_range(start, end)]
    }

    /// Serialisable snapshot of the analysis.
    pub fn report(&self, source: impl Into<String>, config: &AnalysisConfig) -> AnalysisReport {
        let duration_seconds = self.times().last().copied().unwrap_or(0.0);
        AnalysisReport {
            source: source.into(),
            sample_rate: self.sample_rate(),
            hop_size: self.envelope.hop_size(),
            threshold: config.threshold,
            min_distance_seconds: config.min_distance_seconds,
            duration_seconds,
            drops: self.drops().to_vec(),
            envelope: self.envelope.points().collect(),
        }
    }
}

/// JSON export of one analysis, written only when the caller asks for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub source: String,
    pub sample_rate: u32,
    pub hop_size: usize,
    pub threshold: f32,
    pub min_distance_seconds: f32,
    /// Time of the last envelope frame.
    pub duration_seconds: f32,
    pub drops: Vec<f32>,
    pub envelope: Vec<EnvelopePoint>,
}

impl AnalysisReport {
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeakExtractor;

    fn timeline() -> DropTimeline {
        // 100 frames per second.
        let mut strengths = vec![0.0_f32; 400];
        for frame in [50, 205, 210, 300] {
            strengths[frame] = 2.0;
        }
        let envelope = OnsetEnvelope::from_strengths(strengths, 100, 1).unwrap();
        let drops = PeakExtractor::new(1.0, 0.01)
            .unwrap()
            .extract(&envelope)
            .unwrap();
        DropTimeline::new(envelope, drops).unwrap()
    }

    #[test]
    fn window_is_half_open() {
        let timeline = timeline();
        assert_eq!(timeline.drops().len(), 4);

        assert_eq!(timeline.drops_in_window(2.0, 2.1), &[2.05]);
        assert_eq!(timeline.drops_in_window(2.1, 2.2), &[2.1]);
        assert!(timeline.drops_in_window(0.0, 0.5).is_empty());
        assert_eq!(timeline.drops_in_window(0.0, 0.51), &[0.5]);
    }

    #[test]
    fn inverted_window_is_empty() {
        let timeline = timeline();
        assert!(timeline.drops_in_window(3.5, 1.0).is_empty());
        assert_eq!(timeline.drop_range(3.5, 1.0).len(), 0);
    }

    #[test]
    fn rejects_drops_that_do_not_match_the_envelope() {
        let envelope = OnsetEnvelope::from_strengths(vec![0.0, 1.0, 0.0], 10, 1).unwrap();
        let other = OnsetEnvelope::from_strengths(vec![0.0, 0.0, 0.0, 1.0, 0.0], 10, 1).unwrap();
        let drops = PeakExtractor::new(0.5, 0.0).unwrap().extract(&other).unwrap();
        assert!(DropTimeline::new(envelope, drops).is_err());
    }

    #[test]
    fn report_round_trips_through_json() {
        let timeline = timeline();
        let report = timeline.report("song.wav", &AnalysisConfig::default());
        assert_eq!(report.drops, timeline.drops());
        assert_eq!(report.envelope.len(), 400);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        assert_eq!(AnalysisReport::read_json(&path).unwrap(), report);
    }
}
