use std::path::{Path, PathBuf};

use crate::{
    AnalysisConfig, AudioBuffer, AudioLoader, AudioOutputDevice, CancellationToken, Clock,
    DropError, DropTimeline, OnsetEnvelopeExtractor, PeakExtractor, PlaybackObserver,
    PlaybackOutcome, PlaybackSynchronizer, Result,
};

/// Owns the state of one analysis: at most one loaded track and at most one
/// timeline derived from it.
///
/// Every operation validates before it mutates, so a failed call leaves the
/// previously loaded buffer and timeline untouched.
#[derive(Debug, Default)]
pub struct AnalysisSession {
    source: Option<PathBuf>,
    buffer: Option<AudioBuffer>,
    timeline: Option<DropTimeline>,
    config: Option<AnalysisConfig>,
}

impl AnalysisSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a track, discarding any timeline computed for the previous one.
    pub fn load(&mut self, loader: &dyn AudioLoader, path: impl AsRef<Path>) -> Result<&AudioBuffer> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading track");
        let buffer = loader.load(path)?;
        Ok(self.install(buffer, Some(path.to_path_buf())))
    }

    /// Installs an already decoded buffer as the session's track.
    pub fn set_buffer(&mut self, buffer: AudioBuffer) -> &AudioBuffer {
        self.install(buffer, None)
    }

    fn install(&mut self, buffer: AudioBuffer, source: Option<PathBuf>) -> &AudioBuffer {
        self.source = source;
        self.timeline = None;
        self.config = None;
        self.buffer.insert(buffer)
    }

    /// Runs onset extraction and peak picking over the loaded track,
    /// replacing any earlier timeline.
    pub fn analyze(&mut self, config: &AnalysisConfig) -> Result<&DropTimeline> {
        let buffer = self
            .buffer
            .as_ref()
            .ok_or(DropError::NotLoaded("load a track before analysing it"))?;

        let peaks = PeakExtractor::from_config(config)?;
        let mut extractor = OnsetEnvelopeExtractor::from_config(config)?;
        let envelope = extractor.extract(buffer)?;
        let drops = peaks.extract(&envelope)?;
        let timeline = DropTimeline::new(envelope, drops)?;

        tracing::info!(
            drops = timeline.drops().len(),
            frames = timeline.times().len(),
            threshold = config.threshold,
            min_distance_seconds = config.min_distance_seconds,
            "analysis complete"
        );
        self.config = Some(config.clone());
        Ok(&*self.timeline.insert(timeline))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn buffer(&self) -> Result<&AudioBuffer> {
        self.buffer
            .as_ref()
            .ok_or(DropError::NotLoaded("no track has been loaded"))
    }

    pub fn timeline(&self) -> Result<&DropTimeline> {
        self.timeline
            .as_ref()
            .ok_or(DropError::NotLoaded("the loaded track has not been analysed"))
    }

    /// Configuration used for the current timeline.
    pub fn analysis_config(&self) -> Option<&AnalysisConfig> {
        self.config.as_ref()
    }

    /// Plays the loaded track with drop notifications from the current
    /// timeline.
    pub fn play<D, C, O>(
        &self,
        synchronizer: &mut PlaybackSynchronizer<D, C>,
        start_time: f32,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<PlaybackOutcome>
    where
        D: AudioOutputDevice,
        C: Clock,
        O: PlaybackObserver + ?Sized,
    {
        let buffer = self.buffer()?;
        let timeline = self.timeline()?;
        synchronizer.play(buffer, timeline, start_time, cancel, observer)
    }
}
