//! Core library for the Drop Detector application.
//!
//! Raw samples flow through [`OnsetEnvelopeExtractor`] into an
//! [`OnsetEnvelope`], [`PeakExtractor`] picks a [`DropSet`] out of it, and the
//! pair is frozen into a [`DropTimeline`]. [`PlaybackSynchronizer`] replays a
//! track against that timeline and reports drops as playback crosses them.
//! [`AnalysisSession`] ties the steps together for callers that want one
//! object owning the loaded track and its results.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod peaks;
pub mod playback;
pub mod session;
pub mod timeline;

pub use analysis::{EnvelopePoint, OnsetEnvelope, OnsetEnvelopeExtractor};
pub use audio::{scan_folder, AudioBuffer, AudioLoader, SymphoniaLoader};
pub use config::{AnalysisConfig, AppConfig, PlaybackConfig};
pub use error::{DropError, Result};
pub use peaks::{DropSet, PeakExtractor};
#[cfg(feature = "device")]
pub use playback::CpalOutput;
pub use playback::{
    AudioOutputDevice, CancellationToken, ChannelObserver, Clock, DropEvent, ManualClock,
    PlaybackCursor, PlaybackObserver, PlaybackOutcome, PlaybackState, PlaybackSynchronizer,
    PlaybackUpdate, SampleCursor, SilentOutput, SystemClock,
};
pub use session::AnalysisSession;
pub use timeline::{AnalysisReport, DropTimeline};
