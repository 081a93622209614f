//! Real-time playback with drop notifications.
//!
//! [`PlaybackSynchronizer`] starts an [`AudioOutputDevice`], then polls a
//! [`Clock`] on a fixed cadence, mapping elapsed time onto the
//! [`DropTimeline`] axis and reporting every drop it crosses to a
//! [`PlaybackObserver`]. Rendering lives entirely in the observer, so the loop
//! itself has no display dependency.

mod clock;
mod device;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

pub use self::clock::{Clock, ManualClock, SystemClock};
#[cfg(feature = "device")]
pub use self::device::CpalOutput;
pub use self::device::{AudioOutputDevice, SampleCursor, SilentOutput};
use crate::{AudioBuffer, DropError, DropTimeline, PlaybackConfig, Result};

/// Lifecycle of one playback run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Idle,
    Playing,
    /// The device reached the end of the buffer.
    Stopped,
    /// An external stop signal ended playback early.
    Cancelled,
}

/// Transient position state for a playback run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackCursor {
    /// Track position playback started from, in seconds.
    pub start_time: f32,
    /// Clock reading taken when the device started.
    pub reference: Duration,
    /// Track position at the latest poll, in seconds.
    pub current_time: f32,
}

/// A drop crossed during playback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropEvent {
    /// Position of the drop within [`DropTimeline::drops`].
    pub index: usize,
    pub time: f32,
    /// Track position of the poll that reported the drop.
    pub detected_at: f32,
    /// Set when the poll that reported the drop ran after the drop itself.
    pub late: bool,
}

/// Result of a finished playback run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackOutcome {
    pub state: PlaybackState,
    pub cursor: PlaybackCursor,
    pub drops_emitted: usize,
}

/// Consumer of playback progress.
pub trait PlaybackObserver {
    /// Called once per poll, before any drops of that poll are reported.
    fn on_tick(&mut self, _cursor: &PlaybackCursor) {}

    fn on_drop(&mut self, event: &DropEvent);

    fn on_finish(&mut self, _outcome: &PlaybackOutcome) {}
}

impl PlaybackObserver for Vec<DropEvent> {
    fn on_drop(&mut self, event: &DropEvent) {
        self.push(*event);
    }
}

impl<O: PlaybackObserver + ?Sized> PlaybackObserver for &mut O {
    fn on_tick(&mut self, cursor: &PlaybackCursor) {
        (**self).on_tick(cursor)
    }

    fn on_drop(&mut self, event: &DropEvent) {
        (**self).on_drop(event)
    }

    fn on_finish(&mut self, outcome: &PlaybackOutcome) {
        (**self).on_finish(outcome)
    }
}

/// Message forwarded by [`ChannelObserver`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackUpdate {
    Tick(PlaybackCursor),
    Drop(DropEvent),
    Finished(PlaybackOutcome),
}

/// Forwards progress to another thread, typically a renderer. A disconnected
/// receiver does not interrupt playback.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<PlaybackUpdate>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<PlaybackUpdate>) -> Self {
        Self { sender }
    }

    fn forward(&self, update: PlaybackUpdate) {
        if self.sender.send(update).is_err() {
            tracing::trace!("playback receiver disconnected");
        }
    }
}

impl PlaybackObserver for ChannelObserver {
    fn on_tick(&mut self, cursor: &PlaybackCursor) {
        self.forward(PlaybackUpdate::Tick(*cursor));
    }

    fn on_drop(&mut self, event: &DropEvent) {
        self.forward(PlaybackUpdate::Drop(*event));
    }

    fn on_finish(&mut self, outcome: &PlaybackOutcome) {
        self.forward(PlaybackUpdate::Finished(*outcome));
    }
}

/// Shared stop signal. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Stops the device when dropped, whichever way the loop exits.
struct DeviceGuard<'a, D: AudioOutputDevice> {
    device: &'a mut D,
}

impl<D: AudioOutputDevice> Drop for DeviceGuard<'_, D> {
    fn drop(&mut self) {
        self.device.stop();
    }
}

/// Drives one output device against one clock.
///
/// Each poll covers the half-open window from the previous poll's horizon up
/// to `current_time + poll_interval`. Consecutive windows share their edges,
/// so every drop at or after the start position is reported exactly once and
/// in time order, even when a poll runs late.
#[derive(Debug)]
pub struct PlaybackSynchronizer<D, C> {
    device: D,
    clock: C,
    poll_interval: Duration,
    state: PlaybackState,
}

impl<D: AudioOutputDevice, C: Clock> PlaybackSynchronizer<D, C> {
    pub fn new(device: D, clock: C, config: &PlaybackConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            device,
            clock,
            poll_interval: config.poll_interval(),
            state: PlaybackState::Idle,
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Plays `buffer` from `start_time` until the device finishes or `cancel`
    /// fires, reporting drops from `timeline` to `observer`.
    ///
    /// Cancellation is observed within one poll interval and the device is
    /// always stopped before this returns.
    pub fn play<O: PlaybackObserver + ?Sized>(
        &mut self,
        buffer: &AudioBuffer,
        timeline: &DropTimeline,
        start_time: f32,
        cancel: &CancellationToken,
        observer: &mut O,
    ) -> Result<PlaybackOutcome> {
        if !start_time.is_finite() || start_time < 0.0 {
            return Err(DropError::invalid(format!(
                "start time must be a non-negative number of seconds, got {start_time}"
            )));
        }
        let duration = buffer.duration_seconds();
        if start_time > duration {
            return Err(DropError::InvalidRange {
                start: start_time,
                duration,
            });
        }
        if buffer.sample_rate() != timeline.sample_rate() {
            return Err(DropError::invalid(format!(
                "timeline was analysed at {} Hz but the buffer plays at {} Hz",
                timeline.sample_rate(),
                buffer.sample_rate()
            )));
        }

        let offset = buffer.sample_offset(start_time);
        self.device.play(buffer.tail(offset), buffer.sample_rate())?;
        let guard = DeviceGuard {
            device: &mut self.device,
        };
        self.state = PlaybackState::Playing;

        let reference = self.clock.now();
        let mut cursor = PlaybackCursor {
            start_time,
            reference,
            current_time: start_time,
        };
        tracing::info!(start_time, drops = timeline.drops().len(), "playback started");

        let poll_seconds = self.poll_interval.as_secs_f32();
        let mut horizon = start_time;
        let mut drops_emitted = 0;

        let state = loop {
            if cancel.is_cancelled() {
                break PlaybackState::Cancelled;
            }
            if !guard.device.is_active() {
                break PlaybackState::Stopped;
            }

            let elapsed = self.clock.now().saturating_sub(reference);
            cursor.current_time = start_time + elapsed.as_secs_f32();
            observer.on_tick(&cursor);

            let next_horizon = (cursor.current_time + poll_seconds).max(horizon);
            for index in timeline.drop_range(horizon, next_horizon) {
                let time = timeline.drops()[index];
                let event = DropEvent {
                    index,
                    time,
                    detected_at: cursor.current_time,
                    late: time < cursor.current_time,
                };
                tracing::debug!(time, detected_at = cursor.current_time, "drop reached");
                observer.on_drop(&event);
                drops_emitted += 1;
            }
            horizon = next_horizon;

            self.clock.sleep(self.poll_interval);
        };

        drop(guard);
        self.state = state;

        let outcome = PlaybackOutcome {
            state,
            cursor,
            drops_emitted,
        };
        tracing::info!(
            ?state,
            position = cursor.current_time,
            drops_emitted,
            "playback finished"
        );
        observer.on_finish(&outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OnsetEnvelope, PeakExtractor};

    const POLL: Duration = Duration::from_millis(100);

    /// Timeline at 100 frames per second with isolated peaks at `frames`.
    fn timeline(frames: &[usize], len: usize) -> DropTimeline {
        let mut strengths = vec![0.0_f32; len];
        for &frame in frames {
            strengths[frame] = 1.0;
        }
        let envelope = OnsetEnvelope::from_strengths(strengths, 100, 1).unwrap();
        let drops = PeakExtractor::new(0.5, 0.0)
            .unwrap()
            .extract(&envelope)
            .unwrap();
        DropTimeline::new(envelope, drops).unwrap()
    }

    fn buffer(seconds: usize) -> AudioBuffer {
        AudioBuffer::new(vec![0.0_f32; seconds * 100], 100)
    }

    fn synchronizer(clock: &ManualClock) -> PlaybackSynchronizer<SilentOutput<ManualClock>, ManualClock> {
        PlaybackSynchronizer::new(
            SilentOutput::new(clock.clone()),
            clock.clone(),
            &PlaybackConfig {
                poll_interval_ms: 100,
            },
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        ticks: Vec<f32>,
        drops: Vec<DropEvent>,
        finished: Option<PlaybackState>,
    }

    impl PlaybackObserver for Recorder {
        fn on_tick(&mut self, cursor: &PlaybackCursor) {
            self.ticks.push(cursor.current_time);
        }

        fn on_drop(&mut self, event: &DropEvent) {
            self.drops.push(*event);
        }

        fn on_finish(&mut self, outcome: &PlaybackOutcome) {
            self.finished = Some(outcome.state);
        }
    }

    #[test]
    fn drop_is_reported_once_in_its_window() {
        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let timeline = timeline(&[205], 300);
        let mut recorder = Recorder::default();

        let outcome = sync
            .play(&buffer(3), &timeline, 2.0, &CancellationToken::new(), &mut recorder)
            .unwrap();

        assert_eq!(outcome.state, PlaybackState::Stopped);
        assert_eq!(recorder.drops.len(), 1);
        let event = recorder.drops[0];
        approx::assert_abs_diff_eq!(event.time, 2.05, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(event.detected_at, 2.0, epsilon = 1e-6);
        assert!(!event.late);
        assert!(recorder.ticks.len() > 2, "polled into [2.1, 2.2) as well");
        assert_eq!(recorder.finished, Some(PlaybackState::Stopped));
    }

    #[test]
    fn every_drop_after_start_is_reported_in_order() {
        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let timeline = timeline(&[30, 120, 121, 450, 800, 999], 1_000);
        let mut events: Vec<DropEvent> = Vec::new();

        let outcome = sync
            .play(&buffer(10), &timeline, 1.0, &CancellationToken::new(), &mut events)
            .unwrap();

        // Frames 120/121 form a plateau and 999 is an endpoint, leaving drops
        // at 0.3 s, 4.5 s and 8.0 s. The first precedes the start position.
        let indices: Vec<usize> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(outcome.drops_emitted, 2);
        assert!(events.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(sync.state(), PlaybackState::Stopped);
        assert!(!sync.device().is_active());
    }

    #[test]
    fn late_polls_still_report_skipped_drops() {
        struct Stall<'a> {
            clock: &'a ManualClock,
            stalled: bool,
            events: Vec<DropEvent>,
        }

        impl PlaybackObserver for Stall<'_> {
            fn on_tick(&mut self, _cursor: &PlaybackCursor) {
                if !self.stalled {
                    self.stalled = true;
                    // The next poll arrives half a second late.
                    self.clock.advance(Duration::from_millis(500));
                }
            }

            fn on_drop(&mut self, event: &DropEvent) {
                self.events.push(*event);
            }
        }

        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let timeline = timeline(&[30], 200);
        let mut observer = Stall {
            clock: &clock,
            stalled: false,
            events: Vec::new(),
        };

        sync.play(&buffer(2), &timeline, 0.0, &CancellationToken::new(), &mut observer)
            .unwrap();

        assert_eq!(observer.events.len(), 1);
        assert!(observer.events[0].late);
    }

    #[test]
    fn cancellation_stops_the_device_within_one_poll() {
        struct CancelAt {
            token: CancellationToken,
            at: f32,
            last_tick: f32,
        }

        impl PlaybackObserver for CancelAt {
            fn on_tick(&mut self, cursor: &PlaybackCursor) {
                self.last_tick = cursor.current_time;
                if cursor.current_time >= self.at {
                    self.token.cancel();
                }
            }

            fn on_drop(&mut self, _event: &DropEvent) {}
        }

        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let token = CancellationToken::new();
        let timeline = timeline(&[500], 1_000);
        let mut observer = CancelAt {
            token: token.clone(),
            at: 1.0,
            last_tick: 0.0,
        };

        let outcome = sync
            .play(&buffer(10), &timeline, 0.0, &token, &mut observer)
            .unwrap();

        assert_eq!(outcome.state, PlaybackState::Cancelled);
        assert_eq!(outcome.drops_emitted, 0);
        assert!(observer.last_tick < 1.0 + POLL.as_secs_f32() + 1e-3);
        assert!(!sync.device().is_active());
    }

    #[test]
    fn rejects_start_beyond_the_track() {
        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let timeline = timeline(&[50], 100);
        let mut events: Vec<DropEvent> = Vec::new();

        let err = sync
            .play(&buffer(1), &timeline, 1.5, &CancellationToken::new(), &mut events)
            .unwrap_err();
        assert!(matches!(err, DropError::InvalidRange { .. }));
        assert_eq!(sync.state(), PlaybackState::Idle);

        let err = sync
            .play(&buffer(1), &timeline, -1.0, &CancellationToken::new(), &mut events)
            .unwrap_err();
        assert!(matches!(err, DropError::InvalidInput(_)));
    }

    #[test]
    fn channel_observer_forwards_updates() {
        let clock = ManualClock::new();
        let mut sync = synchronizer(&clock);
        let timeline = timeline(&[50], 100);
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut observer = ChannelObserver::new(tx);

        sync.play(&buffer(1), &timeline, 0.0, &CancellationToken::new(), &mut observer)
            .unwrap();
        drop(observer);

        let updates: Vec<PlaybackUpdate> = rx.iter().collect();
        assert!(matches!(updates.first(), Some(PlaybackUpdate::Tick(_))));
        assert_eq!(
            updates
                .iter()
                .filter(|u| matches!(u, PlaybackUpdate::Drop(_)))
                .count(),
            1
        );
        assert!(matches!(
            updates.last(),
            Some(PlaybackUpdate::Finished(PlaybackOutcome {
                state: PlaybackState::Stopped,
                ..
            }))
        ));
    }
}
