use std::{sync::Arc, time::Duration};

use super::Clock;
use crate::Result;

/// Audio sink used by the synchroniser. Implementations own their stream;
/// the synchroniser only starts, polls and stops it.
pub trait AudioOutputDevice {
    /// Starts playing `samples` (mono) from the beginning, replacing anything
    /// already playing.
    fn play(&mut self, samples: Arc<[f32]>, sample_rate: u32) -> Result<()>;

    /// Stops output immediately. Calling it on an idle device is a no-op.
    fn stop(&mut self);

    /// Whether samples are still being rendered.
    fn is_active(&self) -> bool;
}

impl<D: AudioOutputDevice + ?Sized> AudioOutputDevice for Box<D> {
    fn play(&mut self, samples: Arc<[f32]>, sample_rate: u32) -> Result<()> {
        (**self).play(samples, sample_rate)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }
}

/// Device-free output that stays active for exactly as long as the buffer
/// would take to play on `clock`.
#[derive(Debug, Clone)]
pub struct SilentOutput<C> {
    clock: C,
    ends_at: Option<Duration>,
}

impl<C: Clock> SilentOutput<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            ends_at: None,
        }
    }
}

impl<C: Clock> AudioOutputDevice for SilentOutput<C> {
    fn play(&mut self, samples: Arc<[f32]>, sample_rate: u32) -> Result<()> {
        let length = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64)
        };
        self.ends_at = Some(self.clock.now() + length);
        Ok(())
    }

    fn stop(&mut self) {
        self.ends_at = None;
    }

    fn is_active(&self) -> bool {
        self.ends_at
            .map(|end| self.clock.now() < end)
            .unwrap_or(false)
    }
}

/// Reads a mono buffer at an output rate that may differ from its own,
/// interpolating linearly between neighbouring samples.
#[derive(Debug, Clone)]
pub struct SampleCursor {
    samples: Arc<[f32]>,
    position: f64,
    step: f64,
}

impl SampleCursor {
    pub fn new(samples: Arc<[f32]>, source_rate: u32, output_rate: u32) -> Self {
        let step = if source_rate == 0 || output_rate == 0 {
            1.0
        } else {
            source_rate as f64 / output_rate as f64
        };
        Self {
            samples,
            position: 0.0,
            step,
        }
    }

    /// Source samples consumed per output sample.
    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn is_finished(&self) -> bool {
        self.position >= self.samples.len() as f64
    }

    /// Next output sample, or `None` once the buffer is exhausted.
    pub fn next_sample(&mut self) -> Option<f32> {
        if self.is_finished() {
            return None;
        }
        let index = self.position as usize;
        let frac = (self.position - index as f64) as f32;
        let current = self.samples[index];
        let next = self.samples.get(index + 1).copied().unwrap_or(current);
        self.position += self.step;
        Some(current + (next - current) * frac)
    }
}

#[cfg(feature = "device")]
pub use self::cpal_output::CpalOutput;

#[cfg(feature = "device")]
mod cpal_output {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        FromSample, SizedSample,
    };

    use super::{AudioOutputDevice, SampleCursor};
    use crate::{DropError, Result};

    /// Plays through the host's default output device in its default format,
    /// duplicating the mono signal onto every channel. Tracks whose rate
    /// differs from the device's are resampled on the fly.
    pub struct CpalOutput {
        stream: Option<cpal::Stream>,
        active: Arc<AtomicBool>,
    }

    impl CpalOutput {
        pub fn new() -> Self {
            Self {
                stream: None,
                active: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Default for CpalOutput {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioOutputDevice for CpalOutput {
        fn play(&mut self, samples: Arc<[f32]>, sample_rate: u32) -> Result<()> {
            self.stop();

            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| DropError::Device("no default output device available".into()))?;
            let supported = device.default_output_config().map_err(DropError::device)?;
            let sample_format = supported.sample_format();
            let config: cpal::StreamConfig = supported.into();
            let device_rate = config.sample_rate.0;

            let active = Arc::new(AtomicBool::new(!samples.is_empty()));
            let cursor = SampleCursor::new(samples, sample_rate, device_rate);

            let stream = match sample_format {
                cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, cursor, &active),
                cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, cursor, &active),
                cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, cursor, &active),
                other => Err(DropError::Device(format!(
                    "unsupported output sample format {other:?}"
                ))),
            }?;
            stream.play().map_err(DropError::device)?;

            tracing::debug!(
                channels = config.channels,
                sample_rate,
                device_rate,
                ?sample_format,
                "output stream started"
            );
            self.stream = Some(stream);
            self.active = active;
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(stream) = self.stream.take() {
                if let Err(err) = stream.pause() {
                    tracing::warn!(%err, "failed to pause output stream");
                }
            }
            self.active.store(false, Ordering::Release);
        }

        fn is_active(&self) -> bool {
            self.stream.is_some() && self.active.load(Ordering::Acquire)
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut cursor: SampleCursor,
        active: &Arc<AtomicBool>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = (config.channels as usize).max(1);
        let active = Arc::clone(active);
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        let sample = cursor.next_sample().unwrap_or(0.0);
                        frame.fill(T::from_sample(sample));
                    }
                    if cursor.is_finished() {
                        active.store(false, Ordering::Release);
                    }
                },
                |err| tracing::warn!(%err, "audio output stream error"),
                None,
            )
            .map_err(DropError::device)
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl std::fmt::Debug for CpalOutput {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("CpalOutput")
                .field("streaming", &self.stream.is_some())
                .field("active", &self.active.load(Ordering::Relaxed))
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;

    #[test]
    fn silent_output_runs_for_the_buffer_duration() {
        let clock = ManualClock::new();
        let mut output = SilentOutput::new(clock.clone());
        assert!(!output.is_active());

        output.play(Arc::from(vec![0.0_f32; 100]), 100).unwrap();
        assert!(output.is_active());

        clock.advance(Duration::from_millis(999));
        assert!(output.is_active());
        clock.advance(Duration::from_millis(1));
        assert!(!output.is_active());
    }

    #[test]
    fn stop_deactivates_immediately() {
        let clock = ManualClock::new();
        let mut output = SilentOutput::new(clock);
        output.play(Arc::from(vec![0.0_f32; 1_000]), 10).unwrap();
        output.stop();
        assert!(!output.is_active());
    }

    #[test]
    fn cursor_passes_samples_through_at_the_native_rate() {
        let mut cursor = SampleCursor::new(Arc::from(vec![0.1_f32, 0.2, 0.3]), 44_100, 44_100);
        let read: Vec<f32> = std::iter::from_fn(|| cursor.next_sample()).collect();
        assert_eq!(read, vec![0.1, 0.2, 0.3]);
        assert!(cursor.is_finished());
    }

    #[test]
    fn cursor_resamples_to_a_faster_device() {
        // 44.1 kHz track on a 48 kHz device keeps its duration.
        let samples: Vec<f32> = (0..44_100).map(|i| i as f32 / 44_100.0).collect();
        let mut cursor = SampleCursor::new(Arc::from(samples), 44_100, 48_000);
        let mut produced = 0usize;
        let mut previous = -1.0_f32;
        while let Some(sample) = cursor.next_sample() {
            assert!(sample >= previous);
            previous = sample;
            produced += 1;
        }
        assert!((47_999..=48_001).contains(&produced), "produced {produced}");
    }

    #[test]
    fn cursor_interpolates_between_samples() {
        let mut cursor = SampleCursor::new(Arc::from(vec![0.0_f32, 1.0]), 1, 2);
        approx::assert_abs_diff_eq!(cursor.step(), 0.5);
        let read: Vec<f32> = std::iter::from_fn(|| cursor.next_sample()).collect();
        assert_eq!(read.len(), 4);
        approx::assert_abs_diff_eq!(read[1], 0.5, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(read[3], 1.0, epsilon = 1e-6);
    }
}
