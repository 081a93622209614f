use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{DropError, Result};

/// File extensions offered by [`scan_folder`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav"];

/// Immutable mono sample buffer plus its sample rate.
///
/// Samples live behind an [`Arc`], so cloning a buffer shares the decoded
/// track. Playback copies only the part after the start offset, see
/// [`AudioBuffer::tail`].
#[derive(Clone)]
pub struct AudioBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Track length in seconds. Zero when the sample rate is unusable.
    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.samples.len() as f64 / self.sample_rate as f64) as f32
    }

    /// Index of the first sample at or after `seconds`, clamped to the end.
    pub fn sample_offset(&self, seconds: f32) -> usize {
        let offset = (seconds.max(0.0) as f64 * self.sample_rate as f64).floor() as usize;
        offset.min(self.samples.len())
    }

    /// Copies the samples from `offset` to the end of the track into a new
    /// shared slice for the output device.
    pub fn tail(&self, offset: usize) -> Arc<[f32]> {
        let start = offset.min(self.samples.len());
        Arc::from(&self.samples[start..])
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Source of decoded audio. The session only depends on this seam, so tests
/// and embedding applications can supply buffers from anywhere.
pub trait AudioLoader {
    fn load(&self, path: &Path) -> Result<AudioBuffer>;
}

/// Decodes files with symphonia and averages all channels down to mono.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaLoader;

impl AudioLoader for SymphoniaLoader {
    fn load(&self, path: &Path) -> Result<AudioBuffer> {
        let src = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(src), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(map_symphonia_error)?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DropError::UnsupportedFormat("no decodable audio track".into()))?;
        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;

        let mut samples: Vec<f32> = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(err) => return Err(map_symphonia_error(err)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    let channels = spec.channels.count().max(1);
                    let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    sample_buf.copy_interleaved_ref(decoded);

                    if channels == 1 {
                        samples.extend_from_slice(sample_buf.samples());
                    } else {
                        samples.extend(
                            sample_buf
                                .samples()
                                .chunks(channels)
                                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                        );
                    }
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    tracing::debug!(msg, "skipping undecodable packet");
                }
                Err(err) => return Err(map_symphonia_error(err)),
            }
        }

        if sample_rate == 0 {
            return Err(DropError::UnsupportedFormat(
                "stream does not declare a sample rate".into(),
            ));
        }

        tracing::info!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate,
            "decoded audio"
        );
        Ok(AudioBuffer::new(samples, sample_rate))
    }
}

fn map_symphonia_error(err: SymphoniaError) -> DropError {
    match err {
        SymphoniaError::IoError(io) => DropError::IoRead(io),
        other => DropError::UnsupportedFormat(other.to_string()),
    }
}

/// Lists the supported audio files directly inside `folder`, sorted by name.
pub fn scan_folder(folder: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut tracks = Vec::new();
    for entry in fs::read_dir(folder.as_ref())? {
        let path = entry?.path();
        if path.is_file() && is_supported(&path) {
            tracks.push(path);
        }
    }
    tracks.sort();
    Ok(tracks)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}
