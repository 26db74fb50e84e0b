//! Planar audio buffers plus the codec plumbing around them.
//!
//! WAV goes through `hound`; every other container is probed with
//! `symphonia`. Output stems are always written as 32-bit float WAV.

use std::{fs::File, path::Path};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};

use crate::error::JobError;

/// Channel-major sample storage: `channels[c][i]` is frame `i` of channel `c`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn zeros_like(other: &AudioBuffer) -> Self {
        Self {
            sample_rate: other.sample_rate,
            channels: other.channels.iter().map(|c| vec![0.0; c.len()]).collect(),
        }
    }

    pub fn same_shape(&self, other: &AudioBuffer) -> bool {
        self.channels.len() == other.channels.len()
            && self
                .channels
                .iter()
                .zip(&other.channels)
                .all(|(a, b)| a.len() == b.len())
    }

    /// Element-wise `self += other`. Shapes must match.
    pub fn accumulate(&mut self, other: &AudioBuffer) -> Result<(), JobError> {
        if !self.same_shape(other) {
            return Err(JobError::Reconcile(format!(
                "stem shape mismatch: {}x{} vs {}x{}",
                self.num_channels(),
                self.num_frames(),
                other.num_channels(),
                other.num_frames()
            )));
        }
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
        Ok(())
    }

    /// Coerces to exactly two channels: mono is duplicated, anything wider
    /// keeps its first two channels.
    pub fn into_stereo(mut self) -> Result<Self, JobError> {
        match self.channels.len() {
            0 => Err(JobError::Decode("audio has no channels".into())),
            1 => {
                let mono = self.channels[0].clone();
                self.channels.push(mono);
                Ok(self)
            }
            _ => {
                self.channels.truncate(2);
                Ok(self)
            }
        }
    }

    /// Keeps the `[start, end)` window given in seconds. Either bound may be
    /// omitted. Bounds past the end are clamped to the buffer length; a
    /// negative bound or an empty window is an error.
    pub fn slice_seconds(self, start: Option<f64>, end: Option<f64>) -> Result<Self, JobError> {
        if start.is_none() && end.is_none() {
            return Ok(self);
        }
        let frames = self.num_frames();
        let to_frame = |secs: f64, label: &str| -> Result<usize, JobError> {
            if !secs.is_finite() || secs < 0.0 {
                return Err(JobError::InvalidWindow(format!(
                    "{label} must be a non-negative number of seconds, got {secs}"
                )));
            }
            Ok(((secs * self.sample_rate as f64) as usize).min(frames))
        };
        let start_frame = start.map(|s| to_frame(s, "start_time")).transpose()?.unwrap_or(0);
        let end_frame = end.map(|e| to_frame(e, "end_time")).transpose()?.unwrap_or(frames);
        if start_frame >= end_frame {
            return Err(JobError::InvalidWindow(format!(
                "window [{start_frame}, {end_frame}) is empty for {frames} frames"
            )));
        }

        let channels = self
            .channels
            .into_iter()
            .map(|c| c[start_frame..end_frame].to_vec())
            .collect();
        Ok(Self {
            sample_rate: self.sample_rate,
            channels,
        })
    }

    fn from_interleaved(sample_rate: u32, num_channels: usize, samples: &[f32]) -> Self {
        let frames = samples.len() / num_channels.max(1);
        let mut channels = vec![Vec::with_capacity(frames); num_channels];
        for (i, sample) in samples.iter().enumerate() {
            channels[i % num_channels].push(*sample);
        }
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Decodes an audio file into a planar `f32` buffer.
pub fn decode_file(path: &Path) -> Result<AudioBuffer, JobError> {
    let is_wav = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));
    if is_wav {
        decode_wav(path)
    } else {
        decode_with_symphonia(path)
    }
}

fn decode_wav(path: &Path) -> Result<AudioBuffer, JobError> {
    let reader = WavReader::open(path).map_err(|e| JobError::Decode(e.to_string()))?;
    let spec = reader.spec();
    let num_channels = spec.channels as usize;
    if num_channels == 0 {
        return Err(JobError::Decode("wav header declares zero channels".into()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| JobError::Decode(e.to_string()))?,
        SampleFormat::Int => {
            let shift = spec.bits_per_sample.checked_sub(1).filter(|&s| s < 32).ok_or_else(|| {
                JobError::Decode(format!(
                    "unsupported integer sample width: {} bits",
                    spec.bits_per_sample
                ))
            })?;
            let scale = 1.0 / (1i64 << shift) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| JobError::Decode(e.to_string()))?
        }
    };

    Ok(AudioBuffer::from_interleaved(
        spec.sample_rate,
        num_channels,
        &samples,
    ))
}

fn decode_with_symphonia(path: &Path) -> Result<AudioBuffer, JobError> {
    let file = File::open(path).map_err(|e| JobError::Decode(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| JobError::Decode(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| JobError::Decode("no audio track".into()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| JobError::Decode("unknown sample rate".into()))?;
    let num_channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| JobError::Decode("unknown channel layout".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| JobError::Decode(e.to_string()))?;

    let mut interleaved = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(JobError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt frames are skipped, matching symphonia's own players.
            Err(SymphoniaError::DecodeError(err)) => {
                tracing::debug!(%err, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(JobError::Decode(e.to_string())),
        };
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buffer.samples());
    }

    if interleaved.is_empty() {
        return Err(JobError::Decode("no audio frames decoded".into()));
    }
    Ok(AudioBuffer::from_interleaved(
        sample_rate,
        num_channels,
        &interleaved,
    ))
}

/// Writes `buffer` as an interleaved 32-bit float WAV file.
pub fn write_wav(path: &Path, buffer: &AudioBuffer) -> Result<(), JobError> {
    let frames = buffer.num_frames();
    if buffer.channels.iter().any(|c| c.len() != frames) {
        let lengths: Vec<usize> = buffer.channels.iter().map(Vec::len).collect();
        return Err(JobError::Encode(format!(
            "channels have different lengths: {lengths:?}"
        )));
    }
    let spec = WavSpec {
        channels: buffer.num_channels() as u16,
        sample_rate: buffer.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec).map_err(|e| JobError::Encode(e.to_string()))?;
    for frame in 0..frames {
        for channel in &buffer.channels {
            writer
                .write_sample(channel[frame])
                .map_err(|e| JobError::Encode(e.to_string()))?;
        }
    }
    writer
        .finalize()
        .map_err(|e| JobError::Encode(e.to_string()))
}
