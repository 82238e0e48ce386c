mod aiff;
mod wav;

use std::{
    fmt,
    io::{Cursor, Read},
    ops::Range,
    path::Path,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{AudioError, Result};

/// The only sample width the engine decodes.
pub const SUPPORTED_BITS_PER_SAMPLE: u16 = 16;

/// Byte order of the samples inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Describes how the PCM bytes of a source are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub endianness: Endianness,
}

impl PcmFormat {
    /// Bytes occupied by one sample of one channel.
    pub fn sample_width(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    /// Bytes occupied by one interleaved frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.sample_width() * usize::from(self.channels)
    }

    /// Playback time covered by `bytes` of PCM data.
    pub fn duration_of(&self, bytes: u64) -> Duration {
        let frame_size = self.frame_size() as u64;
        if frame_size == 0 || self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((bytes / frame_size) as f64 / f64::from(self.sample_rate))
    }

    fn validate(self) -> Result<Self> {
        if self.bits_per_sample != SUPPORTED_BITS_PER_SAMPLE {
            return Err(AudioError::UnsupportedFormat(format!(
                "{}-bit samples, only {SUPPORTED_BITS_PER_SAMPLE}-bit PCM is supported",
                self.bits_per_sample
            )));
        }
        if self.channels == 0 {
            return Err(AudioError::Decode("source declares zero channels".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::Decode("source declares a zero sample rate".to_string()));
        }
        Ok(self)
    }
}

/// Container-level result of probing a payload.
#[derive(Debug)]
pub(crate) struct ProbedLayout {
    pub format: PcmFormat,
    pub data: Range<usize>,
}

/// An immutable, validated sound asset.
///
/// Keeps the encoded payload exactly as supplied, so it can be handed back
/// for persistence, together with the location of the PCM data inside it.
/// Only 16-bit integer PCM is accepted.
#[derive(Clone)]
pub struct AudioSource {
    name: String,
    bytes: Arc<[u8]>,
    format: PcmFormat,
    data: Range<usize>,
}

impl AudioSource {
    /// Validates `bytes` and wraps them as a source called `name`.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, name: impl Into<String>) -> Result<Self> {
        let bytes = bytes.into();
        let name = name.into();

        if bytes.is_empty() {
            return Err(AudioError::NotFound(format!("`{name}` has no audio bytes")));
        }

        let layout = probe(&bytes)?;
        let format = layout.format.validate()?;
        let frame_size = format.frame_size();
        // Drop a dangling partial frame so every offset we hand out is aligned.
        let aligned_len = layout.data.len() - layout.data.len() % frame_size;
        let data = layout.data.start..layout.data.start + aligned_len;

        tracing::debug!(
            name = %name,
            channels = format.channels,
            sample_rate = format.sample_rate,
            endianness = ?format.endianness,
            data_bytes = data.len(),
            "validated audio source"
        );

        Ok(Self {
            name,
            bytes,
            format,
            data,
        })
    }

    /// Reads a sound file from disk. The file name becomes the display name.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AudioError::NotFound(format!(
                "the file `{}` can't be found",
                path.display()
            )));
        }

        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_bytes(bytes, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The payload exactly as supplied, header included.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Number of PCM data bytes; the denominator of playback progression.
    pub fn data_len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.data_len())
    }

    /// Opens a fresh forward-only reader positioned at the first PCM byte.
    pub(crate) fn open_pcm(&self) -> PcmStream {
        let mut cursor = Cursor::new(Arc::clone(&self.bytes));
        cursor.set_position(self.data.start as u64);
        cursor.take(self.data_len())
    }
}

/// Forward-only reader over the PCM section of a source.
pub(crate) type PcmStream = std::io::Take<Cursor<Arc<[u8]>>>;

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("bytes", &self.bytes.len())
            .field("data", &self.data)
            .finish()
    }
}

fn probe(bytes: &[u8]) -> Result<ProbedLayout> {
    match bytes.get(0..4) {
        Some(b"RIFF") => wav::probe(bytes),
        Some(b"FORM") => aiff::probe(bytes),
        _ => Err(AudioError::UnsupportedFormat(
            "unrecognised container, expected WAV or AIFF".to_string(),
        )),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! In-memory sound files for tests.

    use std::io::Cursor;

    /// Little-endian 16-bit WAV with interleaved `samples`.
    pub fn wav_bytes(channels: u16, sample_rate: u32, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in samples {
                writer.write_sample(*sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// 8-bit WAV, which the engine must refuse.
    pub fn wav_8bit_bytes(sample_rate: u32, samples: &[i8]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in samples {
                writer.write_sample(*sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// Big-endian AIFF with interleaved `samples`, declaring `bits` per sample.
    pub fn aiff_bytes(channels: u16, sample_rate: u32, bits: u16, samples: &[i16]) -> Vec<u8> {
        let frames = samples.len() as u32 / u32::from(channels);
        let sound: Vec<u8> = samples.iter().flat_map(|s| s.to_be_bytes()).collect();

        let mut comm = Vec::new();
        comm.extend_from_slice(&channels.to_be_bytes());
        comm.extend_from_slice(&frames.to_be_bytes());
        comm.extend_from_slice(&bits.to_be_bytes());
        comm.extend_from_slice(&extended(sample_rate));

        let mut body = Vec::new();
        body.extend_from_slice(b"AIFF");
        body.extend_from_slice(b"COMM");
        body.extend_from_slice(&(comm.len() as u32).to_be_bytes());
        body.extend_from_slice(&comm);
        body.extend_from_slice(b"SSND");
        body.extend_from_slice(&(sound.len() as u32 + 8).to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&sound);

        let mut file = Vec::new();
        file.extend_from_slice(b"FORM");
        file.extend_from_slice(&(body.len() as u32).to_be_bytes());
        file.extend_from_slice(&body);
        file
    }

    fn extended(value: u32) -> [u8; 10] {
        let mut out = [0u8; 10];
        if value == 0 {
            return out;
        }
        let shift = value.leading_zeros();
        let exponent = 16383 + 31 - shift as u16;
        let mantissa = u64::from(value) << (32 + shift);
        out[0..2].copy_from_slice(&exponent.to_be_bytes());
        out[2..10].copy_from_slice(&mantissa.to_be_bytes());
        out
    }
}
