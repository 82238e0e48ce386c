use std::io::Cursor;

use super::{Endianness, PcmFormat, ProbedLayout};
use crate::{AudioError, Result};

/// Locates the `data` chunk of a RIFF/WAVE payload.
///
/// `hound` parses the header and leaves its reader at the first sample, so
/// the cursor position after `into_inner` is the start of the PCM bytes.
pub(super) fn probe(bytes: &[u8]) -> Result<ProbedLayout> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int {
        return Err(AudioError::UnsupportedFormat(format!(
            "{}-bit floating point samples, only 16-bit integer PCM is supported",
            spec.bits_per_sample
        )));
    }

    let sample_width = usize::from(spec.bits_per_sample).div_ceil(8);
    let declared_len = reader.len() as usize * sample_width;
    let start = reader.into_inner().position() as usize;
    // A writer that died mid-file can leave a header promising more than is there.
    let end = (start + declared_len).min(bytes.len());
    if end < start + declared_len {
        tracing::warn!(
            declared = declared_len,
            present = end.saturating_sub(start),
            "wav data chunk is shorter than its header claims"
        );
    }

    Ok(ProbedLayout {
        format: PcmFormat {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
            endianness: Endianness::Little,
        },
        data: start..end,
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::wav_bytes;
    use super::*;

    #[test]
    fn data_range_covers_exactly_the_samples() {
        let bytes = wav_bytes(1, 22_050, &[0x0102, 0x0304, 0x0506]);
        let layout = probe(&bytes).unwrap();

        assert_eq!(layout.data.len(), 6);
        assert_eq!(&bytes[layout.data.clone()], &[0x02, 0x01, 0x04, 0x03, 0x06, 0x05]);
        assert_eq!(layout.format.sample_rate, 22_050);
    }

    #[test]
    fn float_wav_is_unsupported() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.25_f32).unwrap();
            writer.finalize().unwrap();
        }

        let err = probe(cursor.get_ref()).unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
    }
}
