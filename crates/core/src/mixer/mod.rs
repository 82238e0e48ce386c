use crate::source::{Endianness, PcmFormat};

/// Full-scale value of a signed 16-bit sample.
const I16_SCALE: f32 = 32_768.0;

/// Decodes the whole frames contained in `raw` into `out`, averaging the
/// channels of each frame and normalising to roughly `[-1, 1]`.
///
/// At most `out.len()` frames are decoded. Any trailing partial frame in
/// `raw` is ignored and every slot of `out` past the decoded frames is
/// zeroed. Returns the number of frames decoded.
pub fn mix_frames(raw: &[u8], format: &PcmFormat, out: &mut [f32]) -> usize {
    let frame_size = format.frame_size();
    if frame_size == 0 {
        out.fill(0.0);
        return 0;
    }

    let channels = f32::from(format.channels);
    let mut decoded = 0;

    for (slot, frame) in out.iter_mut().zip(raw.chunks_exact(frame_size)) {
        let sum: f32 = frame
            .chunks_exact(2)
            .map(|bytes| f32::from(decode_sample([bytes[0], bytes[1]], format.endianness)))
            .sum();
        *slot = sum / channels / I16_SCALE;
        decoded += 1;
    }

    out[decoded..].fill(0.0);
    decoded
}

/// Decodes one signed 16-bit sample.
#[inline]
pub fn decode_sample(bytes: [u8; 2], endianness: Endianness) -> i16 {
    match endianness {
        Endianness::Big => i16::from_be_bytes(bytes),
        Endianness::Little => i16::from_le_bytes(bytes),
    }
}

/// Mean absolute value of `samples`; 0.0 for an empty slice.
pub fn mean_amplitude(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|sample| sample.abs()).sum::<f32>() / samples.len() as f32
}
