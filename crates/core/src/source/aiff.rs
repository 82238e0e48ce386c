use std::io::{Cursor, Read};

use super::{Endianness, PcmFormat, ProbedLayout};
use crate::{AudioError, Result};

const COMM_MIN_SIZE: u32 = 18;
const MAX_CHANNELS: u16 = 4;
const MIN_SAMPLE_RATE: f64 = 300.0;
const MAX_SAMPLE_RATE: f64 = 96_000.0;

/// Locates the sound data of a FORM/AIFF or FORM/AIFC payload.
///
/// AIFF samples are big-endian. AIFC adds a compression tag after the common
/// fields: `NONE` and `twos` keep big-endian PCM, `sowt` is byte-swapped
/// (little-endian) PCM, anything else is a real codec and is refused.
pub(super) fn probe(bytes: &[u8]) -> Result<ProbedLayout> {
    let mut cursor = Cursor::new(bytes);

    let _form = read_tag(&mut cursor)?;
    let form_size = read_u32(&mut cursor)? as usize;
    let is_aifc = match &read_tag(&mut cursor)? {
        b"AIFF" => false,
        b"AIFC" => true,
        other => {
            return Err(AudioError::UnsupportedFormat(format!(
                "FORM type `{}` is not AIFF",
                String::from_utf8_lossy(other)
            )))
        }
    };

    let form_end = (8 + form_size).min(bytes.len());
    let mut common: Option<Common> = None;
    let mut sound: Option<std::ops::Range<usize>> = None;

    while (cursor.position() as usize) + 8 <= form_end {
        let id = read_tag(&mut cursor)?;
        let size = read_u32(&mut cursor)?;
        let body_start = cursor.position() as usize;
        let body_end = body_start
            .checked_add(size as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                AudioError::Decode(format!(
                    "`{}` chunk runs past the end of the file",
                    String::from_utf8_lossy(&id)
                ))
            })?;

        match &id {
            b"COMM" => common = Some(read_common(&mut cursor, size, is_aifc)?),
            b"SSND" => {
                let offset = read_u32(&mut cursor)? as usize;
                let _block_size = read_u32(&mut cursor)?;
                let start = (cursor.position() as usize + offset).min(body_end);
                sound = Some(start..body_end);
            }
            _ => {}
        }

        // Chunks are padded to an even length.
        let next = body_end + (size as usize & 1);
        cursor.set_position(next as u64);
    }

    let common =
        common.ok_or_else(|| AudioError::Decode("AIFF file has no COMM chunk".to_string()))?;
    let sound =
        sound.ok_or_else(|| AudioError::Decode("AIFF file has no SSND chunk".to_string()))?;

    validate_common(&common)?;

    // Sample sizes that are not whole bytes are stored left-justified.
    let bits_per_sample = common
        .sample_size
        .div_ceil(8)
        .checked_mul(8)
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!("{}-bit samples", common.sample_size))
        })?;

    let format = PcmFormat {
        channels: common.channels,
        sample_rate: common.sample_rate.round() as u32,
        bits_per_sample,
        endianness: common.endianness,
    };

    let declared = common.frames as usize * format.frame_size();
    let end = sound.start + declared.min(sound.len());

    Ok(ProbedLayout {
        format,
        data: sound.start..end,
    })
}

struct Common {
    channels: u16,
    frames: u32,
    sample_size: u16,
    sample_rate: f64,
    endianness: Endianness,
}

fn validate_common(common: &Common) -> Result<()> {
    if common.channels == 0 || common.channels > MAX_CHANNELS {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} channels, expected 1 to {MAX_CHANNELS}",
            common.channels
        )));
    }
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&common.sample_rate) {
        return Err(AudioError::UnsupportedFormat(format!(
            "sample rate {} outside {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE} Hz",
            common.sample_rate
        )));
    }
    Ok(())
}

fn read_common(cursor: &mut Cursor<&[u8]>, size: u32, is_aifc: bool) -> Result<Common> {
    if size < COMM_MIN_SIZE {
        return Err(AudioError::Decode("COMM chunk is too small".to_string()));
    }

    let channels = read_u16(cursor)?;
    let frames = read_u32(cursor)?;
    let sample_size = read_u16(cursor)?;
    let sample_rate = read_extended(cursor)?;

    let endianness = if is_aifc && size >= COMM_MIN_SIZE + 4 {
        match &read_tag(cursor)? {
            b"NONE" | b"twos" => Endianness::Big,
            b"sowt" => Endianness::Little,
            other => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "AIFC compression `{}`",
                    String::from_utf8_lossy(other)
                )))
            }
        }
    } else {
        Endianness::Big
    };

    Ok(Common {
        channels,
        frames,
        sample_size,
        sample_rate,
        endianness,
    })
}

fn read_tag(cursor: &mut Cursor<&[u8]>) -> Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    cursor.read_exact(&mut tag).map_err(truncated)?;
    Ok(tag)
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_be_bytes(buf))
}

/// 80-bit IEEE 754 extended float: sign, 15-bit biased exponent, 64-bit
/// significand with an explicit integer bit.
fn read_extended(cursor: &mut Cursor<&[u8]>) -> Result<f64> {
    let sign_exponent = read_u16(cursor)?;
    let hi = read_u32(cursor)?;
    let lo = read_u32(cursor)?;

    let exponent = i32::from(sign_exponent & 0x7FFF);
    let significand = (u64::from(hi) << 32) | u64::from(lo);

    if exponent == 0 && significand == 0 {
        return Ok(0.0);
    }
    if exponent == 0x7FFF {
        return Ok(f64::NAN);
    }

    let magnitude = significand as f64 * 2f64.powi(exponent - 16383 - 63);
    Ok(if sign_exponent & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    })
}

fn truncated(_: std::io::Error) -> AudioError {
    AudioError::Decode("AIFF header is truncated".to_string())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::aiff_bytes;
    use super::*;

    #[test]
    fn decodes_extended_sample_rates() {
        for rate in [8_000_u32, 22_050, 44_100, 48_000, 96_000] {
            let bytes = aiff_bytes(2, rate, 16, &[0; 4]);
            let layout = probe(&bytes).unwrap();
            assert_eq!(layout.format.sample_rate, rate);
        }
    }

    #[test]
    fn sowt_compression_is_little_endian() {
        let mut bytes = aiff_bytes(1, 8_000, 16, &[0x0102]);
        // Rewrite as AIFC with a 4-byte compression tag appended to COMM.
        let comm_at = bytes.windows(4).position(|w| w == b"COMM").unwrap();
        bytes[8..12].copy_from_slice(b"AIFC");
        bytes[comm_at + 4..comm_at + 8].copy_from_slice(&22u32.to_be_bytes());
        bytes.splice(comm_at + 26..comm_at + 26, *b"sowt");
        let form_size = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&form_size.to_be_bytes());

        let layout = probe(&bytes).unwrap();
        assert_eq!(layout.format.endianness, Endianness::Little);
        assert_eq!(layout.data.len(), 2);
    }

    #[test]
    fn missing_sound_chunk_is_a_decode_error() {
        let bytes = aiff_bytes(1, 8_000, 16, &[1, 2]);
        let ssnd_at = bytes.windows(4).position(|w| w == b"SSND").unwrap();
        let mut cut = bytes[..ssnd_at].to_vec();
        let form_size = (cut.len() - 8) as u32;
        cut[4..8].copy_from_slice(&form_size.to_be_bytes());

        let err = probe(&cut).unwrap_err();
        assert!(matches!(err, AudioError::Decode(_)));
    }

    #[test]
    fn oversized_sample_size_is_unsupported() {
        for bits in [65_530, 65_535] {
            let result = probe(&aiff_bytes(1, 8_000, bits, &[0; 4]));
            assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
        }
    }

    #[test]
    fn rejects_out_of_range_sample_rates() {
        for rate in [0, 100, 192_000] {
            let result = probe(&aiff_bytes(1, rate, 16, &[0; 4]));
            assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
        }
        assert!(probe(&aiff_bytes(1, 300, 16, &[0; 4])).is_ok());
    }

    #[test]
    fn rejects_unsupported_channel_counts() {
        let result = probe(&aiff_bytes(6, 8_000, 16, &[0; 12]));
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));

        let mut silent = aiff_bytes(1, 8_000, 16, &[0; 4]);
        let comm_at = silent.windows(4).position(|w| w == b"COMM").unwrap();
        silent[comm_at + 8..comm_at + 10].copy_from_slice(&0u16.to_be_bytes());
        let result = probe(&silent);
        assert!(matches!(result, Err(AudioError::UnsupportedFormat(_))));
    }
}
