use std::{
    io::{self, Read},
    sync::Arc,
};

use crate::{source::PcmStream, AudioSource};

/// Sequential reader over the PCM data of an [`AudioSource`].
///
/// The underlying stream only moves forward, so every discontinuous jump
/// (seek or loop restart) reopens it from the start of the data and
/// discards bytes up to the target.
pub struct StreamCursor {
    source: Arc<AudioSource>,
    stream: Option<PcmStream>,
    bytes_consumed: u64,
}

impl StreamCursor {
    /// Opens a cursor at the first PCM byte.
    pub fn open(source: Arc<AudioSource>) -> Self {
        let stream = Some(source.open_pcm());
        Self {
            source,
            stream,
            bytes_consumed: 0,
        }
    }

    /// PCM bytes read or skipped since the start of the data.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Length of the PCM data, header excluded.
    pub fn total_bytes(&self) -> u64 {
        self.source.data_len()
    }

    /// Fraction of the PCM data consumed so far.
    pub fn progression(&self) -> f64 {
        progression_of(self.bytes_consumed, self.total_bytes())
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Fills `buf` until it is full or the stream ends, and returns how many
    /// bytes were read. Zero means end of stream (or a closed cursor).
    ///
    /// Bytes that were read before an error are still counted.
    pub fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };

        let mut filled = 0;
        let result = loop {
            if filled == buf.len() {
                break Ok(filled);
            }
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break Ok(filled),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };

        self.bytes_consumed += filled as u64;
        result
    }

    /// Reopens the stream and skips to `offset`, clamped to the data length
    /// and aligned down to a frame boundary. Returns the offset reached.
    pub fn reset_to_byte_offset(&mut self, offset: u64) -> io::Result<u64> {
        let frame_size = self.source.format().frame_size() as u64;
        let target = offset.min(self.total_bytes());
        let target = target - target % frame_size.max(1);

        let mut stream = self.source.open_pcm();
        let skipped = io::copy(&mut (&mut stream).take(target), &mut io::sink())?;

        self.stream = Some(stream);
        self.bytes_consumed = skipped;
        Ok(skipped)
    }

    /// Seeks to `round(progression * total_bytes)`; `progression` is clamped
    /// to `[0, 1]` and NaN counts as 0.
    ///
    /// The rounded offset is then aligned down to a frame boundary like any
    /// other reset, so a target that falls inside a frame lands on that
    /// frame's first byte: half of a 2002-byte mono source is byte 1000, not
    /// 1001.
    pub fn seek_to_progression(&mut self, progression: f64) -> io::Result<u64> {
        let offset = byte_offset_for(progression, self.total_bytes());
        self.reset_to_byte_offset(offset)
    }

    /// Drops the decode stream. Further reads report end of stream.
    pub fn close(&mut self) {
        self.stream = None;
    }
}

impl std::fmt::Debug for StreamCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCursor")
            .field("source", &self.source.name())
            .field("bytes_consumed", &self.bytes_consumed)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Byte offset that corresponds to `progression` of `total` bytes.
pub fn byte_offset_for(progression: f64, total: u64) -> u64 {
    let progression = if progression.is_nan() {
        0.0
    } else {
        progression.clamp(0.0, 1.0)
    };
    (progression * total as f64).round() as u64
}

pub(crate) fn progression_of(consumed: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (consumed as f64 / total as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fixtures::wav_bytes;

    fn ramp_source(samples: usize) -> Arc<AudioSource> {
        let ramp: Vec<i16> = (0..samples as i16).collect();
        Arc::new(AudioSource::from_bytes(wav_bytes(1, 8_000, &ramp), "ramp.wav").unwrap())
    }

    fn decode(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn reads_sequential_frames_and_counts_bytes() {
        let mut cursor = StreamCursor::open(ramp_source(10));
        let mut buf = [0u8; 8];

        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 8);
        assert_eq!(decode(&buf), vec![0, 1, 2, 3]);
        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 8);
        assert_eq!(decode(&buf), vec![4, 5, 6, 7]);

        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 4);
        assert_eq!(decode(&buf[..4]), vec![8, 9]);
        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 0);

        assert_eq!(cursor.bytes_consumed(), 20);
        assert_eq!(cursor.progression(), 1.0);
    }

    #[test]
    fn seeking_half_way_resumes_from_that_offset() {
        let mut cursor = StreamCursor::open(ramp_source(100));
        let total = cursor.total_bytes();

        let reached = cursor.seek_to_progression(0.5).unwrap();
        assert_eq!(reached, (0.5 * total as f64).round() as u64);
        assert_eq!(cursor.bytes_consumed(), 100);

        let mut buf = [0u8; 4];
        cursor.read_frame(&mut buf).unwrap();
        assert_eq!(decode(&buf), vec![50, 51]);
    }

    #[test]
    fn seek_targets_inside_a_frame_align_down() {
        let mut cursor = StreamCursor::open(ramp_source(1_001));
        assert_eq!(cursor.total_bytes(), 2_002);
        assert_eq!(byte_offset_for(0.5, 2_002), 1_001);

        assert_eq!(cursor.seek_to_progression(0.5).unwrap(), 1_000);
        assert_eq!(cursor.bytes_consumed(), 1_000);

        let mut buf = [0u8; 2];
        cursor.read_frame(&mut buf).unwrap();
        assert_eq!(decode(&buf), vec![500]);
    }

    #[test]
    fn offsets_are_clamped_and_frame_aligned() {
        let mut cursor = StreamCursor::open(ramp_source(10));

        assert_eq!(cursor.reset_to_byte_offset(7).unwrap(), 6);
        let mut buf = [0u8; 2];
        cursor.read_frame(&mut buf).unwrap();
        assert_eq!(decode(&buf), vec![3]);

        assert_eq!(cursor.reset_to_byte_offset(1_000).unwrap(), 20);
        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 0);

        assert_eq!(cursor.seek_to_progression(f64::NAN).unwrap(), 0);
        assert_eq!(cursor.seek_to_progression(-3.0).unwrap(), 0);
    }

    #[test]
    fn closed_cursor_reports_end_of_stream() {
        let mut cursor = StreamCursor::open(ramp_source(4));
        cursor.close();

        let mut buf = [0u8; 4];
        assert!(cursor.is_closed());
        assert_eq!(cursor.read_frame(&mut buf).unwrap(), 0);
        assert_eq!(cursor.bytes_consumed(), 0);
    }

    #[test]
    fn byte_offsets_round_to_nearest() {
        assert_eq!(byte_offset_for(0.5, 101), 51);
        assert_eq!(byte_offset_for(1.5, 100), 100);
        assert_eq!(byte_offset_for(0.0, 100), 0);
    }
}
