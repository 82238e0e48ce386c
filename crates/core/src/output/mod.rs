#[cfg(feature = "cpal")]
pub mod cpal;
pub mod memory;

use std::io;

use crate::{source::PcmFormat, transport::GainRange, Result};

/// A sink for interleaved PCM frames with a master-gain control.
pub trait OutputDevice {
    /// Human readable device name, for logs.
    fn name(&self) -> &str;

    fn gain_range(&self) -> GainRange;

    /// Applies `gain` (device gain units) to subsequent audio.
    fn set_gain(&mut self, gain: f32);

    /// Queues raw PCM bytes in the format the device was opened with.
    /// Blocks until the device has room; this paces the processing loop.
    fn write(&mut self, pcm: &[u8]) -> io::Result<()>;

    /// Waits for queued audio to finish playing.
    fn drain(&mut self);

    /// Releases the device. Further writes fail.
    fn close(&mut self);
}

/// Opens output devices for a given source format.
///
/// The engine calls `open` from its processing thread, so an
/// [`OutputDevice`] never has to cross threads. Some audio backends hand out
/// streams that are not `Send`.
pub trait DeviceProvider: Send + Sync {
    /// Any error is reported to the engine's caller as
    /// [`AudioError::DeviceUnavailable`](crate::AudioError::DeviceUnavailable).
    fn open(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>>;
}

/// Linear amplitude factor for a gain in dB. The bottom of `range` is
/// treated as silence.
pub fn gain_to_amplitude(gain: f32, range: GainRange) -> f32 {
    if gain <= range.min {
        0.0
    } else {
        10f32.powf(gain.min(range.max) / 20.0)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "output device is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_floor_is_silent() {
        let range = GainRange::MASTER;
        assert_eq!(gain_to_amplitude(range.min, range), 0.0);
        assert_eq!(gain_to_amplitude(0.0, range), 1.0);
        assert!((gain_to_amplitude(6.0, range) - 1.995).abs() < 1e-3);
        assert!((gain_to_amplitude(-20.0, range) - 0.1).abs() < 1e-6);
    }
}
