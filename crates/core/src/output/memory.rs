use std::{io, sync::Arc, thread, time::Duration};

use parking_lot::Mutex;

use super::{closed_error, gain_to_amplitude, DeviceProvider, OutputDevice};
use crate::{source::PcmFormat, transport::GainRange, AudioError, Result};

/// How long a write blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Return immediately.
    #[default]
    None,
    /// Block for as long as the written audio would take to play.
    RealTime,
    /// Block for a fixed time per write.
    Fixed(Duration),
}

/// Provider of [`MemoryDevice`]s sharing one [`MemoryProbe`].
///
/// The devices play nothing but pace writes like a real device would. The
/// CLI uses them in headless mode; tests read back the bytes and gains.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    pacing: Pacing,
    gain_range: GainRange,
    refusal: Option<String>,
    probe: MemoryProbe,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that consumes audio at playback speed.
    pub fn real_time() -> Self {
        Self::new().with_pacing(Pacing::RealTime)
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_gain_range(mut self, range: GainRange) -> Self {
        self.gain_range = range;
        self
    }

    /// Keep a copy of every byte written.
    pub fn capturing(self) -> Self {
        self.probe.state.lock().capture = true;
        self
    }

    /// Make every `open` fail with `reason`.
    pub fn refusing(mut self, reason: impl Into<String>) -> Self {
        self.refusal = Some(reason.into());
        self
    }

    /// Make the next `count` writes fail.
    pub fn failing_writes(self, count: usize) -> Self {
        self.probe.state.lock().pending_failures = count;
        self
    }

    pub fn probe(&self) -> MemoryProbe {
        self.probe.clone()
    }
}

impl DeviceProvider for MemoryProvider {
    fn open(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>> {
        if let Some(reason) = &self.refusal {
            return Err(AudioError::DeviceUnavailable(reason.clone()));
        }

        {
            let mut state = self.probe.state.lock();
            state.opened += 1;
            state.format = Some(*format);
        }

        Ok(Box::new(MemoryDevice {
            format: *format,
            pacing: self.pacing,
            gain_range: self.gain_range,
            closed: false,
            probe: self.probe.clone(),
        }))
    }
}

/// Shared view of everything the memory devices were asked to do.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    capture: bool,
    pending_failures: usize,
    opened: usize,
    closed: usize,
    drained: usize,
    writes: usize,
    bytes_written: u64,
    captured: Vec<u8>,
    gains: Vec<f32>,
    amplitude: f32,
    format: Option<PcmFormat>,
}

impl MemoryProbe {
    pub fn opened(&self) -> usize {
        self.state.lock().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().closed
    }

    pub fn drained(&self) -> usize {
        self.state.lock().drained
    }

    /// Successful writes.
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    /// Captured bytes; empty unless the provider was built with
    /// [`MemoryProvider::capturing`].
    pub fn captured(&self) -> Vec<u8> {
        self.state.lock().captured.clone()
    }

    pub fn gains(&self) -> Vec<f32> {
        self.state.lock().gains.clone()
    }

    pub fn last_gain(&self) -> Option<f32> {
        self.state.lock().gains.last().copied()
    }

    /// Linear amplitude factor the last gain corresponds to.
    pub fn amplitude(&self) -> f32 {
        self.state.lock().amplitude
    }

    pub fn format(&self) -> Option<PcmFormat> {
        self.state.lock().format
    }

    /// Forgets captured bytes and gains, keeping counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.captured.clear();
        state.gains.clear();
    }
}

/// A device that writes into a [`MemoryProbe`].
#[derive(Debug)]
pub struct MemoryDevice {
    format: PcmFormat,
    pacing: Pacing,
    gain_range: GainRange,
    closed: bool,
    probe: MemoryProbe,
}

impl MemoryDevice {
    fn pace(&self, bytes: usize) {
        let delay = match self.pacing {
            Pacing::None => return,
            Pacing::Fixed(delay) => delay,
            Pacing::RealTime => {
                let frames = bytes / self.format.frame_size().max(1);
                Duration::from_secs_f64(frames as f64 / f64::from(self.format.sample_rate.max(1)))
            }
        };
        thread::sleep(delay);
    }
}

impl OutputDevice for MemoryDevice {
    fn name(&self) -> &str {
        "memory"
    }

    fn gain_range(&self) -> GainRange {
        self.gain_range
    }

    fn set_gain(&mut self, gain: f32) {
        let mut state = self.probe.state.lock();
        state.gains.push(gain);
        state.amplitude = gain_to_amplitude(gain, self.gain_range);
    }

    fn write(&mut self, pcm: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }

        {
            let mut state = self.probe.state.lock();
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(io::Error::other("injected write failure"));
            }
            state.writes += 1;
            state.bytes_written += pcm.len() as u64;
            if state.capture {
                state.captured.extend_from_slice(pcm);
            }
        }

        self.pace(pcm.len());
        Ok(())
    }

    fn drain(&mut self) {
        self.probe.state.lock().drained += 1;
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.probe.state.lock().closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Endianness;
    use std::time::Instant;

    fn format() -> PcmFormat {
        PcmFormat {
            channels: 2,
            sample_rate: 1_000,
            bits_per_sample: 16,
            endianness: Endianness::Little,
        }
    }

    #[test]
    fn records_writes_and_gains() {
        let provider = MemoryProvider::new().capturing();
        let probe = provider.probe();
        let mut device = provider.open(&format()).unwrap();

        device.set_gain(-80.0);
        device.write(&[1, 2, 3, 4]).unwrap();
        device.set_gain(0.0);
        device.write(&[5, 6, 7, 8]).unwrap();
        device.close();

        assert_eq!(probe.opened(), 1);
        assert_eq!(probe.closed(), 1);
        assert_eq!(probe.captured(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(probe.gains(), vec![-80.0, 0.0]);
        assert_eq!(probe.amplitude(), 1.0);
        assert!(device.write(&[0; 4]).is_err());
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let provider = MemoryProvider::new().failing_writes(1);
        let probe = provider.probe();
        let mut device = provider.open(&format()).unwrap();

        assert!(device.write(&[0; 4]).is_err());
        assert!(device.write(&[0; 4]).is_ok());
        assert_eq!(probe.writes(), 1);
        assert_eq!(probe.bytes_written(), 4);
    }

    #[test]
    fn refusing_provider_reports_device_unavailable() {
        let err = MemoryProvider::new()
            .refusing("no sound card")
            .open(&format())
            .err()
            .unwrap();
        assert!(matches!(err, AudioError::DeviceUnavailable(_)));
    }

    #[test]
    fn real_time_pacing_blocks_for_the_played_duration() {
        let mut device = MemoryProvider::real_time().open(&format()).unwrap();
        let started = Instant::now();
        // 50 stereo frames at 1 kHz.
        device.write(&[0; 200]).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
