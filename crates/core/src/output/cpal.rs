use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{info, warn};

use super::{closed_error, gain_to_amplitude, DeviceProvider, OutputDevice};
use crate::{mixer::decode_sample, source::PcmFormat, transport::GainRange, AudioError, Result};

const DEFAULT_LATENCY: Duration = Duration::from_millis(250);

/// Opens the host's output device.
#[derive(Debug, Clone)]
pub struct CpalProvider {
    device_name: Option<String>,
    latency: Duration,
}

impl CpalProvider {
    /// The default output device of the default host.
    pub fn new() -> Self {
        Self {
            device_name: None,
            latency: DEFAULT_LATENCY,
        }
    }

    /// Prefers the output device called `name`, falling back to the default.
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Amount of audio buffered ahead of the device.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn find_device(&self, host: &cpal::Host) -> Option<cpal::Device> {
        if let Some(wanted) = &self.device_name {
            let found = host.output_devices().ok().and_then(|mut devices| {
                devices.find(|device| device.name().map(|n| &n == wanted).unwrap_or(false))
            });
            if found.is_some() {
                return found;
            }
            warn!(device = %wanted, "output device not found, using default");
        }
        host.default_output_device()
    }
}

impl Default for CpalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for CpalProvider {
    fn open(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>> {
        let host = cpal::default_host();
        let device = self
            .find_device(&host)
            .ok_or_else(|| AudioError::DeviceUnavailable("no output device".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let (config, sample_format) = pick_config(&device, format)?;
        let out_channels = usize::from(config.channels);
        let capacity = (self.latency.as_secs_f64() * f64::from(config.sample_rate.0)).ceil()
            as usize
            * out_channels;
        let (producer, consumer) = HeapRb::<f32>::new(capacity.max(out_channels * 64)).split();

        let gain = Arc::new(AtomicU32::new(1.0_f32.to_bits()));
        let failed = Arc::new(AtomicBool::new(false));
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, &gain, &failed),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, &gain, &failed),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, &gain, &failed),
            other => {
                return Err(AudioError::DeviceUnavailable(format!(
                    "unsupported device sample format {other:?}"
                )))
            }
        }
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
        stream
            .play()
            .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;

        info!(
            device = %name,
            rate = config.sample_rate.0,
            channels = config.channels,
            ?sample_format,
            "opened output device"
        );

        Ok(Box::new(CpalDevice {
            name,
            stream: Some(stream),
            producer,
            gain,
            failed,
            source: *format,
            out_channels,
            out_rate: config.sample_rate.0,
            phase: 0.0,
            frame: Vec::with_capacity(usize::from(format.channels)),
        }))
    }
}

/// Prefers a configuration matching the source's rate and channel count,
/// otherwise takes the device default.
fn pick_config(device: &cpal::Device, format: &PcmFormat) -> Result<(StreamConfig, SampleFormat)> {
    let rate = cpal::SampleRate(format.sample_rate);

    if let Ok(ranges) = device.supported_output_configs() {
        let mut matching: Vec<_> = ranges
            .filter(|range| {
                range.channels() == format.channels
                    && range.min_sample_rate() <= rate
                    && rate <= range.max_sample_rate()
            })
            .collect();
        matching.sort_by_key(|range| range.sample_format() != SampleFormat::F32);
        if let Some(range) = matching.into_iter().next() {
            let supported = range.with_sample_rate(rate);
            return Ok((supported.config(), supported.sample_format()));
        }
    }

    let supported = device
        .default_output_config()
        .map_err(|err| AudioError::DeviceUnavailable(err.to_string()))?;
    warn!(
        source_rate = format.sample_rate,
        source_channels = format.channels,
        device_rate = supported.sample_rate().0,
        device_channels = supported.channels(),
        "device does not support the source layout, converting"
    );
    Ok((supported.config(), supported.sample_format()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    gain: &Arc<AtomicU32>,
    failed: &Arc<AtomicBool>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let gain = Arc::clone(gain);
    let failed = Arc::clone(failed);

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let amplitude = f32::from_bits(gain.load(Ordering::Relaxed));
            for out in data.iter_mut() {
                let sample = consumer.try_pop().unwrap_or(0.0);
                *out = T::from_sample(sample * amplitude);
            }
        },
        move |err| {
            warn!(%err, "output stream error");
            failed.store(true, Ordering::Release);
        },
        None,
    )
}

/// Converts written 16-bit PCM to `f32`, maps it to the device's channel
/// layout and sample rate and pushes it into a ring buffer drained by the
/// cpal callback, which also applies the master gain.
struct CpalDevice {
    name: String,
    stream: Option<Stream>,
    producer: HeapProd<f32>,
    gain: Arc<AtomicU32>,
    failed: Arc<AtomicBool>,
    source: PcmFormat,
    out_channels: usize,
    out_rate: u32,
    /// Position inside the current write, in source frames, for rate
    /// conversion.
    phase: f64,
    frame: Vec<f32>,
}

impl CpalDevice {
    fn push_blocking(&mut self, sample: f32) -> io::Result<()> {
        let mut sample = sample;
        loop {
            match self.producer.try_push(sample) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if self.failed.load(Ordering::Acquire) {
                        return Err(io::Error::other("output stream failed"));
                    }
                    sample = rejected;
                    thread::park_timeout(Duration::from_micros(200));
                }
            }
        }
    }

    fn push_frame(&mut self) -> io::Result<()> {
        let source_channels = self.frame.len();
        for out_channel in 0..self.out_channels {
            let sample = map_channel(&self.frame, source_channels, out_channel, self.out_channels);
            self.push_blocking(sample)?;
        }
        Ok(())
    }
}

/// Picks or mixes the sample for `out_channel` of an `out_channels` layout
/// from one interleaved source frame.
fn map_channel(frame: &[f32], source_channels: usize, out_channel: usize, out_channels: usize) -> f32 {
    match (source_channels, out_channels) {
        (0, _) => 0.0,
        (1, _) => frame[0],
        (_, 1) => frame.iter().sum::<f32>() / source_channels as f32,
        _ => frame[out_channel % source_channels],
    }
}

impl OutputDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn gain_range(&self) -> GainRange {
        GainRange::MASTER
    }

    fn set_gain(&mut self, gain: f32) {
        let amplitude = gain_to_amplitude(gain, GainRange::MASTER);
        self.gain.store(amplitude.to_bits(), Ordering::Relaxed);
    }

    fn write(&mut self, pcm: &[u8]) -> io::Result<()> {
        if self.stream.is_none() {
            return Err(closed_error());
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(io::Error::other("output stream failed"));
        }

        let frame_size = self.source.frame_size();
        let frames: Vec<&[u8]> = pcm.chunks_exact(frame_size).collect();
        let endianness = self.source.endianness;
        let step = f64::from(self.source.sample_rate) / f64::from(self.out_rate.max(1));

        // Zero-order hold: each output frame repeats the source frame under
        // the running phase.
        while (self.phase as usize) < frames.len() {
            let raw = frames[self.phase as usize];
            self.frame.clear();
            self.frame.extend(raw.chunks_exact(2).map(|pair| {
                f32::from(decode_sample([pair[0], pair[1]], endianness)) / 32_768.0
            }));
            self.push_frame()?;
            self.phase += step;
        }
        self.phase -= frames.len() as f64;
        Ok(())
    }

    fn drain(&mut self) {
        let buffered = self.producer.occupied_len() / self.out_channels.max(1);
        let deadline = Instant::now()
            + Duration::from_secs_f64(buffered as f64 / f64::from(self.out_rate.max(1)))
            + Duration::from_millis(100);

        while !self.producer.is_empty()
            && !self.failed.load(Ordering::Acquire)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                warn!(%err, device = %self.name, "failed to pause output stream");
            }
            info!(device = %self.name, "closed output device");
        }
    }
}
