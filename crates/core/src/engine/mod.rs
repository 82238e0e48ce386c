use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{
    analysis::{FrameWindow, SpectralAnalyzer},
    config::EngineConfig,
    cursor::StreamCursor,
    mixer::mix_frames,
    output::{DeviceProvider, OutputDevice},
    source::PcmFormat,
    transport::{output_gain, TransportState},
    AudioError, AudioSource, Result,
};

/// Coarse lifecycle state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Playing,
    /// Also the state right after loading.
    Paused,
    /// Terminal. The device and the decode stream have been released.
    Stopped,
}

/// Sent to subscribers once per processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub sequence: u64,
    pub progression: f64,
    pub amplitude: f32,
}

/// Handle to a running playback engine.
///
/// Each loaded source gets one processing thread that decodes, analyses and
/// plays frame after frame. Clones share the same engine. The engine stops when [`stop`](Self::stop)
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    source: Arc<AudioSource>,
    provider: Arc<dyn DeviceProvider>,
    config: EngineConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the handles and the processing thread.
struct Shared {
    transport: TransportState,
    cursor: Mutex<StreamCursor>,
    window: ArcSwap<FrameWindow>,
    subscribers: Mutex<Vec<Sender<FrameEvent>>>,
    idle: Mutex<()>,
    wake: Condvar,
}

impl PlaybackEngine {
    /// Starts the processing thread for `source` and waits until it has
    /// opened its output device. The engine starts paused.
    pub fn load(
        source: AudioSource,
        looping: bool,
        provider: Arc<dyn DeviceProvider>,
        config: EngineConfig,
    ) -> Result<Self> {
        let source = Arc::new(source);
        let format = source.format();
        let analyzer = SpectralAnalyzer::new(config.buffer_size, format.sample_rate, config.window)?;

        let shared = Arc::new(Shared {
            transport: TransportState::new(source.data_len(), looping),
            cursor: Mutex::new(StreamCursor::open(Arc::clone(&source))),
            window: ArcSwap::from_pointee(FrameWindow::silent(
                config.buffer_size,
                format.sample_rate,
            )),
            subscribers: Mutex::new(Vec::new()),
            idle: Mutex::new(()),
            wake: Condvar::new(),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let worker = {
            let shared = Arc::clone(&shared);
            let provider = Arc::clone(&provider);
            let config = config.clone();
            thread::Builder::new()
                .name("playback-engine".to_string())
                .spawn(move || {
                    let device = match provider.open(&format) {
                        Ok(device) => {
                            let _ = ready_tx.send(Ok(()));
                            device
                        }
                        Err(err) => {
                            let _ = ready_tx.send(Err(err));
                            return;
                        }
                    };
                    Worker::new(shared, device, analyzer, format, &config).run();
                })?
        };

        let opened = ready_rx.recv().unwrap_or_else(|_| {
            Err(AudioError::DeviceUnavailable(
                "processing thread exited before opening the device".to_string(),
            ))
        });
        if let Err(err) = opened {
            shared.transport.shut_down();
            if worker.join().is_err() {
                warn!("processing thread panicked while opening the device");
            }
            return Err(match err {
                AudioError::DeviceUnavailable(_) => err,
                other => AudioError::DeviceUnavailable(other.to_string()),
            });
        }

        info!(
            name = source.name(),
            channels = format.channels,
            rate = format.sample_rate,
            bytes = source.data_len(),
            looping,
            "loaded source"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                source,
                provider,
                config,
                shared,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Decodes `bytes` and loads them. See [`load`](Self::load).
    pub fn load_bytes(
        bytes: impl Into<Arc<[u8]>>,
        name: impl Into<String>,
        looping: bool,
        provider: Arc<dyn DeviceProvider>,
        config: EngineConfig,
    ) -> Result<Self> {
        let source = AudioSource::from_bytes(bytes, name)?;
        Self::load(source, looping, provider, config)
    }

    /// Stops this engine and loads `source` on the same device provider,
    /// keeping the volume and mute settings.
    pub fn replace(&self, source: AudioSource, looping: bool) -> Result<Self> {
        let volume = self.volume();
        let muted = self.is_muted();
        self.stop();

        let engine = Self::load(
            source,
            looping,
            Arc::clone(&self.inner.provider),
            self.inner.config.clone(),
        )?;
        engine.set_volume(volume);
        if muted {
            engine.mute();
        }
        Ok(engine)
    }

    /// Resumes playback, waking the processing thread if it is idle.
    pub fn play(&self) {
        self.transport().set_playing(true);
        self.inner.shared.wake();
    }

    /// Pauses after the frame in flight. The device stays open.
    pub fn pause(&self) {
        self.transport().set_playing(false);
    }

    /// Returns whether the engine is playing afterwards.
    pub fn toggle_playback(&self) -> bool {
        let playing = self.transport().toggle_playing();
        self.inner.shared.wake();
        playing
    }

    /// Silences the output from the next frame on. Analysis continues.
    pub fn mute(&self) {
        self.transport().set_muted(true);
    }

    /// Restores the gain for the current volume.
    pub fn unmute(&self) {
        self.transport().set_muted(false);
    }

    /// Volume in `[0, 1]`; out of range values are clamped and NaN counts
    /// as silence. Applied from the next frame on.
    pub fn set_volume(&self, volume: f32) {
        self.transport().set_volume(volume);
    }

    /// Whether playback restarts from the beginning at the end of the data.
    pub fn set_looping(&self, looping: bool) {
        self.transport().set_looping(looping);
        self.inner.shared.wake();
    }

    /// Moves playback to `progression` (clamped to `[0, 1]`) of the PCM data.
    pub fn set_progression(&self, progression: f64) {
        let shared = &self.inner.shared;
        if !shared.transport.is_alive() {
            return;
        }

        {
            let mut cursor = shared.cursor.lock();
            if cursor.is_closed() {
                return;
            }
            match cursor.seek_to_progression(progression) {
                Ok(offset) => debug!(progression, offset, "seeked"),
                Err(err) => skip_transient(&shared.transport, err, "seek failed"),
            }
            shared.transport.publish_bytes_consumed(cursor.bytes_consumed());
            shared.transport.set_exhausted(false);
        }
        shared.wake();
    }

    /// Stops playback for good and waits for the processing thread to
    /// release the device. Safe to call more than once.
    pub fn stop(&self) {
        self.inner.shut_down();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        let transport = self.transport();
        if !transport.is_alive() {
            EngineState::Stopped
        } else if transport.is_playing() {
            EngineState::Playing
        } else {
            EngineState::Paused
        }
    }

    /// Returns true while frames are being processed.
    pub fn is_playing(&self) -> bool {
        self.transport().is_playing()
    }

    /// Returns true if the output is muted.
    pub fn is_muted(&self) -> bool {
        self.transport().is_muted()
    }

    /// Returns true if playback wraps around at the end of the data.
    pub fn is_looping(&self) -> bool {
        self.transport().is_looping()
    }

    /// The volume last set, in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        self.transport().volume()
    }

    /// Fraction of the PCM data played, in `[0, 1]`.
    pub fn progression(&self) -> f64 {
        self.transport().progression()
    }

    /// PCM bytes read so far, moved by seeks and loop restarts.
    pub fn bytes_consumed(&self) -> u64 {
        self.transport().bytes_consumed()
    }

    /// Length of the PCM data, header excluded.
    pub fn total_bytes(&self) -> u64 {
        self.transport().total_bytes()
    }

    /// Playback position derived from the bytes consumed.
    pub fn position(&self) -> Duration {
        self.format().duration_of(self.bytes_consumed())
    }

    /// Total playback time of the source.
    pub fn duration(&self) -> Duration {
        self.inner.source.duration()
    }

    /// Name of the loaded source.
    pub fn name(&self) -> &str {
        self.inner.source.name()
    }

    /// The encoded bytes the engine was loaded from.
    pub fn raw_bytes(&self) -> &[u8] {
        self.inner.source.raw_bytes()
    }

    /// PCM layout of the loaded source.
    pub fn format(&self) -> PcmFormat {
        self.inner.source.format()
    }

    /// The loaded source.
    pub fn source(&self) -> &Arc<AudioSource> {
        &self.inner.source
    }

    /// Configuration the engine was loaded with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Mean absolute sample value of the latest frame, in `[0, 1]`.
    pub fn instantaneous_amplitude(&self) -> f32 {
        self.inner.shared.window.load().instantaneous_amplitude()
    }

    /// Mean spectral magnitude of the latest frame within the band.
    pub fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        self.inner.shared.window.load().band_average(min_hz, max_hz)
    }

    /// The latest published frame.
    pub fn frame_window(&self) -> Arc<FrameWindow> {
        self.inner.shared.window.load_full()
    }

    /// Returns a receiver of per-frame events. Events are dropped while the
    /// receiver's queue is full; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<FrameEvent> {
        let (tx, rx) = crossbeam_channel::bounded(self.inner.config.frame_event_capacity.max(1));
        self.inner.shared.subscribers.lock().push(tx);
        rx
    }

    /// Last gain applied to the output device.
    pub fn output_gain(&self) -> f32 {
        self.transport().gain()
    }

    /// Read, write and seek failures skipped so far.
    pub fn transient_errors(&self) -> u64 {
        self.transport().transient_errors()
    }

    /// Frames analysed since loading.
    pub fn frames_processed(&self) -> u64 {
        self.transport().frames_processed()
    }

    fn transport(&self) -> &TransportState {
        &self.inner.shared.transport
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("progression", &self.progression())
            .finish()
    }
}

impl EngineInner {
    fn shut_down(&self) {
        let first = self.shared.transport.shut_down();
        self.shared.wake();

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(name = self.source.name(), "processing thread panicked");
            }
        }
        if first {
            info!(name = self.source.name(), "stopped");
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl Shared {
    fn should_idle(&self) -> bool {
        let transport = &self.transport;
        transport.is_alive()
            && (!transport.is_playing() || (transport.is_exhausted() && !transport.is_looping()))
    }

    /// Blocks until woken or `timeout` elapses, unless there is work to do.
    fn idle(&self, timeout: Duration) {
        let mut guard = self.idle.lock();
        if self.should_idle() {
            self.wake.wait_for(&mut guard, timeout);
        }
    }

    fn wake(&self) {
        let _guard = self.idle.lock();
        self.wake.notify_all();
    }

    fn notify(&self, event: FrameEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
    }
}

/// The processing thread's state.
struct Worker {
    shared: Arc<Shared>,
    device: Box<dyn OutputDevice>,
    analyzer: SpectralAnalyzer,
    format: PcmFormat,
    silence_floor: f32,
    idle_poll: Duration,
    frame_bytes: Vec<u8>,
    mono: Vec<f32>,
    applied_gain: Option<f32>,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        device: Box<dyn OutputDevice>,
        analyzer: SpectralAnalyzer,
        format: PcmFormat,
        config: &EngineConfig,
    ) -> Self {
        Self {
            shared,
            device,
            format,
            silence_floor: config.silence_floor_db,
            idle_poll: config.idle_poll(),
            frame_bytes: vec![0; analyzer.buffer_size() * format.frame_size()],
            mono: vec![0.0; analyzer.buffer_size()],
            analyzer,
            applied_gain: None,
        }
    }

    fn run(mut self) {
        debug!(device = self.device.name(), "processing thread started");

        while self.shared.transport.is_alive() {
            if self.shared.should_idle() {
                self.shared.idle(self.idle_poll);
                continue;
            }
            if let Some(len) = self.read_next() {
                self.process(len);
            }
        }

        self.device.drain();
        self.device.close();
        self.shared.cursor.lock().close();
        debug!(device = self.device.name(), "processing thread finished");
    }

    /// Reads the next frame into `frame_bytes`. Handles end of stream by
    /// restarting or marking the stream exhausted.
    fn read_next(&mut self) -> Option<usize> {
        let transport = &self.shared.transport;
        let mut cursor = self.shared.cursor.lock();

        let read = cursor.read_frame(&mut self.frame_bytes);
        transport.publish_bytes_consumed(cursor.bytes_consumed());

        match read {
            Ok(0) if transport.is_looping() => {
                if let Err(err) = cursor.reset_to_byte_offset(0) {
                    skip_transient(transport, err, "failed to restart stream");
                }
                transport.publish_bytes_consumed(cursor.bytes_consumed());
                debug!("looped back to start");
                None
            }
            Ok(0) => {
                transport.set_exhausted(true);
                debug!("end of stream");
                None
            }
            Ok(len) => Some(len),
            Err(err) => {
                skip_transient(transport, err, "frame read failed, skipping");
                None
            }
        }
    }

    fn process(&mut self, len: usize) {
        let transport = &self.shared.transport;
        let pcm = &self.frame_bytes[..len];

        let frames = mix_frames(pcm, &self.format, &mut self.mono);
        if let Err(err) = self.analyzer.forward(&self.mono) {
            warn!(%err, "spectral analysis failed");
        }

        let gain = output_gain(
            transport.volume(),
            transport.is_muted(),
            self.device.gain_range(),
            self.silence_floor,
        );
        if self.applied_gain != Some(gain) {
            self.device.set_gain(gain);
            transport.record_gain(gain);
            self.applied_gain = Some(gain);
        }

        if let Err(err) = self.device.write(pcm) {
            skip_transient(transport, err, "device write failed, skipping frame");
        }

        let sequence = transport.next_frame();
        let window = FrameWindow {
            sequence,
            sample_rate: self.format.sample_rate,
            samples: self.mono.clone(),
            spectrum: self.analyzer.spectrum().to_vec(),
        };
        let amplitude = window.instantaneous_amplitude();
        self.shared.window.store(Arc::new(window));

        let progression = transport.progression();
        self.shared.notify(FrameEvent {
            sequence,
            progression,
            amplitude,
        });
        trace!(sequence, frames, gain, progression, "processed frame");
    }
}

/// Logs and counts a mid-stream failure. The loop carries on.
fn skip_transient(transport: &TransportState, err: io::Error, context: &str) {
    let err = AudioError::TransientIo(err);
    let count = transport.record_transient_error();
    warn!(%err, count, "{context}");
}
