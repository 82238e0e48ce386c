use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::cursor::progression_of;

/// Gain range of an output device, in device gain units (dB).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainRange {
    pub min: f32,
    pub max: f32,
}

impl GainRange {
    /// Range of a typical master-gain control: -80 dB up to +6.0206 dB (×2).
    pub const MASTER: Self = Self {
        min: -80.0,
        max: 6.020_6,
    };
}

impl Default for GainRange {
    fn default() -> Self {
        Self::MASTER
    }
}

/// Maps a volume in `[0, 1]` to a device gain.
///
/// Zero volume or mute selects the device minimum. Otherwise the volume is
/// spread over `[silence_floor, range.max]` and floored to whole gain units,
/// so volume changes land in coarse steps.
pub fn output_gain(volume: f32, muted: bool, range: GainRange, silence_floor: f32) -> f32 {
    if muted || volume.is_nan() || volume <= 0.0 {
        return range.min;
    }
    let volume = volume.min(1.0);
    let gain = ((range.max - silence_floor) * volume).floor() + silence_floor;
    gain.clamp(range.min, range.max)
}

/// Shared control and status block of one engine.
///
/// The flags (`playing`, `muted`, `looping`, `volume`) are read once per
/// iteration by the processing loop and the last write wins.
/// `bytes_consumed` is only stored while the engine's cursor lock is held, so
/// the published value always matches the cursor.
#[derive(Debug)]
pub struct TransportState {
    alive: AtomicBool,
    playing: AtomicBool,
    muted: AtomicBool,
    looping: AtomicBool,
    exhausted: AtomicBool,
    volume: AtomicU32,
    gain: AtomicU32,
    bytes_consumed: AtomicU64,
    total_bytes: u64,
    frames_processed: AtomicU64,
    transient_errors: AtomicU64,
}

impl TransportState {
    /// A live, paused transport at full volume.
    pub fn new(total_bytes: u64, looping: bool) -> Self {
        Self {
            alive: AtomicBool::new(true),
            playing: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            looping: AtomicBool::new(looping),
            exhausted: AtomicBool::new(false),
            volume: AtomicU32::new(1.0_f32.to_bits()),
            gain: AtomicU32::new(0.0_f32.to_bits()),
            bytes_consumed: AtomicU64::new(0),
            total_bytes,
            frames_processed: AtomicU64::new(0),
            transient_errors: AtomicU64::new(0),
        }
    }

    /// False once the engine has been stopped.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clears the liveness and playing flags. Returns `true` on the first
    /// call only.
    pub fn shut_down(&self) -> bool {
        self.playing.store(false, Ordering::Release);
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Returns true while playback is requested.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Ignored once the transport is shut down.
    pub fn set_playing(&self, playing: bool) {
        if self.is_alive() {
            self.playing.store(playing, Ordering::Release);
        }
    }

    /// Flips the playing flag and returns the new value.
    pub fn toggle_playing(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        !self.playing.fetch_xor(true, Ordering::AcqRel)
    }

    /// Returns true if the output is muted.
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Takes effect on the next frame.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Returns true if playback wraps at the end of the data.
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Sets whether playback wraps at the end of the data.
    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    /// Set when the stream ended without looping; cleared by a seek.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Marks or clears the end of a non-looping stream.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Release);
    }

    /// The stored volume, in `[0, 1]`.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    /// Stores `volume` clamped to `[0, 1]`; NaN is stored as 0.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() {
            0.0
        } else {
            volume.clamp(0.0, 1.0)
        };
        self.volume.store(volume.to_bits(), Ordering::Release);
    }

    /// Last gain applied to the output device.
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Acquire))
    }

    pub(crate) fn record_gain(&self, gain: f32) {
        self.gain.store(gain.to_bits(), Ordering::Release);
    }

    /// PCM bytes consumed, as last published by the cursor owner.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed.load(Ordering::Acquire)
    }

    /// Must only be called while the cursor lock is held.
    pub(crate) fn publish_bytes_consumed(&self, bytes: u64) {
        self.bytes_consumed
            .store(bytes.min(self.total_bytes), Ordering::Release);
    }

    /// Length of the PCM data.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Fraction of the PCM data consumed, in `[0, 1]`.
    pub fn progression(&self) -> f64 {
        progression_of(self.bytes_consumed(), self.total_bytes)
    }

    /// Frames processed since the transport was created.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Acquire)
    }

    pub(crate) fn next_frame(&self) -> u64 {
        self.frames_processed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Read, write and seek failures skipped so far.
    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Ordering::Acquire)
    }

    pub(crate) fn record_transient_error(&self) -> u64 {
        self.transient_errors.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: f32 = -15.0;

    #[test]
    fn silent_volume_or_mute_selects_device_minimum() {
        let range = GainRange::MASTER;
        assert_eq!(output_gain(0.0, false, range, FLOOR), range.min);
        assert_eq!(output_gain(0.8, true, range, FLOOR), range.min);
        assert_eq!(output_gain(f32::NAN, false, range, FLOOR), range.min);
    }

    #[test]
    fn full_volume_maps_to_top_step() {
        let range = GainRange::MASTER;
        // floor(6.0206 + 15) - 15
        assert_eq!(output_gain(1.0, false, range, FLOOR), 6.0);

        let exact = GainRange { min: -40.0, max: 5.0 };
        assert_eq!(output_gain(1.0, false, exact, FLOOR), 5.0);
    }

    #[test]
    fn volume_is_quantised_to_whole_steps() {
        let range = GainRange { min: -80.0, max: 5.0 };
        assert_eq!(output_gain(0.5, false, range, FLOOR), -5.0);
        assert_eq!(output_gain(0.51, false, range, FLOOR), -5.0);
        assert_eq!(output_gain(0.01, false, range, FLOOR), -15.0);
    }

    #[test]
    fn stores_volume_clamped() {
        let state = TransportState::new(100, false);
        state.set_volume(0.25);
        assert_eq!(state.volume(), 0.25);
        state.set_volume(7.0);
        assert_eq!(state.volume(), 1.0);
        state.set_volume(f32::NAN);
        assert_eq!(state.volume(), 0.0);
    }

    #[test]
    fn flags_freeze_after_shutdown() {
        let state = TransportState::new(100, true);
        state.set_playing(true);
        assert!(!state.toggle_playing());
        assert!(state.toggle_playing());

        assert!(state.shut_down());
        assert!(!state.shut_down());
        assert!(!state.is_playing());
        state.set_playing(true);
        assert!(!state.is_playing());
        assert!(!state.toggle_playing());
    }

    #[test]
    fn progression_tracks_published_bytes() {
        let state = TransportState::new(200, false);
        state.publish_bytes_consumed(50);
        assert_eq!(state.progression(), 0.25);
        state.publish_bytes_consumed(500);
        assert_eq!(state.progression(), 1.0);
    }
}
