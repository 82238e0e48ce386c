use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{config::WindowFunction, mixer::mean_amplitude, AudioError, Result};

/// Snapshot of one processed frame: the mono buffer fed to the FFT and the
/// magnitude spectrum derived from it.
///
/// The engine publishes a new window per frame and never mutates a published
/// one, so a `FrameWindow` is always internally consistent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameWindow {
    /// Zero before the first processed frame, then increments per frame.
    pub sequence: u64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    /// Magnitudes of bins `0..=samples.len() / 2`.
    pub spectrum: Vec<f32>,
}

impl FrameWindow {
    /// An all-silent window sized for `buffer_size` samples.
    pub fn silent(buffer_size: usize, sample_rate: u32) -> Self {
        Self {
            sequence: 0,
            sample_rate,
            samples: vec![0.0; buffer_size],
            spectrum: vec![0.0; buffer_size / 2 + 1],
        }
    }

    /// Mean absolute sample value over the frame, in `[0, 1]`.
    pub fn instantaneous_amplitude(&self) -> f32 {
        mean_amplitude(&self.samples).min(1.0)
    }

    /// Mean magnitude of the bins whose centre frequency lies in the band.
    pub fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        band_average(
            &self.spectrum,
            bin_width(self.sample_rate, self.samples.len()),
            min_hz,
            max_hz,
        )
    }

    /// Centre frequency of spectrum bin `index`.
    pub fn bin_frequency(&self, index: usize) -> f32 {
        index as f32 * bin_width(self.sample_rate, self.samples.len())
    }
}

/// Forward FFT over fixed-size mono buffers with band-energy queries.
pub struct SpectralAnalyzer {
    sample_rate: u32,
    window: WindowFunction,
    coefficients: Vec<f32>,
    fft: FftResources,
    magnitudes: Vec<f32>,
}

impl SpectralAnalyzer {
    /// Plans a forward FFT of `buffer_size` points.
    pub fn new(buffer_size: usize, sample_rate: u32, window: WindowFunction) -> Result<Self> {
        if buffer_size < 2 {
            return Err(AudioError::Config(
                "spectral analysis requires buffers of at least two samples".to_string(),
            ));
        }

        let fft = FftResources::plan(buffer_size);
        let coefficients = (0..buffer_size)
            .map(|index| window_value(window, index, buffer_size))
            .collect();

        Ok(Self {
            sample_rate,
            window,
            coefficients,
            magnitudes: vec![0.0; fft.spectrum.len()],
            fft,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.fft.size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn window(&self) -> WindowFunction {
        self.window
    }

    /// Replaces the spectrum with the one computed from `buffer`.
    ///
    /// Shorter buffers are zero-padded; longer ones are truncated to the
    /// planned size.
    pub fn forward(&mut self, buffer: &[f32]) -> Result<()> {
        let fft = &mut self.fft;
        for (index, slot) in fft.input.iter_mut().enumerate() {
            let sample = buffer.get(index).copied().unwrap_or(0.0);
            *slot = sample * self.coefficients[index];
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        for (magnitude, bin) in self.magnitudes.iter_mut().zip(&fft.spectrum) {
            *magnitude = bin.norm();
        }
        Ok(())
    }

    /// Magnitudes of bins `0..=N/2` from the last [`forward`](Self::forward).
    pub fn spectrum(&self) -> &[f32] {
        &self.magnitudes
    }

    pub fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        band_average(
            &self.magnitudes,
            bin_width(self.sample_rate, self.fft.size),
            min_hz,
            max_hz,
        )
    }
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("window", &self.window)
            .field("fft", &self.fft)
            .finish()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn bin_width(sample_rate: u32, fft_size: usize) -> f32 {
    if fft_size == 0 {
        0.0
    } else {
        sample_rate as f32 / fft_size as f32
    }
}

/// Mean of the bins whose centre lies in `[min_hz, max_hz]`. A band narrower
/// than one bin falls back to the bin nearest the band centre.
fn band_average(spectrum: &[f32], bin_hz: f32, min_hz: f32, max_hz: f32) -> f32 {
    if spectrum.is_empty() || bin_hz <= 0.0 || min_hz.is_nan() || max_hz.is_nan() {
        return 0.0;
    }

    let (low, high) = if min_hz <= max_hz {
        (min_hz, max_hz)
    } else {
        (max_hz, min_hz)
    };
    let last = spectrum.len() - 1;

    let first_bin = (low.max(0.0) / bin_hz).ceil() as usize;
    let last_bin = ((high / bin_hz).floor().max(0.0) as usize).min(last);

    if high >= 0.0 && first_bin <= last_bin {
        let bins = &spectrum[first_bin..=last_bin];
        return bins.iter().sum::<f32>() / bins.len() as f32;
    }

    let centre = ((low + high) * 0.5 / bin_hz).round().max(0.0) as usize;
    spectrum[centre.min(last)]
}

fn window_value(window: WindowFunction, index: usize, len: usize) -> f32 {
    match window {
        WindowFunction::Rectangular => 1.0,
        WindowFunction::Hann => hann_value(index, len),
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 44_100;
    const SIZE: usize = 1024;

    fn sine(bin: usize) -> (Vec<f32>, f32) {
        let freq = bin as f32 * RATE as f32 / SIZE as f32;
        let samples = (0..SIZE)
            .map(|i| (2.0 * PI * freq * i as f32 / RATE as f32).sin())
            .collect();
        (samples, freq)
    }

    fn analyzer() -> SpectralAnalyzer {
        SpectralAnalyzer::new(SIZE, RATE, WindowFunction::Rectangular).unwrap()
    }

    #[test]
    fn silence_has_an_empty_spectrum() {
        let mut analyzer = analyzer();
        analyzer.forward(&[0.0; SIZE]).unwrap();

        assert_eq!(analyzer.spectrum().len(), SIZE / 2 + 1);
        assert_eq!(analyzer.band_average(0.0, 22_050.0), 0.0);
    }

    #[test]
    fn sine_energy_lands_in_its_band() {
        let mut analyzer = analyzer();
        let (samples, f0) = sine(40);
        analyzer.forward(&samples).unwrap();

        let around = analyzer.band_average(f0 - 50.0, f0 + 50.0);
        let below = analyzer.band_average(20.0, f0 / 2.0);
        let above = analyzer.band_average(f0 * 2.0, 10_000.0);

        assert!(around > 100.0, "band containing f0 was {around}");
        assert!(below < 1.0, "disjoint low band was {below}");
        assert!(above < 1.0, "disjoint high band was {above}");
    }

    #[test]
    fn queries_are_stable_between_forwards() {
        let mut analyzer = analyzer();
        let (samples, f0) = sine(12);
        analyzer.forward(&samples).unwrap();

        let first = analyzer.band_average(f0 - 100.0, f0 + 100.0);
        let second = analyzer.band_average(f0 - 100.0, f0 + 100.0);
        assert_eq!(first, second);
        assert_eq!(first, analyzer.band_average(f0 + 100.0, f0 - 100.0));
    }

    #[test]
    fn narrow_band_uses_nearest_bin() {
        let mut analyzer = analyzer();
        let (samples, f0) = sine(100);
        analyzer.forward(&samples).unwrap();

        let narrow = analyzer.band_average(f0 - 1.0, f0 - 0.5);
        assert!((narrow - SIZE as f32 / 2.0).abs() < 1.0);
    }

    #[test]
    fn frame_window_matches_analyzer() {
        let mut analyzer = analyzer();
        let (samples, f0) = sine(64);
        analyzer.forward(&samples).unwrap();

        let window = FrameWindow {
            sequence: 1,
            sample_rate: RATE,
            samples: samples.clone(),
            spectrum: analyzer.spectrum().to_vec(),
        };

        assert_eq!(
            window.band_average(f0 - 200.0, f0 + 200.0),
            analyzer.band_average(f0 - 200.0, f0 + 200.0)
        );
        assert!((window.bin_frequency(64) - f0).abs() < 1e-3);
        assert!(window.instantaneous_amplitude() > 0.6);
    }

    #[test]
    fn hann_window_tapers_the_edges() {
        let mut analyzer = SpectralAnalyzer::new(SIZE, RATE, WindowFunction::Hann).unwrap();
        analyzer.forward(&[1.0; SIZE]).unwrap();

        let dc = analyzer.spectrum()[0];
        assert!(dc > 400.0 && dc < 600.0, "dc was {dc}");
    }

    #[test]
    fn rejects_tiny_buffers() {
        assert!(SpectralAnalyzer::new(1, RATE, WindowFunction::Hann).is_err());
    }
}
