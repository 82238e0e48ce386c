//! Core library of the reactive audio engine.
//!
//! A [`PlaybackEngine`] decodes a 16-bit PCM WAV or AIFF source, plays it on
//! an output device and analyses each frame as it goes. Renderers read the
//! latest [`FrameWindow`] (amplitude and band energy) once per tick and turn
//! it into shape parameters through a [`ReactionSet`].

pub mod analysis;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod mixer;
pub mod output;
pub mod reaction;
pub mod source;
pub mod transport;

pub use analysis::{FrameWindow, SpectralAnalyzer};
pub use config::{AppConfig, EngineConfig, ReactionConfig, WindowFunction};
pub use cursor::StreamCursor;
pub use engine::{EngineState, FrameEvent, PlaybackEngine};
pub use error::{AudioError, Result};
pub use output::{memory::MemoryProvider, DeviceProvider, OutputDevice};
pub use reaction::{
    AnalysisSource, FrequencyPolicy, ParameterUpdate, Reaction, ReactionKind, ReactionSet,
    ReactionTarget,
};
pub use source::{AudioSource, Endianness, PcmFormat};
pub use transport::{GainRange, TransportState};
