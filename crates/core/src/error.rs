/// Result alias that carries the custom [`AudioError`] type.
pub type Result<T> = std::result::Result<T, AudioError>;

/// Common error type for the core crate.
///
/// Load-time failures (`NotFound`, `UnsupportedFormat`, `Decode`) and
/// `DeviceUnavailable` are returned to the caller of
/// [`PlaybackEngine::load`](crate::PlaybackEngine::load). `TransientIo` only
/// ever appears inside the processing loop, where it is logged and counted.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The sound asset is missing: the path does not exist or the payload is
    /// empty.
    #[error("audio asset not found: {0}")]
    NotFound(String),
    /// The payload is not 16-bit PCM in a container the engine understands.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    /// The container was recognised but its structure is broken.
    #[error("malformed audio data: {0}")]
    Decode(String),
    /// No usable output device. Fatal for the engine instance.
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),
    /// A frame could not be read from the stream or written to the device.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),
    /// A configuration file could not be read or understood.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("fft failure: {0}")]
    Fft(#[from] realfft::FftError),
}

impl AudioError {
    /// Returns `true` for errors that end the engine instance rather than a
    /// single frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TransientIo(_))
    }
}

impl From<hound::Error> for AudioError {
    fn from(value: hound::Error) -> Self {
        match value {
            hound::Error::IoError(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Self::Decode("wav payload ends before its header is complete".to_string())
            }
            hound::Error::IoError(err) => Self::Decode(err.to_string()),
            hound::Error::FormatError(reason) => Self::Decode(reason.to_string()),
            hound::Error::Unsupported => {
                Self::UnsupportedFormat("wav encoding is not plain PCM".to_string())
            }
            other => Self::UnsupportedFormat(other.to_string()),
        }
    }
}
