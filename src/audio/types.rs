use bytes::Bytes;

/// Negotiated stream format, published by the decoder once the container
/// header has been parsed. Immutable for the life of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub channels: u16,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

/// Container kinds the reader recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Wav,
    Mp3,
    Flac,
}

impl FileType {
    /// Maps a bare file extension (no dot, any case) to a container kind.
    pub fn from_extension(ext: &str) -> Option<FileType> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(FileType::Wav),
            "mp3" => Some(FileType::Mp3),
            "flac" => Some(FileType::Flac),
            _ => None,
        }
    }

    /// Infers the container kind from a URL's path extension. Query string
    /// and fragment are ignored.
    pub fn from_url(url: &str) -> Option<FileType> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let name = path.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;
        FileType::from_extension(ext)
    }

    /// Extension hint handed to the container probe.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Wav => "wav",
            FileType::Mp3 => "mp3",
            FileType::Flac => "flac",
        }
    }
}

/// A memory-resident encoded file with a caller-declared container tag.
/// `Bytes` keeps the payload shared; the reader clones the handle for the
/// duration of one playback and never takes ownership of the backing data.
#[derive(Debug, Clone)]
pub struct MediaFile {
    pub data: Bytes,
    pub file_type: FileType,
}

impl MediaFile {
    pub fn new(data: Bytes, file_type: FileType) -> Self {
        Self { data, file_type }
    }
}

/// Conversion decisions for one resampler run, derived once from the
/// negotiated stream info against the pipeline's target rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleInfo {
    pub resample: bool,
    pub mono_to_stereo: bool,
}

/// Which stage produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Reader,
    Decoder,
    Resampler,
}

/// Sub-kind for hard decoder failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Container header could not be parsed from the complete stream.
    HeaderParse,
    /// Declared bit depth is not 16.
    IncompatibleBitDepth,
    /// More than two channels.
    IncompatibleChannels,
    /// Frame decoding failed repeatedly with no forward progress.
    CorruptStream,
}

/// Payload of a structured info/error event. Errors carry typed tags and
/// numeric codes only; presentation is the consumer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    /// Transport or OS error code observed by the reader.
    ReaderError(i32),
    DecoderError(DecodeErrorKind),
    ResamplerError,
    FileTypeDetected(FileType),
    StreamInfo(AudioStreamInfo),
    ResampleDecision(ResampleInfo),
}

/// One entry on the pipeline's bounded info/error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoErrorEvent {
    pub source: StageKind,
    pub payload: EventPayload,
}

/// Producer handle for the bounded info/error queue. Sending is lossy by
/// contract: under backpressure events beyond the configured depth are
/// dropped rather than blocking a worker.
#[derive(Clone)]
pub struct EventSender {
    tx: std::sync::mpsc::SyncSender<InfoErrorEvent>,
}

impl EventSender {
    pub fn new(tx: std::sync::mpsc::SyncSender<InfoErrorEvent>) -> Self {
        Self { tx }
    }

    pub fn send(&self, source: StageKind, payload: EventPayload) {
        let _ = self.tx.try_send(InfoErrorEvent { source, payload });
    }
}

/// Aggregate pipeline state derived from the per-stage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Playing,
    Stopped,
    ErrorReading,
    ErrorDecoding,
    ErrorResampling,
}

/// Outcome of one scheduling slice of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Made progress; call again immediately.
    Continue,
    /// No input available this slice; retry after a short idle.
    Idle,
    /// Terminal success.
    Finished,
    /// Terminal failure; details were sent on the event queue.
    Failed,
}
