//! Audio payload formats and capture-format negotiation.

use crate::audio::wav;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;

/// Container/codec of an encoded audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioFormat {
    WebmOpus,
    Webm,
    OggOpus,
    Mp4,
    Wav,
}

/// Capture format preference, most widely decodable compressed format first.
pub const CAPTURE_PREFERENCE: &[AudioFormat] = &[
    AudioFormat::WebmOpus,
    AudioFormat::Webm,
    AudioFormat::OggOpus,
    AudioFormat::Mp4,
    AudioFormat::Wav,
];

impl AudioFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::WebmOpus => "audio/webm;codecs=opus",
            AudioFormat::Webm => "audio/webm",
            AudioFormat::OggOpus => "audio/ogg;codecs=opus",
            AudioFormat::Mp4 => "audio/mp4",
            AudioFormat::Wav => "audio/wav",
        }
    }

    /// File extension used when uploading a payload of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::WebmOpus | AudioFormat::Webm => "webm",
            AudioFormat::OggOpus => "ogg",
            AudioFormat::Mp4 => "mp4",
            AudioFormat::Wav => "wav",
        }
    }

    /// Best-effort mapping from a MIME / Content-Type string.
    ///
    /// Unknown or empty types map to WAV, the format the speech backend
    /// returns for synthesized audio.
    pub fn from_mime(mime: &str) -> Self {
        let lower = mime.to_ascii_lowercase();
        if lower.contains("wav") {
            AudioFormat::Wav
        } else if lower.contains("mp4") {
            AudioFormat::Mp4
        } else if lower.contains("ogg") {
            AudioFormat::OggOpus
        } else if lower.contains("webm") && lower.contains("opus") {
            AudioFormat::WebmOpus
        } else if lower.contains("webm") {
            AudioFormat::Webm
        } else {
            AudioFormat::Wav
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// One finished, encoded piece of audio.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub format: AudioFormat,
    pub data: Vec<u8>,
}

impl AudioPayload {
    pub fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for AudioPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPayload")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Encodes captured PCM into a payload of one specific format.
pub trait PayloadEncoder: Send + Sync {
    fn format(&self) -> AudioFormat;

    /// Encode 16-bit mono PCM at `sample_rate` into the container bytes.
    fn encode(&self, samples: &[i16], sample_rate: u32) -> Result<Vec<u8>>;
}

/// 16-bit PCM WAV encoder. Always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavEncoder;

impl PayloadEncoder for WavEncoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn encode(&self, samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
        wav::encode_wav(samples, sample_rate)
    }
}

/// Pick the capture encoder: first entry of [`CAPTURE_PREFERENCE`] with a
/// registered encoder, otherwise WAV.
pub fn negotiate_encoder(encoders: &[Arc<dyn PayloadEncoder>]) -> Arc<dyn PayloadEncoder> {
    CAPTURE_PREFERENCE
        .iter()
        .find_map(|preferred| {
            encoders
                .iter()
                .find(|encoder| encoder.format() == *preferred)
                .cloned()
        })
        .unwrap_or_else(|| Arc::new(WavEncoder))
}
