//! NDJSON codec for agent stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length to prevent memory exhaustion caused by unterminated or maliciously
//! large messages from a misbehaving agent process.
//!
//! Use [`WireCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound). Both directions enforce
//! UTF-8 line framing delimited by `\n`. A line that arrives split across
//! several reads is buffered until its terminating newline shows up; a
//! corrupt line never desynchronizes the frames that follow it.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{EngineError, Result};

/// Maximum line length accepted by the wire codec: 1 MiB.
///
/// Inbound lines exceeding this limit cause [`WireCodec::decode`] to return
/// [`EngineError::Protocol`] with `"line too long"`, protecting the host
/// from allocating unbounded memory for a single message.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// NDJSON codec for bidirectional agent stdio streams.
///
/// Delegates line-framing to [`LinesCodec`] with a fixed [`MAX_LINE_BYTES`]
/// limit. Each newline-terminated (`\n`) UTF-8 string is one complete
/// protocol document.
#[derive(Debug)]
pub struct WireCodec(LinesCodec);

impl WireCodec {
    /// Create a new `WireCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = EngineError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` when `src` contains no complete line yet
    /// (buffering). Returns `Err(EngineError::Protocol("line too long: …"))`
    /// when the line exceeds [`MAX_LINE_BYTES`].
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Decode the final line when the stream reaches EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for WireCodec {
    type Error = EngineError;

    /// Encode `item` as a `\n`-terminated NDJSON line into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Io`] on underlying I/O failures. The max-length
    /// limit is a decoder-side concern and is not enforced during encoding.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

/// Map a [`LinesCodecError`] to an [`EngineError`].
fn map_codec_error(e: LinesCodecError) -> EngineError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            EngineError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => EngineError::Io(io_err.to_string()),
    }
}
