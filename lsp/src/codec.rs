//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module provides [`FrameReader`] and [`FrameWriter`] for async
//! reading and writing of framed JSON-RPC messages, plus [`encode_frame`]
//! for the raw byte form.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (32 MiB). Larger bodies are skipped, not buffered.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// Errors produced while reading or writing frames.
///
/// Recoverable errors leave the stream positioned at the start of the next
/// frame, so the read loop may log them and keep going.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame body is not valid JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
        /// Leading bytes of the rejected body, lossily decoded for logging.
        preview: String,
    },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {value:?}")]
    InvalidContentLength { value: String },
    #[error("Content-Length {len} exceeds maximum {MAX_FRAME_BYTES}; body skipped")]
    Oversized { len: usize },
    #[error("unexpected EOF while reading {0}")]
    UnexpectedEof(&'static str),
    #[error("serializing JSON-RPC frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl CodecError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidJson { .. }
                | Self::MissingContentLength
                | Self::InvalidContentLength { .. }
                | Self::Oversized { .. }
        )
    }

    fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| match source.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEof(context),
            _ => Self::Io { context, source },
        }
    }
}

/// Encode a JSON value as a complete frame: header followed by the body bytes.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(msg).map_err(CodecError::Encode)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers and reads exactly that many bytes,
/// then deserializes the body as JSON.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF (clean shutdown).
    /// A body that is not JSON is consumed in full before the error is
    /// returned, so the caller can continue with the next frame.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None), // EOF
        };

        if content_length > MAX_FRAME_BYTES {
            let mut body = (&mut self.reader).take(content_length as u64);
            let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink())
                .await
                .map_err(CodecError::io("skipping oversized frame body"))?;
            if skipped < content_length as u64 {
                return Err(CodecError::UnexpectedEof("oversized frame body"));
            }
            return Err(CodecError::Oversized {
                len: content_length,
            });
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(CodecError::io("frame body"))?;

        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(source) => {
                let preview_len = body.len().min(50);
                Err(CodecError::InvalidJson {
                    source,
                    preview: String::from_utf8_lossy(&body[..preview_len]).into_owned(),
                })
            }
        }
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF.
    async fn read_headers(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Result<Option<usize>, CodecError> = Ok(None);
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(CodecError::io("header line"))?;

            if bytes_read == 0 {
                // EOF is only clean before the first header byte of a frame.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof("headers"));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            // Header names are case-insensitive.
            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                content_length = value.parse().map(Some).map_err(|_| {
                    CodecError::InvalidContentLength {
                        value: value.to_string(),
                    }
                });
            }
            // Ignore other headers (e.g. Content-Type)
        }

        // Without a usable length the body size is unknown; resync assumes the
        // next header block starts right after the separator.
        match content_length? {
            Some(len) => Ok(Some(len)),
            None => Err(CodecError::MissingContentLength),
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header, then flush.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), CodecError> {
        let frame = encode_frame(msg)?;
        self.writer
            .write_all(&frame)
            .await
            .map_err(CodecError::io("writing frame"))?;
        self.writer
            .flush()
            .await
            .map_err(CodecError::io("flushing frame"))?;
        Ok(())
    }

    /// Flush and close the underlying writer.
    pub async fn close(&mut self) -> Result<(), CodecError> {
        self.writer
            .shutdown()
            .await
            .map_err(CodecError::io("closing writer"))
    }
}
