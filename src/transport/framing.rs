//! Message framing over a byte stream.
//!
//! Two framings are supported:
//!
//! ```text
//! LineDelimited   {"id":"1","method":"server.getVersion"}\n
//!
//! ContentLength   Content-Length: <length>\r\n
//!                 \r\n
//!                 <message-body>
//! ```
//!
//! The analysis server speaks line-delimited JSON on stdio. Content-Length
//! framing (the LSP convention) is available for servers behind a socket
//! bridge. Header parsing is case-insensitive and accepts both CRLF and LF.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// How messages are delimited on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON document per `\n`-terminated line.
    #[default]
    LineDelimited,
    /// HTTP-style `Content-Length` header followed by the body.
    ContentLength,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::LineDelimited => f.write_str("lines"),
            Framing::ContentLength => f.write_str("content-length"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lines" | "line" | "ndjson" => Ok(Framing::LineDelimited),
            "content-length" | "lsp" => Ok(Framing::ContentLength),
            other => Err(format!("unknown framing: {}", other)),
        }
    }
}

/// Errors reading or writing a single frame.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Missing Content-Length header")]
    MissingContentLength,

    #[error("Invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("Message size {size} exceeds maximum {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Line-delimited message contains a newline")]
    EmbeddedNewline,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the stream is still positioned at a frame boundary after
    /// this error, so reading can continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FramingError::InvalidUtf8 | FramingError::EmbeddedNewline)
    }
}

/// Read one framed message.
///
/// Blank lines between line-delimited messages are skipped. A final line
/// without a trailing newline is still returned as a message; the next
/// read then reports [`FramingError::Closed`].
///
/// # Errors
///
/// Returns an error if:
/// - The stream is closed (EOF) before a message starts
/// - No Content-Length header is found (Content-Length framing)
/// - The message exceeds [`MAX_MESSAGE_SIZE`]
/// - The body cannot be read completely
/// - The body is not valid UTF-8
pub async fn read_message<R>(reader: &mut R, framing: Framing) -> Result<String, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        Framing::LineDelimited => read_line_message(reader).await,
        Framing::ContentLength => read_content_length_message(reader).await,
    }
}

async fn read_line_message<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;
        let bytes_read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;

        if bytes_read == 0 {
            return Err(FramingError::Closed);
        }

        let terminated = line.last() == Some(&b'\n');
        if !terminated && line.len() > MAX_MESSAGE_SIZE {
            return Err(FramingError::TooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return String::from_utf8(line).map_err(|_| FramingError::InvalidUtf8);
    }
}

async fn read_content_length_message<R>(reader: &mut R) -> Result<String, FramingError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(FramingError::Closed);
        }

        let trimmed = line.trim();

        // Empty line ends the headers
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(
                    value
                        .parse()
                        .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?,
                );
            }
            // Other headers (e.g. Content-Type) are ignored
        }
    }

    let size = content_length.ok_or(FramingError::MissingContentLength)?;
    if size > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FramingError::Closed
        } else {
            FramingError::Io(e)
        }
    })?;

    String::from_utf8(body).map_err(|_| FramingError::InvalidUtf8)
}

/// Write one framed message and flush it.
///
/// The frame is assembled in memory and written with a single call so a
/// message is never interleaved with another writer's bytes.
///
/// # Errors
///
/// Returns [`FramingError::EmbeddedNewline`] if a line-delimited body
/// contains a newline, or an I/O error if the write or flush fails.
pub async fn write_message<W>(writer: &mut W, body: &str, framing: Framing) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let frame = match framing {
        Framing::LineDelimited => {
            if body.contains('\n') {
                return Err(FramingError::EmbeddedNewline);
            }
            let mut frame = Vec::with_capacity(body.len() + 1);
            frame.extend_from_slice(body.as_bytes());
            frame.push(b'\n');
            frame
        }
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            let mut frame = Vec::with_capacity(header.len() + body.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(body.as_bytes());
            frame
        }
    };

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
