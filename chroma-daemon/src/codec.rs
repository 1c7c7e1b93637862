//! Length-prefixed envelope framing.
//!
//! ```text
//! +----------------+---------------------------+
//! | u32 BE length  | UTF-8 JSON body (length)  |
//! +----------------+---------------------------+
//! ```

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use chroma_core::config::DEFAULT_MAX_MESSAGE_BYTES;
use chroma_core::Envelope;

use crate::error::DaemonError;

pub const FRAME_HEADER_LEN: usize = 4;

/// Encodes and decodes framed envelopes under a maximum body size.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_message_bytes: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl MessageCodec {
    pub fn new(max_message_bytes: usize) -> Self {
        Self { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Frame an envelope: 4-byte big-endian length + JSON body.
    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, DaemonError> {
        self.encode_json(envelope)
    }

    /// Frame any serializable value with the envelope framing rules.
    pub fn encode_json<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, DaemonError> {
        // Serialize straight into the frame after a placeholder header.
        let mut framed = Vec::with_capacity(256);
        framed.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
        serde_json::to_writer(&mut framed, value)?;

        let body_len = framed.len() - FRAME_HEADER_LEN;
        if body_len > self.max_message_bytes {
            return Err(DaemonError::PayloadTooLarge {
                size: body_len,
                max: self.max_message_bytes,
            });
        }
        let len = u32::try_from(body_len).map_err(|_| DaemonError::PayloadTooLarge {
            size: body_len,
            max: self.max_message_bytes,
        })?;
        framed[..FRAME_HEADER_LEN].copy_from_slice(&len.to_be_bytes());
        Ok(framed)
    }

    /// Read exactly one envelope. A close before the first header byte is an
    /// `IncompleteFrame` too; use [`MessageCodec::next_envelope`] to treat it
    /// as end-of-stream.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Envelope, DaemonError>
    where
        R: AsyncRead + Unpin,
    {
        self.next_envelope(reader)
            .await?
            .ok_or(DaemonError::IncompleteFrame {
                expected: FRAME_HEADER_LEN,
                received: 0,
            })
    }

    /// Read the next envelope, or `None` when the peer closed cleanly between frames.
    pub async fn next_envelope<R>(&self, reader: &mut R) -> Result<Option<Envelope>, DaemonError>
    where
        R: AsyncRead + Unpin,
    {
        match self.read_frame(reader).await? {
            Some(body) => self.decode_body(&body).map(Some),
            None => Ok(None),
        }
    }

    /// Read and parse one framed JSON value of any type.
    pub async fn decode_json<T, R>(&self, reader: &mut R) -> Result<T, DaemonError>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        let body = self
            .read_frame(reader)
            .await?
            .ok_or(DaemonError::IncompleteFrame {
                expected: FRAME_HEADER_LEN,
                received: 0,
            })?;
        serde_json::from_slice(&body).map_err(|err| DaemonError::MalformedEnvelope(err.to_string()))
    }

    /// Parse a frame body into an envelope.
    pub fn decode_body(&self, body: &[u8]) -> Result<Envelope, DaemonError> {
        serde_json::from_slice(body).map_err(|err| DaemonError::MalformedEnvelope(err.to_string()))
    }

    /// Read one raw frame body. Oversized lengths are rejected before the body is read.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Vec<u8>>, DaemonError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let got = read_full(reader, &mut header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < FRAME_HEADER_LEN {
            return Err(DaemonError::IncompleteFrame {
                expected: FRAME_HEADER_LEN,
                received: got,
            });
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_message_bytes {
            return Err(DaemonError::PayloadTooLarge {
                size: len,
                max: self.max_message_bytes,
            });
        }

        let mut body = vec![0u8; len];
        let got = read_full(reader, &mut body).await?;
        if got < len {
            return Err(DaemonError::IncompleteFrame {
                expected: len,
                received: got,
            });
        }
        Ok(Some(body))
    }
}

/// Write a pre-encoded frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Fill `buf` until full or EOF; returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, DaemonError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|e| crate::error::io_err("frame read", e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
