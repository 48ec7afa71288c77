use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Every frame on the wire ends with this sequence.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Upper bound on a single frame unless the caller picks another one.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Carves `\r\n`-terminated frames out of a buffered byte stream.
///
/// JSON escapes control characters inside strings, so a well-formed payload
/// never contains a raw CR LF and the terminator can be matched literally.
///
/// Partially read bytes live in the reader rather than in the future
/// returned by [`FrameReader::read_frame`], which makes that future cancel
/// safe: dropping it from a `select!` or `timeout` keeps whatever was already
/// read and the next call picks up where it left off.
pub struct FrameReader<R> {
    inner: R,
    pending: Vec<u8>,
    max_frame_len: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            max_frame_len,
        }
    }

    /// Reads the next frame and returns its payload without the terminator.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames. A
    /// stream that ends in the middle of a frame is an `UnexpectedEof` error.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let last = TERMINATOR[TERMINATOR.len() - 1];

        loop {
            if self.pending.len() > self.max_frame_len + TERMINATOR.len() {
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame exceeds {} bytes", self.max_frame_len),
                ));
            }

            if self.pending.ends_with(TERMINATOR) {
                let mut frame = std::mem::take(&mut self.pending);
                frame.truncate(frame.len() - TERMINATOR.len());
                return Ok(Some(frame));
            }

            // Never read past one byte over the limit, even without a terminator.
            let budget = self.max_frame_len + TERMINATOR.len() + 1 - self.pending.len();
            let bytes = (&mut self.inner)
                .take(budget as u64)
                .read_until(last, &mut self.pending)
                .await?;
            if bytes == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let dangling = self.pending.len();
                self.pending.clear();
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {dangling} bytes of an unterminated frame"),
                ));
            }
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One buffer per frame so the terminator never gets split from its payload.
    let mut encoded = Vec::with_capacity(payload.len() + TERMINATOR.len());
    encoded.extend_from_slice(payload);
    encoded.extend_from_slice(TERMINATOR);
    writer.write_all(&encoded).await?;
    writer.flush().await
}

pub async fn write_record<W, T>(writer: &mut W, record: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(record).map_err(to_io_error)?;
    write_frame(writer, &payload).await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
