//! Netstring framing for the postfix socketmap protocol.
//!
//! A frame is `<decimal-length>:<payload>,`, e.g. `12:hello world!,`. The
//! decoder is stateful per connection and yields one payload at a time; it
//! never buffers past the terminator of the current frame.

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::error::FramingError;

/// Maximum payload size accepted by the decoder.
///
/// Matches the postfix socketmap default reply size limit, which bounds
/// request keys far below this as well.
pub const MAX_FRAME_BYTES: usize = 100_000;

/// Encode a payload as a netstring frame.
#[must_use]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(payload.len().to_string().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(payload);
    frame.push(b',');
    frame
}

/// Stateful netstring decoder over an async byte stream.
pub struct NetstringReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> NetstringReader<R> {
    /// Wrap a byte stream in a decoder.
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly at a
    /// frame boundary. A close anywhere inside a frame yields
    /// [`FramingError::UnexpectedEof`].
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            let byte = match self.read_byte().await? {
                Some(byte) => byte,
                None if digits == 0 => return Ok(None),
                None => return Err(FramingError::UnexpectedEof),
            };
            match byte {
                b'0'..=b'9' => {
                    len = len * 10 + usize::from(byte - b'0');
                    if len > MAX_FRAME_BYTES {
                        return Err(FramingError::FrameTooLarge {
                            max_bytes: MAX_FRAME_BYTES,
                        });
                    }
                    digits += 1;
                }
                b':' if digits > 0 => break,
                _ => return Err(FramingError::InvalidLength { byte }),
            }
        }

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FramingError::UnexpectedEof,
                _ => FramingError::Io(e),
            })?;

        match self.read_byte().await? {
            Some(b',') => Ok(Some(payload)),
            Some(_) => Err(FramingError::MissingTerminator),
            None => Err(FramingError::UnexpectedEof),
        }
    }

    async fn read_byte(&mut self) -> Result<Option<u8>, FramingError> {
        let mut buf = [0u8; 1];
        match self.reader.read(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) => Err(FramingError::Io(e)),
        }
    }
}
