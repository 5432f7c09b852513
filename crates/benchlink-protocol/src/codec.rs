//! Tokio codec for broker record framing.
//!
//! Each record is UTF-8 text preceded by its length as a 4-byte big-endian
//! integer. Length prefixing keeps the framing independent of the record
//! contents, so instrument data containing line breaks passes through
//! untouched.
//!
//! ```text
//! +----------------+---------------------------+
//! | len (u32, BE)  | record bytes (UTF-8)      |
//! +----------------+---------------------------+
//! ```
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//! use benchlink_protocol::RecordCodec;
//!
//! # async fn example() -> benchlink_core::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:5025").await?;
//! let mut framed = Framed::new(stream, RecordCodec::new());
//!
//! framed.send("OPEN GPIB0::1::INSTR".to_string()).await?;
//! if let Some(Ok(reply)) = framed.next().await {
//!     println!("Received: {reply}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limits
//!
//! Frames larger than the configured maximum (default 64 KB) are rejected
//! from the header alone, before any of the body is buffered.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use benchlink_core::constants::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN};
use benchlink_core::{Error, Result};

/// Length-prefixed text record codec.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    /// Maximum allowed record size in bytes, excluding the header.
    max_frame_size: usize,
}

impl RecordCodec {
    /// Create a new codec with the default maximum frame size.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with a custom maximum frame size.
    ///
    /// # Example
    ///
    /// ```
    /// use benchlink_protocol::RecordCodec;
    ///
    /// let codec = RecordCodec::with_max_frame_size(1024);
    /// assert_eq!(codec.max_frame_size(), 1024);
    /// ```
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = String;
    type Error = Error;

    /// Decode one record from the byte stream.
    ///
    /// - `Ok(Some(record))` - a complete record was decoded
    /// - `Ok(None)` - more bytes are needed
    /// - `Err(Error::FrameTooLarge)` - the header announces an oversized record
    /// - `Err(Error::InvalidEncoding)` - the record is not valid UTF-8
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: len,
                max_size: self.max_frame_size,
            });
        }

        let frame_len = FRAME_HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let body = src.split_to(len);

        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|e| Error::InvalidEncoding(e.to_string()))
    }
}

impl Encoder<String> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        let len = item.len();
        if len > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size: len,
                max_size: self.max_frame_size,
            });
        }
        let header = u32::try_from(len).map_err(|_| Error::FrameTooLarge {
            size: len,
            max_size: self.max_frame_size,
        })?;

        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u32(header);
        dst.extend_from_slice(item.as_bytes());

        Ok(())
    }
}
