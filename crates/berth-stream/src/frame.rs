//! Binary framing for multiplexed attach/logs streams.
//!
//! Every frame is an 8-byte header followed by its payload:
//!
//! ```text
//! +-----+-----+-----+-----+-----+-----+-----+-----+------------------+
//! | tag |  reserved (0)   |   payload length (u32, big-endian)  | payload ... |
//! +-----+-----+-----+-----+-----+-----+-----+-----+------------------+
//! ```
//!
//! The reserved bytes are written as zero and ignored when reading.

use std::io::{self, Read, Write};

use berth_common::error::{BerthError, Result};

pub use berth_common::error::FrameError;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Logical sub-stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamTag {
    /// Process standard input.
    Stdin = 0,
    /// Process standard output.
    Stdout = 1,
    /// Process standard error.
    Stderr = 2,
}

impl TryFrom<u8> for StreamTag {
    type Error = FrameError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            other => Err(FrameError::UnknownStreamTag(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sub-stream the payload belongs to.
    pub tag: StreamTag,
    /// Number of payload bytes following the header.
    pub len: u32,
}

/// Builds the header for a payload of `len` bytes.
#[must_use]
pub fn encode_header(tag: StreamTag, len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0_u8; HEADER_LEN];
    header[0] = tag as u8;
    header[4..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Encodes one complete frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload does not fit the
/// 32-bit length field.
pub fn encode(tag: StreamTag, payload: &[u8]) -> std::result::Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(tag, len));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes an 8-byte frame header.
///
/// # Errors
///
/// Returns [`FrameError::UnknownStreamTag`] if byte 0 is not 0, 1 or 2.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> std::result::Result<FrameHeader, FrameError> {
    let tag = StreamTag::try_from(header[0])?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Ok(FrameHeader { tag, len })
}

/// Reads frames one at a time from a multiplexed byte stream.
///
/// The payload buffer is reused across frames; nothing is read beyond the
/// frame currently being returned.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    payload: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream positioned at a frame boundary.
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            payload: Vec::new(),
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream at a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the stream ends inside a header or
    /// payload, or if the header carries an unknown tag. Underlying read
    /// failures are returned as I/O errors.
    pub fn next_frame(&mut self) -> Result<Option<(StreamTag, &[u8])>> {
        let mut header = [0_u8; HEADER_LEN];
        let got = read_full(&mut self.inner, &mut header)
            .map_err(|e| BerthError::io("reading frame header", e))?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(FrameError::TruncatedHeader { got }.into());
        }

        let FrameHeader { tag, len } = decode_header(&header)?;
        let expected = len as usize;
        // Grow only as bytes arrive; the header length is untrusted.
        self.payload.clear();
        let got = (&mut self.inner)
            .take(u64::from(len))
            .read_to_end(&mut self.payload)
            .map_err(|e| BerthError::io("reading frame payload", e))?;
        if got < expected {
            return Err(FrameError::TruncatedPayload { expected, got }.into());
        }
        Ok(Some((tag, &self.payload)))
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writer that frames every write with a fixed stream tag.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
    tag: StreamTag,
}

impl<W: Write> FrameWriter<W> {
    /// Creates a writer emitting frames tagged `tag` into `inner`.
    pub const fn new(inner: W, tag: StreamTag) -> Self {
        Self { inner, tag }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = &buf[..buf.len().min(u32::MAX as usize)];
        let len = u32::try_from(chunk.len()).unwrap_or(u32::MAX);
        self.inner.write_all(&encode_header(self.tag, len))?;
        self.inner.write_all(chunk)?;
        Ok(chunk.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Fills `buf` from `reader`, stopping early only at end of stream.
///
/// Returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn header_layout_is_tag_reserved_big_endian_length() {
        let header = encode_header(StreamTag::Stderr, 0x0102_0304);
        assert_eq!(header, [2, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn decode_ignores_reserved_bytes() {
        let header = [1, 0xff, 0xee, 0xdd, 0, 0, 0, 5];
        let decoded = decode_header(&header).expect("valid header");
        assert_eq!(decoded.tag, StreamTag::Stdout);
        assert_eq!(decoded.len, 5);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let header = [7, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(decode_header(&header), Err(FrameError::UnknownStreamTag(7)));
    }

    #[test]
    fn reader_returns_none_on_clean_eof() {
        let mut reader = FrameReader::new(&[][..]);
        assert!(reader.next_frame().expect("clean eof").is_none());
    }

    #[test]
    fn reader_reports_truncated_header() {
        let mut reader = FrameReader::new(&[1_u8, 0, 0][..]);
        let err = reader.next_frame().expect_err("short header");
        assert!(matches!(
            err,
            BerthError::Framing(FrameError::TruncatedHeader { got: 3 })
        ));
    }

    #[test]
    fn reader_reports_truncated_payload() {
        let mut bytes = encode_header(StreamTag::Stdout, 10).to_vec();
        bytes.extend_from_slice(b"abcd");
        let mut reader = FrameReader::new(&bytes[..]);
        let err = reader.next_frame().expect_err("short payload");
        assert!(matches!(
            err,
            BerthError::Framing(FrameError::TruncatedPayload {
                expected: 10,
                got: 4
            })
        ));
    }

    #[test]
    fn oversized_length_without_payload_is_truncated_not_allocated() {
        let mut reader = FrameReader::new(&[1_u8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff][..]);
        let err = reader.next_frame().expect_err("no payload");
        assert!(matches!(
            err,
            BerthError::Framing(FrameError::TruncatedPayload {
                expected: 4_294_967_295,
                got: 0
            })
        ));
    }

    #[test]
    fn payload_buffer_is_reset_between_frames() {
        let mut bytes = encode(StreamTag::Stdout, b"longer payload").expect("encode");
        bytes.extend(encode(StreamTag::Stderr, b"short").expect("encode"));
        let mut reader = FrameReader::new(&bytes[..]);
        let _ = reader.next_frame().expect("first").expect("frame");
        let (tag, payload) = reader.next_frame().expect("second").expect("frame");
        assert_eq!(tag, StreamTag::Stderr);
        assert_eq!(payload, b"short");
    }

    #[test]
    fn zero_length_frame_is_valid() {
        let bytes = encode(StreamTag::Stdout, b"").expect("encode");
        let mut reader = FrameReader::new(&bytes[..]);
        let (tag, payload) = reader.next_frame().expect("read").expect("frame");
        assert_eq!(tag, StreamTag::Stdout);
        assert!(payload.is_empty());
        assert!(reader.next_frame().expect("eof").is_none());
    }

    #[test]
    fn frame_writer_emits_one_frame_per_write() {
        let mut writer = FrameWriter::new(Vec::new(), StreamTag::Stderr);
        writer.write_all(b"oops").expect("write");
        assert_eq!(writer.write(b"").expect("empty write"), 0);
        let bytes = writer.into_inner();
        assert_eq!(bytes, encode(StreamTag::Stderr, b"oops").expect("encode"));
    }

    fn any_tag() -> impl Strategy<Value = StreamTag> {
        prop_oneof![
            Just(StreamTag::Stdin),
            Just(StreamTag::Stdout),
            Just(StreamTag::Stderr)
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(tag in any_tag(), payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let bytes = encode(tag, &payload).expect("encode");
            let mut reader = FrameReader::new(&bytes[..]);
            let (got_tag, got_payload) = reader.next_frame().expect("read").expect("frame");
            prop_assert_eq!(got_tag, tag);
            prop_assert_eq!(got_payload, &payload[..]);
        }
    }
}
