//! Newline-delimited JSON codec for worker communication.
//!
//! Each message is one JSON object followed by `\n`. Works over any
//! AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex) via
//! `FramedRead`/`FramedWrite`, or over raw chunks via [`FrameBuffer`].
//!
//! Decoding never fails the stream: a unit that cannot be parsed is yielded as
//! `Err(ProtocolError)` and the codec moves on to the next line.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Default per-line limit (1 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Codec that frames messages with a trailing newline and serializes with JSON.
pub struct NdjsonCodec<T> {
    max_line_length: usize,
    /// Where to resume the newline scan in the buffer.
    next_index: usize,
    /// Inside an oversized line; drop bytes until the next newline.
    discarding: bool,
    _phantom: PhantomData<T>,
}

impl<T> Default for NdjsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NdjsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
            discarding: false,
            _phantom: PhantomData,
        }
    }

    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }
}

impl<T: DeserializeOwned> NdjsonCodec<T> {
    fn parse_unit(line: &[u8]) -> Option<Result<T, ProtocolError>> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(serde_json::from_slice(line).map_err(|e| ProtocolError::malformed(line, &e)))
    }
}

impl<T: DeserializeOwned> Decoder for NdjsonCodec<T> {
    type Item = Result<T, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len().min(self.max_line_length.saturating_add(1));
            let newline = src[self.next_index.min(read_to)..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(pos)) => {
                    src.advance(pos + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(pos)) => {
                    self.next_index = 0;
                    let line = src.split_to(pos + 1);
                    if let Some(unit) = Self::parse_unit(&line) {
                        return Ok(Some(unit));
                    }
                }
                (false, None) if src.len() > self.max_line_length => {
                    self.discarding = true;
                    self.next_index = 0;
                    tracing::trace!(limit = self.max_line_length, "Discarding oversized line");
                    return Ok(Some(Err(ProtocolError::LineTooLong {
                        limit: self.max_line_length,
                    })));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(unit) = self.decode(src)? {
            return Ok(Some(unit));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        // Unterminated trailing unit.
        let rest = src.split();
        Ok(Self::parse_unit(&rest))
    }
}

impl<T: Serialize> Encoder<T> for NdjsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        if json.len() > self.max_line_length {
            tracing::warn!(
                json_size_bytes = json.len(),
                limit = self.max_line_length,
                "Encoded frame exceeds the line limit"
            );
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Push-style decoder for callers that receive raw byte chunks.
///
/// Partial trailing data stays buffered between [`feed`](Self::feed) calls.
pub struct FrameBuffer<T> {
    codec: NdjsonCodec<T>,
    buf: BytesMut,
}

impl<T: DeserializeOwned> Default for FrameBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> FrameBuffer<T> {
    pub fn new() -> Self {
        Self::with_codec(NdjsonCodec::new())
    }

    pub fn with_codec(codec: NdjsonCodec<T>) -> Self {
        Self {
            codec,
            buf: BytesMut::new(),
        }
    }

    /// Append a chunk and iterate over every unit it completes.
    ///
    /// The iterator is lazy; units not pulled stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_, T> {
        self.buf.extend_from_slice(chunk);
        Frames { owner: self }
    }

    /// Flush at end of stream, decoding any unterminated trailing unit.
    pub fn finish(&mut self) -> Vec<Result<T, ProtocolError>> {
        let mut units = Vec::new();
        while let Ok(Some(unit)) = self.codec.decode_eof(&mut self.buf) {
            units.push(unit);
        }
        units
    }

    /// Bytes held waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Units decoded from the bytes fed so far.
pub struct Frames<'a, T> {
    owner: &'a mut FrameBuffer<T>,
}

impl<T: DeserializeOwned> Iterator for Frames<'_, T> {
    type Item = Result<T, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        let FrameBuffer { codec, buf } = &mut *self.owner;
        codec.decode(buf).ok().flatten()
    }
}
