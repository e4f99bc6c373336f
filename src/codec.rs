//! Binary tagged-term encoding and the framed message codec.
//!
//! Terms encode as one tag byte followed by big-endian fixed-width fields
//! (see the tag constants below). Frames add a 4-byte length prefix via
//! `LengthDelimitedCodec`, so a stream reader always extracts exactly one
//! message regardless of pipe or TCP coalescing; partial frames stay
//! buffered and are never dispatched early.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::WireMessage;
use crate::term::{Atom, Term};

const TAG_INTEGER: u8 = 0x01;
const TAG_FLOAT: u8 = 0x02;
const TAG_ATOM: u8 = 0x03;
const TAG_BINARY: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_TUPLE: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

/// Nesting bound for decoding; hostile input must not exhaust the stack.
const MAX_TERM_DEPTH: usize = 64;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Malformed or truncated term bytes.
///
/// Decoding never partially mutates caller-visible state: on error the
/// input is treated as unconsumed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown term tag {tag:#04x} at offset {offset}")]
    UnknownTag { offset: usize, tag: u8 },

    #[error("truncated term at offset {offset}: {needed} more bytes needed")]
    Truncated { offset: usize, needed: usize },

    #[error("invalid utf-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("duplicate map key at offset {offset}")]
    DuplicateMapKey { offset: usize },

    #[error("term nesting exceeds depth {max} at offset {offset}")]
    TooDeep { offset: usize, max: usize },
}

/// Encodes one term into `dst`. Total over the term domain.
pub fn encode_term(term: &Term, dst: &mut BytesMut) {
    match term {
        Term::Integer(v) => {
            dst.put_u8(TAG_INTEGER);
            dst.put_i64(*v);
        }
        Term::Float(v) => {
            dst.put_u8(TAG_FLOAT);
            dst.put_u64(v.to_bits());
        }
        Term::Atom(a) => {
            dst.put_u8(TAG_ATOM);
            let name = a.as_str().as_bytes();
            dst.put_u32(name.len() as u32);
            dst.put_slice(name);
        }
        Term::Binary(bytes) => {
            dst.put_u8(TAG_BINARY);
            dst.put_u32(bytes.len() as u32);
            dst.put_slice(bytes);
        }
        Term::Str(s) => {
            dst.put_u8(TAG_STR);
            dst.put_u32(s.len() as u32);
            dst.put_slice(s.as_bytes());
        }
        Term::Tuple(elements) => {
            dst.put_u8(TAG_TUPLE);
            dst.put_u32(elements.len() as u32);
            for element in elements {
                encode_term(element, dst);
            }
        }
        Term::List(elements) => {
            dst.put_u8(TAG_LIST);
            dst.put_u32(elements.len() as u32);
            for element in elements {
                encode_term(element, dst);
            }
        }
        Term::Map(entries) => {
            dst.put_u8(TAG_MAP);
            dst.put_u32(entries.len() as u32);
            // BTreeMap iterates in key order, so encoding is deterministic.
            for (key, value) in entries {
                encode_term(key, dst);
                encode_term(value, dst);
            }
        }
    }
}

pub fn term_to_bytes(term: &Term) -> Bytes {
    let mut buf = BytesMut::new();
    encode_term(term, &mut buf);
    buf.freeze()
}

/// Decodes exactly one term from the front of `bytes`, returning it along
/// with the unconsumed remainder.
pub fn decode_term(bytes: &[u8]) -> Result<(Term, &[u8]), DecodeError> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let term = decode_at(&mut cursor, 0)?;
    Ok((term, &bytes[cursor.pos..]))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n - available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }
}

fn decode_at(cursor: &mut Cursor<'_>, depth: usize) -> Result<Term, DecodeError> {
    if depth > MAX_TERM_DEPTH {
        return Err(DecodeError::TooDeep {
            offset: cursor.pos,
            max: MAX_TERM_DEPTH,
        });
    }

    let tag_offset = cursor.pos;
    let tag = cursor.u8()?;
    match tag {
        TAG_INTEGER => Ok(Term::Integer(cursor.u64()? as i64)),
        TAG_FLOAT => Ok(Term::Float(f64::from_bits(cursor.u64()?))),
        TAG_ATOM => {
            let len = cursor.u32()? as usize;
            let start = cursor.pos;
            let raw = cursor.take(len)?;
            let name = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?;
            Ok(Term::Atom(Atom::new(name)))
        }
        TAG_BINARY => {
            let len = cursor.u32()? as usize;
            Ok(Term::Binary(cursor.take(len)?.to_vec()))
        }
        TAG_STR => {
            let len = cursor.u32()? as usize;
            let start = cursor.pos;
            let raw = cursor.take(len)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidUtf8 { offset: start })?;
            Ok(Term::Str(text.to_string()))
        }
        TAG_TUPLE => {
            let count = cursor.u32()? as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_at(cursor, depth + 1)?);
            }
            Ok(Term::Tuple(elements))
        }
        TAG_LIST => {
            let count = cursor.u32()? as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(decode_at(cursor, depth + 1)?);
            }
            Ok(Term::List(elements))
        }
        TAG_MAP => {
            let count = cursor.u32()? as usize;
            let mut entries = std::collections::BTreeMap::new();
            for _ in 0..count {
                let key_offset = cursor.pos;
                let key = decode_at(cursor, depth + 1)?;
                let value = decode_at(cursor, depth + 1)?;
                if entries.insert(key, value).is_some() {
                    return Err(DecodeError::DuplicateMapKey { offset: key_offset });
                }
            }
            Ok(Term::Map(entries))
        }
        other => Err(DecodeError::UnknownTag {
            offset: tag_offset,
            tag: other,
        }),
    }
}

/// Codec framing bridge messages with a 4-byte length prefix.
///
/// Wraps `LengthDelimitedCodec` and adds the tagged-term serialization.
/// Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = WireMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let (term, rest) =
            decode_term(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if !rest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after message term", rest.len()),
            ));
        }
        let message = WireMessage::from_term(term)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(message))
    }
}

impl Encoder<WireMessage> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = term_to_bytes(&item.into_term());
        tracing::trace!(frame_len = payload.len(), "encoding frame");
        self.inner.encode(payload, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallId, CallOutcome};

    fn roundtrip(term: Term) {
        let bytes = term_to_bytes(&term);
        let (decoded, rest) = decode_term(&bytes).unwrap();
        assert_eq!(decoded, term);
        assert!(rest.is_empty());
    }

    #[test]
    fn roundtrips_scalars() {
        roundtrip(Term::int(0));
        roundtrip(Term::int(-1));
        roundtrip(Term::int(i64::MAX));
        roundtrip(Term::int(i64::MIN));
        roundtrip(Term::Float(1.5));
        roundtrip(Term::Float(f64::NAN));
        roundtrip(Term::Float(-0.0));
        roundtrip(Term::atom("ok"));
        roundtrip(Term::atom(""));
    }

    #[test]
    fn roundtrips_sequences() {
        roundtrip(Term::binary(vec![]));
        roundtrip(Term::binary(vec![0, 1, 0, 255]));
        roundtrip(Term::str(""));
        roundtrip(Term::str("héllo wörld"));
        roundtrip(Term::tuple([]));
        roundtrip(Term::list([]));
        roundtrip(Term::charlist("hello"));
    }

    #[test]
    fn roundtrips_nested_structures() {
        roundtrip(Term::tuple([
            Term::atom("reply"),
            Term::int(7),
            Term::tuple([
                Term::atom("ok"),
                Term::map([
                    (Term::atom("bytes"), Term::binary(vec![0u8; 32])),
                    (Term::str("k"), Term::list([Term::Float(2.25)])),
                ]),
            ]),
        ]));
    }

    #[test]
    fn decode_returns_remainder() {
        let mut buf = BytesMut::new();
        encode_term(&Term::int(1), &mut buf);
        buf.put_slice(b"tail");
        let (term, rest) = decode_term(&buf).unwrap();
        assert_eq!(term, Term::int(1));
        assert_eq!(rest, b"tail");
    }

    #[test]
    fn truncated_input_reports_offset() {
        let bytes = term_to_bytes(&Term::str("hello"));
        let err = decode_term(&bytes[..bytes.len() - 2]).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { offset: 5, needed: 2 });
    }

    #[test]
    fn empty_input_is_truncated() {
        let err = decode_term(&[]).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { offset: 0, needed: 1 });
    }

    #[test]
    fn unknown_tag_reports_offset_and_tag() {
        let mut buf = BytesMut::new();
        encode_term(&Term::list([Term::int(1)]), &mut buf);
        let inner_tag_offset = 1 + 4; // list tag + count
        buf[inner_tag_offset] = 0x7f;
        let err = decode_term(&buf).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownTag {
                offset: inner_tag_offset,
                tag: 0x7f
            }
        );
    }

    #[test]
    fn invalid_utf8_in_atom_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x03);
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xfe]);
        let err = decode_term(&buf).unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8 { offset: 5 });
    }

    #[test]
    fn duplicate_map_key_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x08);
        buf.put_u32(2);
        encode_term(&Term::atom("k"), &mut buf);
        encode_term(&Term::int(1), &mut buf);
        let dup_offset = buf.len();
        encode_term(&Term::atom("k"), &mut buf);
        encode_term(&Term::int(2), &mut buf);
        let err = decode_term(&buf).unwrap_err();
        assert_eq!(err, DecodeError::DuplicateMapKey { offset: dup_offset });
    }

    #[test]
    fn rejects_runaway_nesting() {
        let mut buf = BytesMut::new();
        for _ in 0..(MAX_TERM_DEPTH + 2) {
            buf.put_u8(0x07);
            buf.put_u32(1);
        }
        buf.put_u8(0x01);
        buf.put_u64(0);
        let err = decode_term(&buf).unwrap_err();
        assert!(matches!(err, DecodeError::TooDeep { .. }));
    }

    #[test]
    fn frame_codec_roundtrips_messages() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();

        let msg = WireMessage::Request {
            id: CallId::new(1),
            module: "tests".into(),
            function: "add".into(),
            args: vec![Term::int(2), Term::int(3)],
        };
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_buffers_partial_frames() {
        let mut codec = MessageCodec::default();
        let mut encoded = BytesMut::new();
        let msg = WireMessage::Response {
            id: CallId::new(9),
            outcome: CallOutcome::Ok(Term::int(42)),
        };
        codec.encode(msg.clone(), &mut encoded).unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() / 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&encoded[encoded.len() / 2..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn frame_codec_rejects_trailing_garbage() {
        let mut inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        let mut payload = BytesMut::new();
        encode_term(&Term::int(1), &mut payload);
        payload.put_slice(b"junk");
        inner.encode(payload.freeze(), &mut buf).unwrap();

        let mut codec = MessageCodec::default();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
