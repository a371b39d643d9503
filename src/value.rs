use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use std::borrow::Cow;
use std::io::Cursor;
use std::string::FromUtf8Error;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire value")]
    Incomplete,
    #[error("bad response line format")]
    BadLineFormat,
    #[error("bad bulk string format")]
    BadBulkFormat,
    #[error("invalid request protocol")]
    InvalidRequest,
    #[error("{0}")]
    Other(crate::Error),
}

/// A single tagged value on the wire. Every variant maps to exactly one
/// leading tag byte; requests and replies are built out of these.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Simple(String),
    Error(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Byte(u8),
    Bulk(Bytes),
    Null,
    Array(Vec<Value>),
    Json(serde_json::Value),
}

impl Value {
    /// Parses one value off the cursor. `Error::Incomplete` means the buffer
    /// does not hold a full value yet and the caller should read more bytes.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        let first_byte = get_byte(src)?;
        let tag = Tag::try_from(first_byte)?;

        match tag {
            Tag::Simple => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Value::Simple(string))
            }
            Tag::Error => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                // The writer prepends the "ERR " marker; strip it back off so
                // encode/decode round-trips on the message itself.
                let message = string.strip_prefix("ERR ").unwrap_or(&string).to_string();
                Ok(Value::Error(message))
            }
            Tag::Integer => {
                let line = get_line(src)?;
                Ok(Value::Int(parse_int(line)?))
            }
            Tag::Float => {
                let line = get_line(src)?;
                Ok(Value::Float(parse_float(line)?))
            }
            Tag::Bool => {
                let line = get_line(src)?;
                // Only the first byte matters; an empty payload reads false.
                Ok(Value::Bool(line.first() == Some(&b'1')))
            }
            Tag::Byte => {
                let line = get_line(src)?;
                match line.first() {
                    Some(b) => Ok(Value::Byte(*b)),
                    None => Err(Error::InvalidRequest),
                }
            }
            // $<length>\r\n<data>\r\n, with length -1 denoting null
            Tag::Bulk => match get_payload(src)? {
                Some(data) => Ok(Value::Bulk(data)),
                None => Ok(Value::Null),
            },
            // *<count>\r\n<element-1>...<element-n>
            Tag::Array => {
                let line = get_line(src)?;
                let count = parse_int(line)?;
                if count < 0 {
                    return Ok(Value::Null);
                }

                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    values.push(Self::parse(src)?);
                }
                Ok(Value::Array(values))
            }
            // ~<structure>\r\n followed by a $ payload of the serialized form
            Tag::Structure => {
                let name = get_line(src)?.to_vec();
                if name != b"json" {
                    return Err(Error::InvalidRequest);
                }

                let payload = match get_payload(src)? {
                    Some(data) => data,
                    None => return Err(Error::InvalidRequest),
                };
                let json = serde_json::from_slice(&payload)
                    .map_err(|e| Error::Other(Box::new(e)))?;
                Ok(Value::Json(json))
            }
        }
    }

    /// Appends the wire encoding of this value to the buffer.
    pub fn write_to(&self, dst: &mut BytesMut) {
        match self {
            Value::Simple(s) => write_line(dst, Tag::Simple, s.as_bytes()),
            Value::Error(s) => {
                dst.extend_from_slice(b"-ERR ");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            Value::Int(i) => write_line(dst, Tag::Integer, i.to_string().as_bytes()),
            Value::Float(f) => write_line(dst, Tag::Float, f.to_string().as_bytes()),
            Value::Bool(b) => {
                let payload: &[u8] = if *b { b"1" } else { b"0" };
                write_line(dst, Tag::Bool, payload);
            }
            Value::Byte(b) => write_line(dst, Tag::Byte, &[*b]),
            Value::Bulk(bytes) => write_payload(dst, bytes),
            Value::Null => write_line(dst, Tag::Bulk, b"-1"),
            Value::Array(values) => {
                write_line(dst, Tag::Array, values.len().to_string().as_bytes());
                for value in values {
                    value.write_to(dst);
                }
            }
            Value::Json(json) => {
                write_line(dst, Tag::Structure, b"json");
                // Serialization of an in-memory serde_json::Value cannot fail.
                let payload = serde_json::to_vec(json).unwrap_or_default();
                write_payload(dst, &payload);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// String view of the value, for arguments that are keys or topic names.
    pub fn as_str(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Simple(s) => Some(Cow::Borrowed(s)),
            Value::Bulk(bytes) => Some(String::from_utf8_lossy(bytes)),
            Value::Int(i) => Some(Cow::Owned(i.to_string())),
            Value::Float(f) => Some(Cow::Owned(f.to_string())),
            _ => None,
        }
    }

    /// Raw byte view of the value, used when fanning arguments back out as
    /// bulk payloads.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Value::Bulk(bytes) => Some(bytes.clone()),
            Value::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            Value::Int(i) => Some(Bytes::from(i.to_string())),
            Value::Float(f) => Some(Bytes::from(f.to_string())),
            Value::Bool(b) => Some(Bytes::from_static(if *b { b"1" } else { b"0" })),
            Value::Byte(b) => Some(Bytes::copy_from_slice(&[*b])),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Byte(b) => Some(*b as i64),
            Value::Simple(s) => s.parse().ok(),
            Value::Bulk(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Simple(s) => s.parse().ok(),
            Value::Bulk(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Simple(s) => write!(f, "+{}", s),
            Value::Error(s) => write!(f, "-ERR {}", s),
            Value::Int(i) => write!(f, ":{}", i),
            Value::Float(x) => write!(f, ".{}", x),
            Value::Bool(b) => write!(f, "?{}", if *b { 1 } else { 0 }),
            Value::Byte(b) => write!(f, "&{}", b),
            Value::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Value::Null => write!(f, "$-1"),
            Value::Array(values) => {
                write!(f, "*{}", values.len())?;
                for value in values {
                    write!(f, " {}", value)?;
                }
                Ok(())
            }
            Value::Json(json) => write!(f, "~json {}", json),
        }
    }
}

fn write_line(dst: &mut BytesMut, tag: Tag, payload: &[u8]) {
    dst.extend_from_slice(&[u8::from(tag)]);
    dst.extend_from_slice(payload);
    dst.extend_from_slice(CRLF);
}

pub(crate) fn write_payload(dst: &mut BytesMut, payload: &[u8]) {
    write_line(dst, Tag::Bulk, payload.len().to_string().as_bytes());
    dst.extend_from_slice(payload);
    dst.extend_from_slice(CRLF);
}

/// Reads a `$<length>\r\n<bytes>\r\n` payload, assuming the `$` tag byte has
/// already been consumed. A `-1` length yields `None`.
pub(crate) fn get_payload(src: &mut Cursor<&[u8]>) -> Result<Option<Bytes>, Error> {
    let line = get_line(src)?;
    let length = parse_int(line)?;
    if length < 0 {
        return Ok(None);
    }

    let length = length as usize;
    if src.remaining() < length {
        return Err(Error::Incomplete);
    }

    let start = src.position() as usize;
    let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
    src.set_position((start + length) as u64);

    // The payload must be followed by an empty line.
    let trailer = get_line(src)?;
    if !trailer.is_empty() {
        return Err(Error::BadBulkFormat);
    }

    Ok(Some(data))
}

/// Returns the bytes up to the next CR LF, excluding the terminator, and
/// advances the cursor past it.
pub(crate) fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)
        .map(|index| start + index)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

pub(crate) fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// An empty payload parses as zero.
pub(crate) fn parse_int(b: &[u8]) -> Result<i64, Error> {
    if b.is_empty() {
        return Ok(0);
    }
    let s = std::str::from_utf8(b).map_err(|_| Error::InvalidRequest)?;
    s.parse::<i64>()
        .map_err(|e| -> crate::Error { Box::new(e) })
        .map_err(Error::Other)
}

fn parse_float(b: &[u8]) -> Result<f64, Error> {
    if b.is_empty() {
        return Ok(0.0);
    }
    let s = std::str::from_utf8(b).map_err(|_| Error::InvalidRequest)?;
    s.parse::<f64>()
        .map_err(|e| -> crate::Error { Box::new(e) })
        .map_err(Error::Other)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Tag {
    Simple,    // '+'
    Error,     // '-'
    Integer,   // ':'
    Float,     // '.'
    Bool,      // '?'
    Byte,      // '&'
    Bulk,      // '$'
    Array,     // '*'
    Structure, // '~'
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        match byte {
            b'+' => Ok(Self::Simple),
            b'-' => Ok(Self::Error),
            b':' => Ok(Self::Integer),
            b'.' => Ok(Self::Float),
            b'?' => Ok(Self::Bool),
            b'&' => Ok(Self::Byte),
            b'$' => Ok(Self::Bulk),
            b'*' => Ok(Self::Array),
            b'~' => Ok(Self::Structure),
            _ => Err(Error::InvalidRequest),
        }
    }
}

impl From<Tag> for u8 {
    fn from(tag: Tag) -> Self {
        match tag {
            Tag::Simple => b'+',
            Tag::Error => b'-',
            Tag::Integer => b':',
            Tag::Float => b'.',
            Tag::Bool => b'?',
            Tag::Byte => b'&',
            Tag::Bulk => b'$',
            Tag::Array => b'*',
            Tag::Structure => b'~',
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(_src: FromUtf8Error) -> Error {
        "protocol error; invalid value format".into()
    }
}

impl From<&str> for Error {
    fn from(src: &str) -> Error {
        src.to_string().into()
    }
}

impl From<String> for Error {
    fn from(src: String) -> Error {
        Error::Other(src.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Result<Value, Error> {
        let mut cursor = Cursor::new(data);
        Value::parse(&mut cursor)
    }

    #[test]
    fn parse_simple_string() {
        let value = parse(b"+OK\r\n");
        assert!(matches!(value, Ok(Value::Simple(ref s)) if s == "OK"));
    }

    #[test]
    fn parse_error_strips_marker() {
        let value = parse(b"-ERR invalid command format\r\n");
        assert!(matches!(
            value,
            Ok(Value::Error(ref s)) if s == "invalid command format"
        ));
    }

    #[test]
    fn parse_error_without_marker() {
        let value = parse(b"-something broke\r\n");
        assert!(matches!(value, Ok(Value::Error(ref s)) if s == "something broke"));
    }

    #[test]
    fn parse_integer() {
        assert!(matches!(parse(b":1000\r\n"), Ok(Value::Int(1000))));
        assert!(matches!(parse(b":-42\r\n"), Ok(Value::Int(-42))));
    }

    #[test]
    fn parse_integer_empty_payload_is_zero() {
        assert!(matches!(parse(b":\r\n"), Ok(Value::Int(0))));
    }

    #[test]
    fn parse_float() {
        assert!(matches!(parse(b".3.14\r\n"), Ok(Value::Float(f)) if f == 3.14));
        assert!(matches!(parse(b".\r\n"), Ok(Value::Float(f)) if f == 0.0));
    }

    #[test]
    fn parse_bool_first_byte_only() {
        assert!(matches!(parse(b"?1\r\n"), Ok(Value::Bool(true))));
        assert!(matches!(parse(b"?0\r\n"), Ok(Value::Bool(false))));
        assert!(matches!(parse(b"?10\r\n"), Ok(Value::Bool(true))));
        assert!(matches!(parse(b"?\r\n"), Ok(Value::Bool(false))));
    }

    #[test]
    fn parse_byte() {
        assert!(matches!(parse(b"&x\r\n"), Ok(Value::Byte(b'x'))));
        assert!(matches!(parse(b"&\r\n"), Err(Error::InvalidRequest)));
    }

    #[test]
    fn parse_bulk() {
        let value = parse(b"$6\r\nfoobar\r\n");
        assert!(matches!(value, Ok(Value::Bulk(ref b)) if b == &Bytes::from("foobar")));
    }

    #[test]
    fn parse_bulk_empty() {
        let value = parse(b"$0\r\n\r\n");
        assert!(matches!(value, Ok(Value::Bulk(ref b)) if b.is_empty()));
    }

    #[test]
    fn parse_bulk_null() {
        assert!(matches!(parse(b"$-1\r\n"), Ok(Value::Null)));
    }

    #[test]
    fn parse_bulk_bad_trailer() {
        let value = parse(b"$3\r\nfooEXTRA\r\n");
        assert!(matches!(value, Err(Error::BadBulkFormat)));
    }

    #[test]
    fn parse_array() {
        let value = parse(b"*2\r\n$5\r\nhello\r\n:7\r\n");
        assert_eq!(
            value.unwrap(),
            Value::Array(vec![Value::Bulk(Bytes::from("hello")), Value::Int(7)])
        );
    }

    #[test]
    fn parse_array_nested() {
        let value = parse(b"*2\r\n*2\r\n:1\r\n:2\r\n+ok\r\n");
        assert_eq!(
            value.unwrap(),
            Value::Array(vec![
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
                Value::Simple("ok".to_string()),
            ])
        );
    }

    #[test]
    fn parse_array_negative_count_is_null() {
        assert!(matches!(parse(b"*-1\r\n"), Ok(Value::Null)));
    }

    #[test]
    fn parse_json_structure() {
        // A short length leaves bytes on the trailer line.
        let value = parse(b"~json\r\n$14\r\n{\"answer\":42.5}\r\n");
        assert!(matches!(value, Err(Error::BadBulkFormat)));

        let value = parse(b"~json\r\n$15\r\n{\"answer\":42.5}\r\n").unwrap();
        assert_eq!(value, Value::Json(serde_json::json!({"answer": 42.5})));
    }

    #[test]
    fn parse_unknown_structure() {
        assert!(matches!(
            parse(b"~xml\r\n$4\r\n<a/>\r\n"),
            Err(Error::InvalidRequest)
        ));
    }

    #[test]
    fn parse_unknown_tag() {
        assert!(matches!(parse(b"%2\r\n"), Err(Error::InvalidRequest)));
    }

    #[test]
    fn parse_incomplete() {
        assert!(matches!(parse(b""), Err(Error::Incomplete)));
        assert!(matches!(parse(b"+OK"), Err(Error::Incomplete)));
        assert!(matches!(parse(b"$5\r\nhel"), Err(Error::Incomplete)));
        assert!(matches!(parse(b"*2\r\n:1\r\n"), Err(Error::Incomplete)));
    }

    #[test]
    fn round_trip_scalars() {
        let values = vec![
            Value::Simple("PONG".to_string()),
            Value::Error("invalid command format".to_string()),
            Value::Int(-93),
            Value::Float(1.25),
            Value::Bool(true),
            Value::Bool(false),
            Value::Byte(b'z'),
            Value::Bulk(Bytes::from("hello world")),
            Value::Null,
            Value::Json(serde_json::json!({"clients": 3, "ok": true})),
        ];

        for value in values {
            let encoded = value.to_vec();
            let decoded = parse(&encoded).unwrap();
            assert_eq!(decoded, value, "round-trip failed for {:?}", value);
        }
    }

    #[test]
    fn round_trip_array() {
        let value = Value::Array(vec![
            Value::Bulk(Bytes::from("SET")),
            Value::Int(10),
            Value::Array(vec![Value::Float(0.5), Value::Null]),
        ]);

        let encoded = value.to_vec();
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn bulk_wire_layout() {
        let value = Value::Array(vec![
            Value::Bulk(Bytes::from("SUM")),
            Value::Bulk(Bytes::from("10")),
            Value::Bulk(Bytes::from("20")),
        ]);
        assert_eq!(value.to_vec(), b"*3\r\n$3\r\nSUM\r\n$2\r\n10\r\n$2\r\n20\r\n");
    }
}
