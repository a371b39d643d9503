use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use clap::ValueEnum;

use crate::value::{self, get_byte, get_line, get_payload, parse_int, Value};

/// One decoded request: the uppercased command name plus its arguments.
#[derive(Debug, PartialEq)]
pub struct Request {
    pub name: String,
    pub args: Vec<Value>,
}

/// A request framing. The three codecs only differ in how they decode a
/// request off the wire; replies use the shared tagged-scalar encoding, so
/// the dispatcher never needs to know which codec a connection speaks.
pub trait Codec: Send + Sync {
    fn decode(&self, src: &mut Cursor<&[u8]>) -> Result<Request, value::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CodecKind {
    /// Requests are arrays of length-prefixed byte payloads.
    Bulk,
    /// Requests are single CR LF lines split on spaces.
    Line,
    /// Requests are arrays of tagged scalars carrying their type.
    Typed,
}

impl CodecKind {
    pub fn codec(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Bulk => Arc::new(BulkCodec),
            CodecKind::Line => Arc::new(LineCodec),
            CodecKind::Typed => Arc::new(TypedCodec),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Bulk => write!(f, "bulk"),
            CodecKind::Line => write!(f, "line"),
            CodecKind::Typed => write!(f, "typed"),
        }
    }
}

/// Every request is a top-level `*` array whose elements are `$` payloads;
/// the first payload is the command name, the rest are raw byte arguments.
pub struct BulkCodec;

impl Codec for BulkCodec {
    fn decode(&self, src: &mut Cursor<&[u8]>) -> Result<Request, value::Error> {
        let line = get_line(src)?;
        if line.len() < 2 || line[0] != b'*' {
            return Err(value::Error::InvalidRequest);
        }

        let count = parse_int(&line[1..])?;
        if count < 0 {
            return Err(value::Error::InvalidRequest);
        }

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if get_byte(src)? != b'$' {
                return Err(value::Error::InvalidRequest);
            }
            match get_payload(src)? {
                Some(data) => values.push(Value::Bulk(data)),
                None => values.push(Value::Null),
            }
        }

        request_from(values)
    }
}

/// Every request is one CR LF-terminated line; splitting on ASCII space
/// yields the command name and raw byte arguments. No nesting, no null.
pub struct LineCodec;

impl Codec for LineCodec {
    fn decode(&self, src: &mut Cursor<&[u8]>) -> Result<Request, value::Error> {
        let line = get_line(src)?;
        if line.len() < 2 {
            return Err(value::Error::InvalidRequest);
        }

        let values = line
            .split(|b| *b == b' ')
            .map(|part| Value::Bulk(Bytes::copy_from_slice(part)))
            .collect();

        request_from(values)
    }
}

/// Every request is a top-level `*` array of arbitrary tagged scalars, so
/// arguments arrive carrying their parsed type, including nested arrays and
/// `~json` structures.
pub struct TypedCodec;

impl Codec for TypedCodec {
    fn decode(&self, src: &mut Cursor<&[u8]>) -> Result<Request, value::Error> {
        let line = get_line(src)?;
        if line.len() < 2 || line[0] != b'*' {
            return Err(value::Error::InvalidRequest);
        }

        let count = parse_int(&line[1..])?;
        if count < 0 {
            return Err(value::Error::InvalidRequest);
        }

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(Value::parse(src)?);
        }

        request_from(values)
    }
}

fn request_from(mut values: Vec<Value>) -> Result<Request, value::Error> {
    if values.is_empty() {
        // An empty request dispatches as an unknown command.
        return Ok(Request {
            name: String::new(),
            args: values,
        });
    }

    let name = match values.remove(0) {
        Value::Simple(s) => s.to_uppercase(),
        Value::Bulk(bytes) => String::from_utf8_lossy(&bytes).to_uppercase(),
        _ => return Err(value::Error::InvalidRequest),
    };

    Ok(Request { name, args: values })
}
