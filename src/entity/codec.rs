//! Self-describing binary encoding for attributes and entities.
//!
//! Wire shape per attribute: `[id string][tag u8][payload]`. Strings are
//! u32-LE length-prefixed UTF-8; numbers are little-endian; time is epoch
//! milliseconds (i64); a component payload is a recursively encoded
//! attribute list. The tag numbering is part of the wire contract.

use chrono::DateTime;

use crate::entity::{Attr, Entity, Id, Value};
use crate::error::{Error, Result};

/* ============================= TAGS ============================= */

pub const TAG_STRING: u8 = 1;
pub const TAG_BOOL: u8 = 2;
pub const TAG_INT64: u8 = 3;
pub const TAG_FLOAT: u8 = 4;
pub const TAG_BYTES: u8 = 5;
pub const TAG_TIME: u8 = 6;
pub const TAG_KEYWORD: u8 = 7;
pub const TAG_LABEL: u8 = 8;
pub const TAG_ID: u8 = 9;
pub const TAG_COMPONENT: u8 = 10;
pub const TAG_ENUM: u8 = 11;

/* ============================= ENCODE ============================= */

fn put_u32(buf: &mut Vec<u8>, n: u32) {
    buf.extend_from_slice(&n.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

/// Encode is total: every representable value has a wire form.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::String(s) => {
            buf.push(TAG_STRING);
            put_str(buf, s);
        }
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*b));
        }
        Value::Int64(n) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(x) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&x.to_bits().to_le_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            put_bytes(buf, b);
        }
        Value::Time(t) => {
            buf.push(TAG_TIME);
            buf.extend_from_slice(&t.timestamp_millis().to_le_bytes());
        }
        Value::Keyword(k) => {
            buf.push(TAG_KEYWORD);
            put_str(buf, k);
        }
        Value::Label { key, value } => {
            buf.push(TAG_LABEL);
            put_str(buf, key);
            put_str(buf, value);
        }
        Value::Ref(id) => {
            buf.push(TAG_ID);
            put_str(buf, id.as_str());
        }
        Value::Component(attrs) => {
            buf.push(TAG_COMPONENT);
            let inner = encode_attrs(attrs);
            put_bytes(buf, &inner);
        }
        Value::Enum(id) => {
            buf.push(TAG_ENUM);
            put_str(buf, id.as_str());
        }
    }
}

pub fn encode_attrs(attrs: &[Attr]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, attrs.len() as u32);
    for attr in attrs {
        put_str(&mut buf, attr.id.as_str());
        encode_value(&mut buf, &attr.value);
    }
    buf
}

pub fn encode_entity(entity: &Entity) -> Vec<u8> {
    encode_attrs(entity.attrs())
}

/// Canonical byte form of a single value, used as the index-key portion of
/// `(attr-id, value)` selectors. Equal values encode identically.
pub fn value_key(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value);
    buf
}

/* ============================= DECODE ============================= */

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Malformed(format!(
                "truncated input: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn str(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Malformed(format!("invalid utf-8 string: {e}")))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn decode_value(r: &mut Reader<'_>) -> Result<Value> {
    let tag = r.u8()?;
    let value = match tag {
        TAG_STRING => Value::String(r.str()?),
        TAG_BOOL => Value::Bool(r.u8()? != 0),
        TAG_INT64 => Value::Int64(r.i64()?),
        TAG_FLOAT => Value::Float(f64::from_bits(r.i64()? as u64)),
        TAG_BYTES => Value::Bytes(r.bytes()?),
        TAG_TIME => {
            let millis = r.i64()?;
            let t = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| Error::Malformed(format!("time out of range: {millis}")))?;
            Value::Time(t)
        }
        TAG_KEYWORD => Value::Keyword(r.str()?),
        TAG_LABEL => Value::Label {
            key: r.str()?,
            value: r.str()?,
        },
        TAG_ID => Value::Ref(Id::new(&r.str()?)),
        TAG_COMPONENT => {
            let inner = r.bytes()?;
            Value::Component(decode_attrs(&inner)?)
        }
        TAG_ENUM => Value::Enum(Id::new(&r.str()?)),
        other => return Err(Error::Malformed(format!("unknown value tag {other}"))),
    };
    Ok(value)
}

pub fn decode_attrs(buf: &[u8]) -> Result<Vec<Attr>> {
    let mut r = Reader::new(buf);
    let count = r.u32()? as usize;
    let mut attrs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let id = Id::new(&r.str()?);
        let value = decode_value(&mut r)?;
        attrs.push(Attr::new(id, value));
    }
    if !r.done() {
        return Err(Error::Malformed(format!(
            "{} trailing bytes after attribute list",
            buf.len() - r.pos
        )));
    }
    Ok(attrs)
}

pub fn decode_entity(buf: &[u8]) -> Result<Entity> {
    Ok(Entity::from_attrs(decode_attrs(buf)?))
}

/* ============================= TESTS ============================= */
