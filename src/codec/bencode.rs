//! Bencode-style codec.
//!
//! ```text
//! null/false/true  nul | fal | tru
//! integer          i<digits>e
//! float            f<decimal>e
//! string           <byte length>:<raw bytes>
//! array            l<value>*e
//! map              d(<string><value>)*e   keys in byte order
//! tagged           s<map>e
//! ```
//!
//! Maps are always written in canonical key order, so two maps with the same
//! entries encode to identical bytes regardless of how they were built.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::registry::TagRegistry;
use crate::codec::value::Value;
use crate::codec::{format_float, Codec, MAX_DEPTH};

#[derive(Debug, Clone)]
pub struct BencodeCodec {
    registry: Arc<TagRegistry>,
}

impl BencodeCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for BencodeCodec {
    fn default() -> Self {
        Self::new(Arc::new(TagRegistry::default()))
    }
}

impl Codec for BencodeCodec {
    fn name(&self) -> &'static str {
        "bencode"
    }

    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        write_value(&mut out, value);
        Some(out)
    }

    fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let mut reader = Reader {
            bytes,
            cursor: 0,
            depth: 0,
            registry: &self.registry,
        };
        let value = reader.value()?;
        if reader.cursor != bytes.len() {
            return None;
        }
        Some(value)
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"nul"),
        Value::Bool(false) => out.extend_from_slice(b"fal"),
        Value::Bool(true) => out.extend_from_slice(b"tru"),
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Float(f) => match format_float(*f) {
            Some(text) => {
                out.push(b'f');
                out.extend_from_slice(text.as_bytes());
                out.push(b'e');
            }
            None => out.extend_from_slice(b"nul"),
        },
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'l');
            for item in items {
                write_value(out, item);
            }
            out.push(b'e');
        }
        Value::Map(map) => {
            // BTreeMap<String, _> iterates in byte order of the keys, which is
            // the canonical order.
            out.push(b'd');
            for (key, item) in map {
                write_string(out, key);
                write_value(out, item);
            }
            out.push(b'e');
        }
        Value::Tagged(tagged) => {
            out.push(b's');
            write_value(out, &tagged.to_envelope());
            out.push(b'e');
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
    depth: usize,
    registry: &'a TagRegistry,
}

impl<'a> Reader<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.cursor).copied()
    }

    fn atom(&mut self, word: &[u8], value: Value) -> Option<Value> {
        if self.bytes[self.cursor..].starts_with(word) {
            self.cursor += word.len();
            Some(value)
        } else {
            None
        }
    }

    /// Bytes up to (not including) the next `delimiter`; the cursor moves past it.
    fn until(&mut self, delimiter: u8) -> Option<&'a str> {
        let rest = &self.bytes[self.cursor..];
        let end = rest.iter().position(|&b| b == delimiter)?;
        let token = std::str::from_utf8(&rest[..end]).ok()?;
        self.cursor += end + 1;
        Some(token)
    }

    fn value(&mut self) -> Option<Value> {
        match self.peek()? {
            b'n' => self.atom(b"nul", Value::Null),
            b'f' if self.bytes[self.cursor..].starts_with(b"fal") => {
                self.atom(b"fal", Value::Bool(false))
            }
            b't' => self.atom(b"tru", Value::Bool(true)),
            b'i' => {
                self.cursor += 1;
                self.until(b'e')?.parse::<i64>().ok().map(Value::Int)
            }
            b'f' => {
                self.cursor += 1;
                let token = self.until(b'e')?;
                if !token.contains('.') {
                    return None;
                }
                token.parse::<f64>().ok().map(Value::Float)
            }
            b'0'..=b'9' => self.string().map(Value::String),
            b'l' | b'd' | b's' => self.container(),
            _ => None,
        }
    }

    /// Lists, dictionaries and tags; nesting past [`MAX_DEPTH`] fails.
    fn container(&mut self) -> Option<Value> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = match self.peek()? {
            b'l' => {
                self.cursor += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.cursor += 1;
                Some(Value::Array(items))
            }
            b'd' => {
                self.cursor += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.string()?;
                    let item = self.value()?;
                    map.insert(key, item);
                }
                self.cursor += 1;
                Some(Value::Map(map))
            }
            b's' => {
                self.cursor += 1;
                let envelope = self.value()?;
                if self.peek()? != b'e' {
                    return None;
                }
                self.cursor += 1;
                Some(self.registry.revive(envelope))
            }
            _ => None,
        };
        self.depth -= 1;
        value
    }

    fn string(&mut self) -> Option<String> {
        let len: usize = self.until(b':')?.parse().ok()?;
        let end = self.cursor.checked_add(len)?;
        let raw = self.bytes.get(self.cursor..end)?;
        self.cursor = end;
        String::from_utf8(raw.to_vec()).ok()
    }
}
