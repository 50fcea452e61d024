//! JSON-shaped textual codec.
//!
//! Differences from plain JSON:
//! - carriage returns are stripped from strings
//! - control and format-control code points are written as `\uXXXX`
//! - tagged objects are wrapped as `%{"constructor":..,"arguments":[..]}%`
//! - numbers never use exponent notation; floats always carry a `.`

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::codec::registry::TagRegistry;
use crate::codec::value::Value;
use crate::codec::{format_float, Codec, MAX_DEPTH};

const TAG_MARKER: char = '%';

#[derive(Debug, Clone)]
pub struct JsonCodec {
    registry: Arc<TagRegistry>,
}

impl JsonCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(Arc::new(TagRegistry::default()))
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        let mut out = String::new();
        write_value(&mut out, value);
        Some(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let text = std::str::from_utf8(bytes).ok()?;
        let mut reader = Reader {
            text,
            cursor: 0,
            depth: 0,
            registry: &self.registry,
        };
        let value = reader.value()?;
        reader.skip_whitespace();
        if reader.cursor != text.len() {
            return None;
        }
        Some(value)
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => match format_float(*f) {
            Some(text) => out.push_str(&text),
            None => out.push_str("null"),
        },
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Map(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
        Value::Tagged(tagged) => {
            out.push(TAG_MARKER);
            write_value(out, &tagged.to_envelope());
            out.push(TAG_MARKER);
        }
    }
}

/// Code points written as `\uXXXX` rather than raw.
fn needs_unicode_escape(c: char) -> bool {
    matches!(
        c as u32,
        0x0000..=0x001f
            | 0x007f..=0x009f
            | 0x00ad
            | 0x0600..=0x0604
            | 0x070f
            | 0x17b4
            | 0x17b5
            | 0x200c..=0x200f
            | 0x2028..=0x202f
            | 0x2060..=0x206f
            | 0xfeff
            | 0xfff0..=0xffff
    )
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\r' => {}
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{c}' => out.push_str("\\f"),
            c if needs_unicode_escape(c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Cursor-addressed recursive-descent reader.
struct Reader<'a> {
    text: &'a str,
    cursor: usize,
    depth: usize,
    registry: &'a TagRegistry,
}

impl<'a> Reader<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.cursor..]
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.cursor).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.peek() {
            self.cursor += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        self.skip_whitespace();
        if self.peek()? == byte {
            self.cursor += 1;
            Some(())
        } else {
            None
        }
    }

    fn literal(&mut self, word: &str, value: Value) -> Option<Value> {
        if self.rest().starts_with(word) {
            self.cursor += word.len();
            Some(value)
        } else {
            None
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_whitespace();
        match self.peek()? {
            b'n' => self.literal("null", Value::Null),
            b't' => self.literal("true", Value::Bool(true)),
            b'f' => self.literal("false", Value::Bool(false)),
            b'"' => self.string().map(Value::String),
            b'[' => self.nested(Self::array),
            b'{' => self.nested(Self::object),
            b'%' => self.nested(Self::tagged),
            b'-' | b'0'..=b'9' => self.number(),
            _ => None,
        }
    }

    /// Containers and tags past [`MAX_DEPTH`] fail the decode.
    fn nested(&mut self, read: fn(&mut Self) -> Option<Value>) -> Option<Value> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = read(self);
        self.depth -= 1;
        value
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.cursor;
        if self.peek() == Some(b'-') {
            self.cursor += 1;
        }
        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.cursor += 1,
                b'.' if !is_float => {
                    is_float = true;
                    self.cursor += 1;
                }
                _ => break,
            }
        }
        let token = &self.text[start..self.cursor];
        if is_float {
            token.parse::<f64>().ok().map(Value::Float)
        } else {
            match token.parse::<i64>() {
                Ok(i) => Some(Value::Int(i)),
                Err(_) => token.parse::<f64>().ok().map(Value::Float),
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        // opening quote
        self.cursor += 1;
        let mut out = String::new();
        loop {
            let rest = self.rest();
            let stop = rest.find(['"', '\\'])?;
            out.push_str(&rest[..stop]);
            self.cursor += stop;
            if self.peek()? == b'"' {
                self.cursor += 1;
                return Some(out);
            }
            self.cursor += 1;
            let escape = self.peek()?;
            self.cursor += 1;
            match escape {
                b'"' => out.push('"'),
                b'\\' => out.push('\\'),
                b'/' => out.push('/'),
                b'b' => out.push('\u{8}'),
                b'f' => out.push('\u{c}'),
                b'n' => out.push('\n'),
                b'r' => out.push('\r'),
                b't' => out.push('\t'),
                b'u' => out.push(self.unicode_escape()?),
                _ => return None,
            }
        }
    }

    fn hex4(&mut self) -> Option<u32> {
        let digits = self.text.get(self.cursor..self.cursor + 4)?;
        let code = u32::from_str_radix(digits, 16).ok()?;
        self.cursor += 4;
        Some(code)
    }

    fn unicode_escape(&mut self) -> Option<char> {
        let high = self.hex4()?;
        if (0xd800..0xdc00).contains(&high) {
            if !self.rest().starts_with("\\u") {
                return None;
            }
            self.cursor += 2;
            let low = self.hex4()?;
            if !(0xdc00..0xe000).contains(&low) {
                return None;
            }
            let code = 0x10000 + ((high - 0xd800) << 10) + (low - 0xdc00);
            return char::from_u32(code);
        }
        char::from_u32(high)
    }

    fn array(&mut self) -> Option<Value> {
        self.cursor += 1;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek()? == b']' {
            self.cursor += 1;
            return Some(Value::Array(items));
        }
        loop {
            items.push(self.value()?);
            self.skip_whitespace();
            match self.peek()? {
                b',' => self.cursor += 1,
                b']' => {
                    self.cursor += 1;
                    return Some(Value::Array(items));
                }
                _ => return None,
            }
        }
    }

    fn object(&mut self) -> Option<Value> {
        self.cursor += 1;
        let mut map = BTreeMap::new();
        self.skip_whitespace();
        if self.peek()? == b'}' {
            self.cursor += 1;
            return Some(Value::Map(map));
        }
        loop {
            self.skip_whitespace();
            if self.peek()? != b'"' {
                return None;
            }
            let key = self.string()?;
            self.expect(b':')?;
            let item = self.value()?;
            map.insert(key, item);
            self.skip_whitespace();
            match self.peek()? {
                b',' => self.cursor += 1,
                b'}' => {
                    self.cursor += 1;
                    return Some(Value::Map(map));
                }
                _ => return None,
            }
        }
    }

    fn tagged(&mut self) -> Option<Value> {
        self.cursor += 1;
        let envelope = self.value()?;
        self.expect(b'%')?;
        Some(self.registry.revive(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::registry::{Blob, Serializable};
    use serde_json::json;

    fn codec() -> JsonCodec {
        JsonCodec::default()
    }

    fn encode_str(value: &Value) -> String {
        String::from_utf8(codec().encode(value).expect("encode")).expect("utf8")
    }

    #[test]
    fn encodes_scalars() {
        assert_eq!(encode_str(&Value::Null), "null");
        assert_eq!(encode_str(&Value::Bool(true)), "true");
        assert_eq!(encode_str(&Value::Int(-42)), "-42");
        assert_eq!(encode_str(&Value::Float(2.0)), "2.0");
        assert_eq!(encode_str(&Value::Float(f64::INFINITY)), "null");
    }

    #[test]
    fn escapes_strings() {
        let value = Value::from("a\"b\\c\nd\te\r\u{200c}\u{1}");
        assert_eq!(encode_str(&value), "\"a\\\"b\\\\c\\nd\\te\\u200c\\u0001\"");
    }

    #[test]
    fn carriage_return_is_stripped_not_escaped() {
        let bytes = codec().encode(&Value::from("line\r\n")).expect("encode");
        assert_eq!(codec().decode(&bytes), Some(Value::from("line\n")));
    }

    #[test]
    fn round_trips_nested_tree() {
        let value = Value::from(json!({
            "list": [1, -2, 3.5, "four", null, false, {"five": []}],
            "unicode": "snow ☃ and 𝄞",
            "empty": {}
        }));
        let bytes = codec().encode(&value).expect("encode");
        assert_eq!(codec().decode(&bytes), Some(value));
    }

    #[test]
    fn decodes_whitespace_and_escapes() {
        let text = r#" { "a" : [ 1 , 2 ] , "b" : "xA\/𝄞" } "#.as_bytes();
        let value = codec().decode(text).expect("decode");
        assert_eq!(value.get("b").and_then(Value::as_str), Some("xA/𝄞"));
        assert_eq!(
            value.get("a"),
            Some(&Value::Array(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn tagged_object_uses_percent_marker() {
        let value = Blob(b"hi".to_vec()).to_value();
        let text = encode_str(&value);
        assert!(text.starts_with("%{"));
        assert!(text.ends_with("}%"));
        assert_eq!(codec().decode(text.as_bytes()), Some(value));
    }

    #[test]
    fn unknown_tag_decodes_to_null() {
        let text = br#"[%{"arguments":[],"constructor":"Unknown"}%]"#;
        assert_eq!(
            codec().decode(text),
            Some(Value::Array(vec![Value::Null]))
        );
    }

    #[test]
    fn rejects_exponent_and_garbage() {
        assert_eq!(codec().decode(b"1e5"), None);
        assert_eq!(codec().decode(b"[1,"), None);
        assert_eq!(codec().decode(b"{\"a\" 1}"), None);
        assert_eq!(codec().decode(b"nul"), None);
        assert_eq!(codec().decode(&[0xff, 0xfe]), None);
    }

    #[test]
    fn integer_overflow_falls_back_to_float() {
        assert_eq!(
            codec().decode(b"18446744073709551616"),
            Some(Value::Float(18446744073709551616.0))
        );
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("{}{}", "[".repeat(200_000), "]".repeat(200_000));
        assert_eq!(codec().decode(deep.as_bytes()), None);

        let tags = format!("{}null{}", "%".repeat(MAX_DEPTH + 1), "%".repeat(MAX_DEPTH + 1));
        assert_eq!(codec().decode(tags.as_bytes()), None);

        let limit = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert!(codec().decode(limit.as_bytes()).is_some());
    }
}
