//! BITON: a dense bit-packed encoding of the value tree.
//!
//! # Wire Layout
//! ```text
//! value := type:3 body
//!   0 null/bool/EOS  qualifier:2 (0 = EOS, 1 = null, 2 = false, 3 = true)
//!   1 integer        sign:1 class:4 magnitude:bucket[class]
//!   2 float          sign:1 shift:4 class:4 magnitude:bucket[class]
//!   3 string         len:5 [len:8|16|32 when 29|30|31] <align> raw bytes
//!   4 array          (0:3 value)* 7:3
//!   5 map            (0:3 string value)* 7:3
//!   6 tagged         map {constructor, arguments}
//! stream := value 0:3 0:2 <align>
//! ```
//!
//! Magnitude class 8 means the magnitude did not fit 28 bits and follows as a
//! decimal string value instead.
//!
//! # Design Decisions
//! - Floats are scaled by up to 10^8 and rounded; precision beyond eight
//!   decimal places is lost by design of the format
//! - Collections are terminated, never counted
//! - Non-finite floats encode as null

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::bits::{BitReader, BitWriter};
use crate::codec::registry::TagRegistry;
use crate::codec::value::Value;
use crate::codec::{Codec, MAX_DEPTH};

const TYPE_ATOM: u64 = 0;
const TYPE_INT: u64 = 1;
const TYPE_FLOAT: u64 = 2;
const TYPE_STRING: u64 = 3;
const TYPE_ARRAY: u64 = 4;
const TYPE_MAP: u64 = 5;
const TYPE_TAGGED: u64 = 6;
const TYPE_END: u64 = 7;

const ATOM_EOS: u64 = 0;
const ATOM_NULL: u64 = 1;
const ATOM_FALSE: u64 = 2;
const ATOM_TRUE: u64 = 3;

/// Bit widths selected by magnitude classes 0..=7.
const BUCKETS: [u8; 8] = [1, 4, 8, 12, 16, 20, 24, 28];
const CLASS_DECIMAL: u64 = 8;

const MAX_SHIFT: u32 = 8;

const LEN_DIRECT_MAX: usize = 28;
const LEN_8: u64 = 29;
const LEN_16: u64 = 30;
const LEN_32: u64 = 31;

#[derive(Debug, Clone)]
pub struct BitonCodec {
    registry: Arc<TagRegistry>,
}

impl BitonCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for BitonCodec {
    fn default() -> Self {
        Self::new(Arc::new(TagRegistry::default()))
    }
}

impl Codec for BitonCodec {
    fn name(&self) -> &'static str {
        "biton"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, value: &Value) -> Option<Vec<u8>> {
        let mut writer = BitWriter::new();
        encode_value(&mut writer, value)?;
        writer.write(TYPE_ATOM, 3);
        writer.write(ATOM_EOS, 2);
        Some(writer.finish())
    }

    fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let mut reader = BitReader::new(bytes);
        let value = decode_value(&mut reader, &self.registry, 0)?;
        if reader.read(3)? != TYPE_ATOM || reader.read(2)? != ATOM_EOS {
            return None;
        }
        reader.at_padding().then_some(value)
    }
}

fn magnitude_class(magnitude: u64) -> u64 {
    BUCKETS
        .iter()
        .position(|&bits| magnitude < (1u64 << bits))
        .map_or(CLASS_DECIMAL, |class| class as u64)
}

fn encode_value(writer: &mut BitWriter, value: &Value) -> Option<()> {
    match value {
        Value::Null => {
            writer.write(TYPE_ATOM, 3);
            writer.write(ATOM_NULL, 2);
        }
        Value::Bool(b) => {
            writer.write(TYPE_ATOM, 3);
            writer.write(if *b { ATOM_TRUE } else { ATOM_FALSE }, 2);
        }
        Value::Int(i) => {
            writer.write(TYPE_INT, 3);
            writer.write(u64::from(*i < 0), 1);
            let magnitude = i.unsigned_abs();
            let class = magnitude_class(magnitude);
            writer.write(class, 4);
            if class == CLASS_DECIMAL {
                encode_string(writer, &magnitude.to_string());
            } else {
                writer.write(magnitude, BUCKETS[class as usize]);
            }
        }
        Value::Float(f) => {
            if !f.is_finite() {
                return encode_value(writer, &Value::Null);
            }
            writer.write(TYPE_FLOAT, 3);
            writer.write(u64::from(f.is_sign_negative()), 1);
            let (shift, scaled) = scale_float(f.abs());
            writer.write(u64::from(shift), 4);
            // `scaled` is integral; the cast saturates only above u64::MAX,
            // which always lands in the decimal class anyway.
            let magnitude = scaled as u64;
            let class = if scaled >= (1u64 << 28) as f64 {
                CLASS_DECIMAL
            } else {
                magnitude_class(magnitude)
            };
            writer.write(class, 4);
            if class == CLASS_DECIMAL {
                encode_string(writer, &scaled.to_string());
            } else {
                writer.write(magnitude, BUCKETS[class as usize]);
            }
        }
        Value::String(s) => encode_string(writer, s),
        Value::Array(items) => {
            writer.write(TYPE_ARRAY, 3);
            for item in items {
                writer.write(0, 3);
                encode_value(writer, item)?;
            }
            writer.write(TYPE_END, 3);
        }
        Value::Map(map) => {
            writer.write(TYPE_MAP, 3);
            for (key, item) in map {
                writer.write(0, 3);
                encode_string(writer, key);
                encode_value(writer, item)?;
            }
            writer.write(TYPE_END, 3);
        }
        Value::Tagged(tagged) => {
            writer.write(TYPE_TAGGED, 3);
            encode_value(writer, &tagged.to_envelope())?;
        }
    }
    Some(())
}

/// Pick the decimal shift (0..=8) and the rounded, scaled magnitude.
fn scale_float(abs: f64) -> (u32, f64) {
    let text = abs.to_string();
    let decimals = text
        .split_once('.')
        .map_or(0, |(_, fraction)| fraction.len() as u32);
    let shift = decimals.min(MAX_SHIFT);
    let scaled = (abs * 10f64.powi(shift as i32)).round();
    (shift, scaled)
}

fn encode_string(writer: &mut BitWriter, s: &str) {
    writer.write(TYPE_STRING, 3);
    let raw = s.as_bytes();
    let len = raw.len();
    if len <= LEN_DIRECT_MAX {
        writer.write(len as u64, 5);
    } else if len <= 0xff {
        writer.write(LEN_8, 5);
        writer.write(len as u64, 8);
    } else if len <= 0xffff {
        writer.write(LEN_16, 5);
        writer.write(len as u64, 16);
    } else {
        writer.write(LEN_32, 5);
        writer.write(len as u64, 32);
    }
    writer.write_bytes(raw);
}

/// `depth` counts the arrays, maps and tags enclosing this value.
fn decode_value(reader: &mut BitReader<'_>, registry: &TagRegistry, depth: usize) -> Option<Value> {
    let kind = reader.read(3)?;
    if matches!(kind, TYPE_ARRAY | TYPE_MAP | TYPE_TAGGED) && depth >= MAX_DEPTH {
        return None;
    }
    match kind {
        TYPE_ATOM => match reader.read(2)? {
            ATOM_NULL => Some(Value::Null),
            ATOM_FALSE => Some(Value::Bool(false)),
            ATOM_TRUE => Some(Value::Bool(true)),
            // EOS where a value was expected
            _ => None,
        },
        TYPE_INT => {
            let negative = reader.read(1)? == 1;
            let magnitude = match decode_magnitude(reader)? {
                Magnitude::Bits(m) => m,
                Magnitude::Decimal(text) => text.parse::<u64>().ok()?,
            };
            let signed = if negative {
                -i128::from(magnitude)
            } else {
                i128::from(magnitude)
            };
            i64::try_from(signed).ok().map(Value::Int)
        }
        TYPE_FLOAT => {
            let negative = reader.read(1)? == 1;
            let shift = reader.read(4)? as i32;
            if shift > MAX_SHIFT as i32 {
                return None;
            }
            let magnitude = match decode_magnitude(reader)? {
                Magnitude::Bits(m) => m as f64,
                Magnitude::Decimal(text) => text.parse::<f64>().ok()?,
            };
            let abs = magnitude / 10f64.powi(shift);
            Some(Value::Float(if negative { -abs } else { abs }))
        }
        TYPE_STRING => decode_string_body(reader).map(Value::String),
        TYPE_ARRAY => {
            let mut items = Vec::new();
            loop {
                match reader.read(3)? {
                    0 => items.push(decode_value(reader, registry, depth + 1)?),
                    TYPE_END => return Some(Value::Array(items)),
                    _ => return None,
                }
            }
        }
        TYPE_MAP => {
            let mut map = BTreeMap::new();
            loop {
                match reader.read(3)? {
                    0 => {
                        if reader.read(3)? != TYPE_STRING {
                            return None;
                        }
                        let key = decode_string_body(reader)?;
                        let item = decode_value(reader, registry, depth + 1)?;
                        map.insert(key, item);
                    }
                    TYPE_END => return Some(Value::Map(map)),
                    _ => return None,
                }
            }
        }
        TYPE_TAGGED => {
            let envelope = decode_value(reader, registry, depth + 1)?;
            Some(registry.revive(envelope))
        }
        _ => None,
    }
}

enum Magnitude {
    Bits(u64),
    Decimal(String),
}

fn decode_magnitude(reader: &mut BitReader<'_>) -> Option<Magnitude> {
    let class = reader.read(4)?;
    if class == CLASS_DECIMAL {
        if reader.read(3)? != TYPE_STRING {
            return None;
        }
        return decode_string_body(reader).map(Magnitude::Decimal);
    }
    let bits = *BUCKETS.get(class as usize)?;
    reader.read(bits).map(Magnitude::Bits)
}

fn decode_string_body(reader: &mut BitReader<'_>) -> Option<String> {
    let len = match reader.read(5)? {
        LEN_8 => reader.read(8)?,
        LEN_16 => reader.read(16)?,
        LEN_32 => reader.read(32)?,
        direct => direct,
    };
    let raw = reader.read_bytes(usize::try_from(len).ok()?)?;
    String::from_utf8(raw.to_vec()).ok()
}
